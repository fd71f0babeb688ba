//! In-memory identity provider and profile store.
//! Used by the integration tests and the `od_session` driver. Both support
//! failure injection and latency gates so interleavings can be forced.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use base64::Engine;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use super::principal::{AuthEvent, Identity, IdentityId, Session, SessionChange};
use super::provider::{IdentityProvider, ProfileStore, ProviderError, SessionSubscription, SubscriptionHandle};
use super::role::ProfileRecord;

fn gen_token() -> Result<String, ProviderError> {
    // 256-bit random token base64url without padding
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).map_err(|e| {
        error!(target: "odtrack::memory", "provider.token entropy source failed: {}", e);
        ProviderError::Rejected(format!("token generation failed: {e}"))
    })?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

/// Holds an operation until [`Gate::release`] is called.
#[derive(Debug)]
pub struct Gate {
    tx: watch::Sender<bool>,
}

impl Gate {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    pub fn release(&self) { self.tx.send_replace(true); }
}

async fn pass(gate: Option<watch::Receiver<bool>>) {
    if let Some(mut rx) = gate {
        // A dropped Gate counts as released.
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[derive(Debug, Clone)]
struct Account {
    identity: Identity,
    password: String,
    confirmed: bool,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<SessionChange>>,
    broadcasts: u64,
}

impl Listeners {
    fn broadcast(&mut self, change: &SessionChange) {
        self.broadcasts += 1;
        self.senders.retain(|_, tx| tx.send(change.clone()).is_ok());
    }
}

#[derive(Default)]
struct ProviderState {
    accounts: HashMap<String, Account>,
    current: Option<Session>,
    fail_next_fetch: Option<ProviderError>,
    fail_next_sign_out: Option<ProviderError>,
    fetch_gate: Option<watch::Receiver<bool>>,
    sign_outs: usize,
}

pub struct InMemoryIdentityProvider {
    ttl: Duration,
    announce_initial_session: bool,
    state: RwLock<ProviderState>,
    listeners: Arc<RwLock<Listeners>>,
}

impl Default for InMemoryIdentityProvider {
    fn default() -> Self { Self::with_ttl(Duration::hours(1)) }
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self { Self::default() }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            announce_initial_session: false,
            state: RwLock::new(ProviderState::default()),
            listeners: Arc::new(RwLock::new(Listeners::default())),
        }
    }

    /// Greet every new subscriber with an `InitialSession` change carrying the current session.
    pub fn with_initial_session_event(mut self) -> Self {
        self.announce_initial_session = true;
        self
    }

    /// Create a confirmed account with a fresh identity id.
    pub fn register(&self, email: &str, password: &str) -> Identity {
        self.register_with_id(IdentityId::new(uuid::Uuid::new_v4().to_string()), email, password)
    }

    pub fn register_with_id(&self, id: IdentityId, email: &str, password: &str) -> Identity {
        let identity = Identity::new(id).with_email(email);
        let account = Account { identity: identity.clone(), password: password.to_string(), confirmed: true };
        self.state.write().accounts.insert(email.to_lowercase(), account);
        identity
    }

    pub fn set_confirmed(&self, email: &str, confirmed: bool) {
        if let Some(acct) = self.state.write().accounts.get_mut(&email.to_lowercase()) {
            acct.confirmed = confirmed;
        }
    }

    fn issue(&self, identity: Identity) -> Result<Session, ProviderError> {
        let now = Utc::now();
        Ok(Session { access_token: gen_token()?, identity, issued_at: now, expires_at: now + self.ttl })
    }

    /// Install a session without notifying listeners, as if restored from device storage.
    pub fn restore_session(&self, email: &str) -> Option<Session> {
        let mut st = self.state.write();
        let identity = st.accounts.get(&email.to_lowercase())?.identity.clone();
        let session = self.issue(identity).ok()?;
        st.current = Some(session.clone());
        Some(session)
    }

    /// Issue a new token for the current session and announce it.
    pub fn refresh(&self) -> Option<Session> {
        let session = {
            let mut st = self.state.write();
            let identity = st.current.as_ref()?.identity.clone();
            let session = self.issue(identity).ok()?;
            st.current = Some(session.clone());
            session
        };
        self.emit(SessionChange { event: AuthEvent::TokenRefreshed, session: Some(session.clone()) });
        Some(session)
    }

    /// Change the signed-in account's email and announce the updated identity.
    pub fn update_email(&self, email: &str) -> Option<Session> {
        let session = {
            let mut st = self.state.write();
            let mut session = st.current.clone()?;
            let old_key = session.identity.email.as_deref().map(str::to_lowercase);
            if let Some(mut acct) = old_key.and_then(|k| st.accounts.remove(&k)) {
                acct.identity.email = Some(email.to_string());
                st.accounts.insert(email.to_lowercase(), acct);
            }
            session.identity.email = Some(email.to_string());
            st.current = Some(session.clone());
            session
        };
        self.emit(SessionChange { event: AuthEvent::UserUpdated, session: Some(session.clone()) });
        Some(session)
    }

    /// Drop the current session as if it lapsed, announcing the sign-out.
    pub fn expire(&self) {
        let had = self.state.write().current.take().is_some();
        if had {
            self.emit(SessionChange::signed_out());
        }
    }

    /// Deliver an arbitrary notification to every listener.
    pub fn emit(&self, change: SessionChange) {
        debug!(target: "odtrack::memory", "provider.emit event={:?} session={}", change.event, change.session.is_some());
        self.listeners.write().broadcast(&change);
    }

    pub fn fail_next_fetch(&self, err: ProviderError) { self.state.write().fail_next_fetch = Some(err); }

    pub fn fail_next_sign_out(&self, err: ProviderError) { self.state.write().fail_next_sign_out = Some(err); }

    /// Hold the next `current_session` call until the returned gate is released.
    pub fn hold_next_fetch(&self) -> Gate {
        let (gate, rx) = Gate::new();
        self.state.write().fetch_gate = Some(rx);
        gate
    }

    pub fn listener_count(&self) -> usize { self.listeners.read().senders.len() }

    /// Changes broadcast so far, whether or not anyone was listening.
    pub fn emitted_count(&self) -> u64 { self.listeners.read().broadcasts }

    pub fn sign_out_count(&self) -> usize { self.state.read().sign_outs }

    pub fn current(&self) -> Option<Session> { self.state.read().current.clone() }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    async fn current_session(&self) -> Result<Option<Session>, ProviderError> {
        let gate = self.state.write().fetch_gate.take();
        pass(gate).await;
        let mut st = self.state.write();
        if let Some(err) = st.fail_next_fetch.take() {
            return Err(err);
        }
        if st.current.as_ref().is_some_and(|s| s.is_expired_at(Utc::now())) {
            st.current = None;
        }
        Ok(st.current.clone())
    }

    fn on_session_change(&self) -> SessionSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.announce_initial_session {
            let change = SessionChange { event: AuthEvent::InitialSession, session: self.state.read().current.clone() };
            let _ = tx.send(change);
        }
        let id = {
            let mut l = self.listeners.write();
            let id = l.next_id;
            l.next_id += 1;
            l.senders.insert(id, tx);
            id
        };
        let weak: Weak<RwLock<Listeners>> = Arc::downgrade(&self.listeners);
        let handle = SubscriptionHandle::new(move || {
            if let Some(listeners) = weak.upgrade() {
                listeners.write().senders.remove(&id);
                debug!(target: "odtrack::memory", "provider.unsubscribe listener={}", id);
            }
        });
        SessionSubscription { changes: rx, handle }
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, ProviderError> {
        let session = {
            let mut st = self.state.write();
            let acct = match st.accounts.get(&email.to_lowercase()) {
                Some(a) if a.password == password => a.clone(),
                _ => return Err(ProviderError::InvalidCredentials),
            };
            if !acct.confirmed {
                return Err(ProviderError::EmailNotConfirmed);
            }
            let session = self.issue(acct.identity)?;
            st.current = Some(session.clone());
            session
        };
        self.emit(SessionChange::signed_in(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        {
            let mut st = self.state.write();
            if let Some(err) = st.fail_next_sign_out.take() {
                return Err(err);
            }
            st.sign_outs += 1;
            st.current = None;
        }
        self.emit(SessionChange::signed_out());
        Ok(())
    }
}

#[derive(Default)]
struct StoreState {
    profiles: HashMap<IdentityId, Option<String>>,
    failures: HashMap<IdentityId, ProviderError>,
    gates: HashMap<IdentityId, watch::Receiver<bool>>,
    lookups: usize,
}

#[derive(Default)]
pub struct InMemoryProfileStore {
    state: RwLock<StoreState>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self { Self::default() }

    /// Upsert a profile row. `None` stores a row whose role is null.
    pub fn set_role(&self, id: &IdentityId, role: Option<&str>) {
        self.state.write().profiles.insert(id.clone(), role.map(str::to_string));
    }

    pub fn remove_profile(&self, id: &IdentityId) { self.state.write().profiles.remove(id); }

    /// Every lookup for `id` fails with `err` until [`Self::clear_failure`].
    pub fn fail_lookups_for(&self, id: &IdentityId, err: ProviderError) {
        self.state.write().failures.insert(id.clone(), err);
    }

    pub fn clear_failure(&self, id: &IdentityId) { self.state.write().failures.remove(id); }

    /// Hold every lookup for `id` until the returned gate is released.
    pub fn hold_lookups_for(&self, id: &IdentityId) -> Gate {
        let (gate, rx) = Gate::new();
        self.state.write().gates.insert(id.clone(), rx);
        gate
    }

    pub fn lookup_count(&self) -> usize { self.state.read().lookups }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn profile_for(&self, id: &IdentityId) -> Result<Option<ProfileRecord>, ProviderError> {
        let gate = {
            let mut st = self.state.write();
            st.lookups += 1;
            st.gates.get(id).cloned()
        };
        pass(gate).await;
        let st = self.state.read();
        if let Some(err) = st.failures.get(id) {
            return Err(err.clone());
        }
        Ok(st.profiles.get(id).map(|role| ProfileRecord { identity_id: id.clone(), role: role.clone() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_in_notifies_listeners_and_unsubscribe_stops_delivery() {
        let idp = InMemoryIdentityProvider::new();
        idp.register("a@uni.edu", "pw");
        let mut sub = idp.on_session_change();
        assert_eq!(idp.listener_count(), 1);

        let session = idp.sign_in_with_password("a@uni.edu", "pw").await.unwrap();
        let change = sub.changes.recv().await.unwrap();
        assert_eq!(change.event, AuthEvent::SignedIn);
        assert_eq!(change.session.as_ref(), Some(&session));

        sub.handle.unsubscribe();
        assert_eq!(idp.listener_count(), 0);
        idp.sign_out().await.unwrap();
        assert!(sub.changes.recv().await.is_none());
    }

    #[tokio::test]
    async fn sign_in_errors() {
        let idp = InMemoryIdentityProvider::new();
        idp.register("a@uni.edu", "pw");
        assert_eq!(idp.sign_in_with_password("a@uni.edu", "nope").await, Err(ProviderError::InvalidCredentials));
        idp.set_confirmed("a@uni.edu", false);
        assert_eq!(idp.sign_in_with_password("a@uni.edu", "pw").await, Err(ProviderError::EmailNotConfirmed));
    }

    #[tokio::test]
    async fn issued_tokens_are_fresh_base64url() {
        let idp = InMemoryIdentityProvider::new();
        idp.register("a@uni.edu", "pw");
        let first = idp.sign_in_with_password("a@uni.edu", "pw").await.unwrap();
        let second = idp.refresh().unwrap();
        assert_eq!(first.access_token.len(), 43);
        assert!(first.access_token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(first.access_token, second.access_token);
        assert!(gen_token().is_ok());
    }

    #[tokio::test]
    async fn initial_session_event_is_opt_in() {
        let idp = InMemoryIdentityProvider::new();
        idp.register("a@uni.edu", "pw");
        let session = idp.restore_session("a@uni.edu").unwrap();
        let mut quiet = idp.on_session_change();
        assert!(quiet.changes.try_recv().is_err());

        let idp = idp.with_initial_session_event();
        let mut greeted = idp.on_session_change();
        let change = greeted.changes.try_recv().unwrap();
        assert_eq!(change.event, AuthEvent::InitialSession);
        assert_eq!(change.session.map(|s| s.access_token), Some(session.access_token));
        assert_eq!(idp.emitted_count(), 0);
    }

    #[tokio::test]
    async fn update_email_announces_user_updated() {
        let idp = InMemoryIdentityProvider::new();
        let identity = idp.register("a@uni.edu", "pw");
        let mut sub = idp.on_session_change();
        assert!(idp.update_email("b@uni.edu").is_none());

        idp.sign_in_with_password("a@uni.edu", "pw").await.unwrap();
        let updated = idp.update_email("b@uni.edu").unwrap();
        assert_eq!(updated.identity.id, identity.id);
        assert_eq!(updated.identity.email.as_deref(), Some("b@uni.edu"));

        assert_eq!(sub.changes.recv().await.unwrap().event, AuthEvent::SignedIn);
        let change = sub.changes.recv().await.unwrap();
        assert_eq!(change.event, AuthEvent::UserUpdated);
        assert_eq!(change.session.unwrap().identity.email.as_deref(), Some("b@uni.edu"));
        assert_eq!(idp.emitted_count(), 2);

        idp.sign_out().await.unwrap();
        assert!(idp.sign_in_with_password("b@uni.edu", "pw").await.is_ok());
        assert_eq!(idp.sign_in_with_password("a@uni.edu", "pw").await, Err(ProviderError::InvalidCredentials));
    }

    #[tokio::test]
    async fn expired_session_is_not_returned() {
        let idp = InMemoryIdentityProvider::with_ttl(Duration::seconds(-1));
        idp.register("a@uni.edu", "pw");
        idp.restore_session("a@uni.edu");
        assert_eq!(idp.current_session().await.unwrap(), None);
    }

    #[tokio::test]
    async fn profile_store_distinguishes_missing_and_null_role() {
        let store = InMemoryProfileStore::new();
        let id = IdentityId::new("u1");
        assert_eq!(store.profile_for(&id).await.unwrap(), None);
        store.set_role(&id, None);
        let rec = store.profile_for(&id).await.unwrap().unwrap();
        assert_eq!(rec.role, None);
        store.fail_lookups_for(&id, ProviderError::Transport("down".into()));
        assert!(store.profile_for(&id).await.is_err());
        assert_eq!(store.lookup_count(), 3);
    }
}
