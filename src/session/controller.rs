use std::fmt::{Display, Formatter};
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cell::{Commit, SnapshotCell, SnapshotFeed, SnapshotWatcher, Ticket};
use super::snapshot::{Snapshot, SnapshotShape};
use crate::config::SessionConfig;
use crate::identity::{
    AuthEvent, Identity, IdentityProvider, ProfileStore, Role, Session, SessionChange, SubscriptionHandle,
};

/// Outcome of one resolution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Published(Snapshot),
    /// A newer resolution was published first; this one was discarded.
    Superseded { generation: u64 },
    Disposed,
}

impl Resolution {
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            Resolution::Published(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Origin {
    Bootstrap,
    Change(AuthEvent),
}

impl Display for Origin {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Bootstrap => f.write_str("bootstrap"),
            Origin::Change(ev) => write!(f, "change:{:?}", ev),
        }
    }
}

struct Inner {
    cell: SnapshotCell,
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn ProfileStore>,
    config: SessionConfig,
}

impl Inner {
    async fn fetch_session(&self, generation: u64) -> Option<Session> {
        let limit = self.config.session_fetch_timeout();
        match tokio::time::timeout(limit, self.provider.current_session()).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                error!(target: "odtrack::session", "session.bootstrap gen={} fetch failed, resolving as signed out: {}", generation, e);
                None
            }
            Err(_) => {
                error!(target: "odtrack::session", "session.bootstrap gen={} fetch timed out after {} ms, resolving as signed out", generation, limit.as_millis());
                None
            }
        }
    }

    /// Fresh role lookup for `identity`. Every failure mode yields `None`.
    async fn lookup_role(&self, identity: &Identity, generation: u64) -> Option<Role> {
        let limit = self.config.role_lookup_timeout();
        let id = &identity.id;
        match tokio::time::timeout(limit, self.store.profile_for(id)).await {
            Ok(Ok(Some(record))) => match record.role() {
                Some(role) => {
                    if !role.is_recognized() {
                        warn!(target: "odtrack::session", "session.role gen={} identity={} unrecognized role '{}'", generation, id, role);
                    }
                    Some(role)
                }
                None => {
                    warn!(target: "odtrack::session", "session.role gen={} identity={} profile has no role", generation, id);
                    None
                }
            },
            Ok(Ok(None)) => {
                warn!(target: "odtrack::session", "session.role gen={} identity={} no profile row", generation, id);
                None
            }
            Ok(Err(e)) => {
                warn!(target: "odtrack::session", "session.role gen={} identity={} lookup failed: {}", generation, id, e);
                None
            }
            Err(_) => {
                warn!(target: "odtrack::session", "session.role gen={} identity={} lookup timed out after {} ms", generation, id, limit.as_millis());
                None
            }
        }
    }

    async fn resolve(&self, ticket: Ticket, session: Option<Session>, origin: Origin) -> Resolution {
        let generation = ticket.generation();
        let identity = session.map(|s| s.identity);
        let role = match &identity {
            Some(identity) => self.lookup_role(identity, generation).await,
            None => None,
        };
        match self.cell.commit(ticket, identity, role) {
            Commit::Published(snapshot) => {
                info!(
                    target: "odtrack::session",
                    "session.resolved gen={} origin={} identity={} role={}",
                    generation,
                    origin,
                    snapshot.identity().map(|i| i.id.as_str()).unwrap_or("-"),
                    snapshot.role().map(Role::as_str).unwrap_or("-"),
                );
                self.remediate(&snapshot).await;
                Resolution::Published(snapshot)
            }
            Commit::Stale { ticket, current } => {
                debug!(target: "odtrack::session", "session.discard gen={} origin={} superseded by gen={}", ticket, origin, current);
                Resolution::Superseded { generation: ticket }
            }
            Commit::Disposed => {
                debug!(target: "odtrack::session", "session.discard gen={} origin={} controller disposed", generation, origin);
                Resolution::Disposed
            }
        }
    }

    async fn remediate(&self, snapshot: &Snapshot) {
        if !self.config.sign_out_on_unresolved_role {
            return;
        }
        if let SnapshotShape::Authenticated { identity, role } = snapshot.shape() {
            if role.is_some_and(Role::is_recognized) {
                return;
            }
            warn!(target: "odtrack::session", "session.remediate identity={} has no usable role, signing out", identity.id);
            if let Err(e) = self.provider.sign_out().await {
                error!(target: "odtrack::session", "session.remediate identity={} sign-out failed: {}", identity.id, e);
            }
        }
    }
}

/// Consume change notifications in arrival order until stopped.
///
/// Each notification takes the next generation and publishes loading before its
/// lookup starts. Lookups run concurrently on this task; the cell drops any that
/// finish behind a newer publish. After a stop, in-flight lookups are drained.
async fn drive(inner: Arc<Inner>, mut changes: mpsc::UnboundedReceiver<SessionChange>, mut stop: oneshot::Receiver<()>) {
    let mut in_flight = FuturesUnordered::new();
    let mut accepting = true;
    loop {
        tokio::select! {
            biased;
            _ = &mut stop, if accepting => {
                debug!(target: "odtrack::session", "session.driver stop requested in_flight={}", in_flight.len());
                accepting = false;
            }
            change = changes.recv(), if accepting => match change {
                Some(SessionChange { event, session }) => match inner.cell.begin() {
                    Some(ticket) => {
                        debug!(target: "odtrack::session", "session.change gen={} event={:?} session={}", ticket.generation(), event, session.is_some());
                        let inner = inner.clone();
                        in_flight.push(async move { inner.resolve(ticket, session, Origin::Change(event)).await });
                    }
                    None => accepting = false,
                },
                None => {
                    debug!(target: "odtrack::session", "session.driver change stream closed");
                    accepting = false;
                }
            },
            Some(_) = in_flight.next(), if !in_flight.is_empty() => {}
            else => break,
        }
    }
    debug!(target: "odtrack::session", "session.driver exited");
}

/// Owns the session snapshot and keeps it current from bootstrap and the change stream.
pub struct SessionController {
    inner: Arc<Inner>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Subscribe to identity changes and spawn the notification driver.
    /// Must be called from within a tokio runtime.
    pub fn start(provider: Arc<dyn IdentityProvider>, store: Arc<dyn ProfileStore>, config: SessionConfig) -> Self {
        let subscription = provider.on_session_change();
        let inner = Arc::new(Inner { cell: SnapshotCell::new(), provider, store, config });
        let (stop_tx, stop_rx) = oneshot::channel();
        let driver = tokio::spawn(drive(inner.clone(), subscription.changes, stop_rx));
        info!(target: "odtrack::session", "session.start subscribed to identity changes");
        Self {
            inner,
            subscription: Mutex::new(Some(subscription.handle)),
            stop: Mutex::new(Some(stop_tx)),
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Bootstrap from the identity provider's current session.
    pub async fn initialize(&self) -> Resolution {
        let Some(ticket) = self.inner.cell.begin() else { return Resolution::Disposed };
        let generation = ticket.generation();
        debug!(target: "odtrack::session", "session.bootstrap gen={} started", generation);
        let session = self.inner.fetch_session(generation).await;
        self.inner.resolve(ticket, session, Origin::Bootstrap).await
    }

    pub fn snapshot(&self) -> Snapshot { self.inner.cell.current() }

    pub fn watch(&self) -> SnapshotWatcher { self.inner.cell.watch() }

    /// Every publish from now on, loading ones included. Ends after the controller is dropped.
    pub fn feed(&self) -> SnapshotFeed { self.inner.cell.feed() }

    pub fn config(&self) -> &SessionConfig { &self.inner.config }

    pub fn is_disposed(&self) -> bool { self.inner.cell.is_disposed() }

    /// Stop publishing and release the subscription. Returns `true` on the first call only.
    pub fn dispose(&self) -> bool {
        if !self.inner.cell.dispose() {
            return false;
        }
        if let Some(handle) = self.subscription.lock().take() {
            handle.unsubscribe();
        }
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
        info!(target: "odtrack::session", "session.dispose unsubscribed");
        true
    }

    /// Dispose and wait for in-flight lookups to drain.
    pub async fn shutdown(self) {
        self.dispose();
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                error!(target: "odtrack::session", "session.driver join failed: {}", e);
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) { self.dispose(); }
}
