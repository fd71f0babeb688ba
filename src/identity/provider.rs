use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::principal::{IdentityId, Session, SessionChange};
use super::role::ProfileRecord;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("invalid login credentials")]
    InvalidCredentials,
    #[error("email not confirmed")]
    EmailNotConfirmed,
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Issues and validates sessions and announces every session transition.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Session currently held by the provider, if any.
    async fn current_session(&self) -> Result<Option<Session>, ProviderError>;

    /// Register a listener. Notifications arrive in the order the provider observed them.
    fn on_session_change(&self) -> SessionSubscription;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, ProviderError>;

    async fn sign_out(&self) -> Result<(), ProviderError>;
}

/// Maps an identity to its profile row.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// `Ok(None)` when no profile row exists for `id`.
    async fn profile_for(&self, id: &IdentityId) -> Result<Option<ProfileRecord>, ProviderError>;
}

pub struct SessionSubscription {
    pub changes: mpsc::UnboundedReceiver<SessionChange>,
    pub handle: SubscriptionHandle,
}

/// Tears a listener down. Consumed on use, so a subscription is released at most once.
pub struct SubscriptionHandle {
    release: Box<dyn FnOnce() + Send>,
}

impl SubscriptionHandle {
    pub fn new<F: FnOnce() + Send + 'static>(release: F) -> Self { Self { release: Box::new(release) } }

    pub fn unsubscribe(self) { (self.release)() }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("SubscriptionHandle") }
}
