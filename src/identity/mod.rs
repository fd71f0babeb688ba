//! Identity boundary: who the principal is, what role the profile store gives it,
//! and the provider contracts the session core consumes.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod role;
mod provider;
pub mod memory;

pub use principal::{AuthEvent, Identity, IdentityId, Session, SessionChange};
pub use role::{ProfileRecord, Role};
pub use provider::{IdentityProvider, ProfileStore, ProviderError, SessionSubscription, SubscriptionHandle};
