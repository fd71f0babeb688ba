//! Role-gated portal login.
//!
//! Students and clubs sign in through separate portals. A successful password
//! sign-in is only kept when the profile store confirms the account belongs to
//! that portal; otherwise the session is signed out again. Routing afterwards is
//! driven entirely by the session controller reacting to the provider's
//! change notifications.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult};
use crate::identity::{IdentityProvider, ProfileStore, ProviderError, Role, Session};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern"));

const GENERIC_LOGIN_FAILURE: &str = "Failed to login. Please check your email and password.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Portal {
    Student,
    Club,
}

impl Portal {
    pub fn role(&self) -> Role {
        match self {
            Portal::Student => Role::Student,
            Portal::Club => Role::Club,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Portal::Student => "student",
            Portal::Club => "club",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new<S: Into<String>>(email: S, password: S) -> Self { Self { email: email.into(), password: password.into() } }

    pub fn validate(&self) -> AppResult<()> {
        if self.email.trim().is_empty() {
            return Err(AppError::user("email_required", "Email is required"));
        }
        if self.password.trim().is_empty() {
            return Err(AppError::user("password_required", "Password is required"));
        }
        if !EMAIL_RE.is_match(&self.email) {
            return Err(AppError::user("email_invalid", "Please enter a valid email address"));
        }
        Ok(())
    }
}

fn login_error(err: ProviderError) -> AppError {
    match err {
        ProviderError::InvalidCredentials | ProviderError::EmailNotConfirmed => err.into(),
        ProviderError::Transport(_) | ProviderError::Timeout(_) => AppError::unavailable("login_failed", GENERIC_LOGIN_FAILURE),
        ProviderError::Rejected(_) => AppError::auth("login_failed", GENERIC_LOGIN_FAILURE),
    }
}

pub struct PortalLogin {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn ProfileStore>,
}

impl PortalLogin {
    pub fn new(provider: Arc<dyn IdentityProvider>, store: Arc<dyn ProfileStore>) -> Self { Self { provider, store } }

    pub async fn sign_in(&self, portal: Portal, creds: &Credentials) -> AppResult<Session> {
        creds.validate()?;
        let session = self.provider.sign_in_with_password(&creds.email, &creds.password).await.map_err(|e| {
            warn!(target: "odtrack::login", "login.sign_in portal={} failed: {}", portal.label(), e);
            login_error(e)
        })?;
        let id = session.identity_id().clone();

        let record = match self.store.profile_for(&id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(target: "odtrack::login", "login.profile portal={} identity={} no profile row", portal.label(), id);
                return Err(AppError::auth("profile_missing", GENERIC_LOGIN_FAILURE));
            }
            Err(e) => {
                warn!(target: "odtrack::login", "login.profile portal={} identity={} lookup failed: {}", portal.label(), id, e);
                return Err(login_error(e));
            }
        };

        if record.role() != Some(portal.role()) {
            warn!(
                target: "odtrack::login",
                "login.role_mismatch portal={} identity={} role={}",
                portal.label(),
                id,
                record.role.as_deref().unwrap_or("-")
            );
            if let Err(e) = self.provider.sign_out().await {
                error!(target: "odtrack::login", "login.role_mismatch identity={} sign-out failed: {}", id, e);
            }
            return Err(AppError::Forbidden {
                code: "role_mismatch".into(),
                message: format!(
                    "This account is not registered as a {}. Please use the correct login page.",
                    portal.label()
                ),
            });
        }

        info!(target: "odtrack::login", "login.ok portal={} identity={}", portal.label(), id);
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_order_and_messages() {
        assert_eq!(Credentials::new("  ", "pw").validate().unwrap_err().code_str(), "email_required");
        assert_eq!(Credentials::new("a@b.co", " ").validate().unwrap_err().code_str(), "password_required");
        assert_eq!(Credentials::new("not-an-email", "pw").validate().unwrap_err().code_str(), "email_invalid");
        assert_eq!(Credentials::new("a b@c.io", "pw").validate().unwrap_err().code_str(), "email_invalid");
        assert!(Credentials::new("s1@college.edu", "pw").validate().is_ok());
    }

    #[test]
    fn transport_failures_are_retryable() {
        assert!(login_error(ProviderError::Transport("x".into())).is_retryable());
        assert_eq!(login_error(ProviderError::EmailNotConfirmed).code_str(), "email_not_confirmed");
    }
}
