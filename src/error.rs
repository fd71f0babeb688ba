//! Unified application error model.
//! Provider and store failures inside the session controller never reach this type:
//! they are folded into snapshots. `AppError` is what user-driven flows such as
//! portal login return to the UI.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::identity::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    UserInput { code: String, message: String },
    Auth { code: String, message: String },
    Forbidden { code: String, message: String },
    Unavailable { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::UserInput { code, .. }
            | AppError::Auth { code, .. }
            | AppError::Forbidden { code, .. }
            | AppError::Unavailable { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::UserInput { message, .. }
            | AppError::Auth { message, .. }
            | AppError::Forbidden { message, .. }
            | AppError::Unavailable { message, .. } => message.as_str(),
        }
    }

    pub fn user<S: Into<String>>(code: S, msg: S) -> Self { AppError::UserInput { code: code.into(), message: msg.into() } }
    pub fn auth<S: Into<String>>(code: S, msg: S) -> Self { AppError::Auth { code: code.into(), message: msg.into() } }
    pub fn forbidden<S: Into<String>>(code: S, msg: S) -> Self { AppError::Forbidden { code: code.into(), message: msg.into() } }
    pub fn unavailable<S: Into<String>>(code: S, msg: S) -> Self { AppError::Unavailable { code: code.into(), message: msg.into() } }

    /// Whether retrying the same request later could succeed.
    pub fn is_retryable(&self) -> bool { matches!(self, AppError::Unavailable { .. }) }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidCredentials => AppError::auth("invalid_credentials", "Incorrect email or password."),
            ProviderError::EmailNotConfirmed => {
                AppError::auth("email_not_confirmed", "Please verify your email before logging in.")
            }
            ProviderError::Transport(_) | ProviderError::Timeout(_) => AppError::Unavailable {
                code: "provider_unavailable".into(),
                message: err.to_string(),
            },
            ProviderError::Rejected(msg) => AppError::Auth { code: "rejected".into(), message: msg },
        }
    }
}
