use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use super::principal::IdentityId;

/// Capability tag read from the profile store.
///
/// Only exact `student` and `club` are recognized. Any other value is kept as
/// [`Role::Unrecognized`] so the router can fail closed on it explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Student,
    Club,
    Unrecognized(String),
}

impl Role {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "student" => Role::Student,
            "club" => Role::Club,
            other => Role::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::Student => "student",
            Role::Club => "club",
            Role::Unrecognized(raw) => raw.as_str(),
        }
    }

    pub fn is_recognized(&self) -> bool { !matches!(self, Role::Unrecognized(_)) }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

impl From<String> for Role {
    fn from(raw: String) -> Self { Role::parse(&raw) }
}

impl From<Role> for String {
    fn from(role: Role) -> Self { role.as_str().to_string() }
}

/// A row of the profile store. `role` may be null on a row that exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub identity_id: IdentityId,
    #[serde(default)]
    pub role: Option<String>,
}

impl ProfileRecord {
    pub fn role(&self) -> Option<Role> { self.role.as_deref().map(Role::parse) }
}
