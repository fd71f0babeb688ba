use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const ENV_SESSION_FETCH_TIMEOUT_MS: &str = "ODTRACK_SESSION_FETCH_TIMEOUT_MS";
pub const ENV_ROLE_LOOKUP_TIMEOUT_MS: &str = "ODTRACK_ROLE_LOOKUP_TIMEOUT_MS";
pub const ENV_SIGN_OUT_ON_UNRESOLVED_ROLE: &str = "ODTRACK_SIGN_OUT_ON_UNRESOLVED_ROLE";

/// Session controller settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on the bootstrap session fetch; expiry counts as a fetch failure.
    pub session_fetch_timeout_ms: u64,
    /// Upper bound on each role lookup; expiry counts as a lookup failure.
    pub role_lookup_timeout_ms: u64,
    /// Sign the identity out when its role cannot be resolved to a known capability.
    pub sign_out_on_unresolved_role: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_fetch_timeout_ms: 10_000,
            role_lookup_timeout_ms: 10_000,
            sign_out_on_unresolved_role: false,
        }
    }
}

fn parse_u64(v: Option<String>) -> Option<u64> { v.and_then(|s| s.trim().parse::<u64>().ok()) }

fn parse_bool(v: Option<String>) -> Option<bool> {
    let s = v?.to_lowercase();
    match s.trim() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl SessionConfig {
    pub fn session_fetch_timeout(&self) -> Duration { Duration::from_millis(self.session_fetch_timeout_ms) }
    pub fn role_lookup_timeout(&self) -> Duration { Duration::from_millis(self.role_lookup_timeout_ms) }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("invalid session config")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading session config {}", path.display()))?;
        Self::from_json_str(&text)
    }

    /// Overlay values from the process environment; unparsable values are ignored.
    pub fn with_env(self) -> Self { self.with_lookup(|k| std::env::var(k).ok()) }

    /// Overlay values from an arbitrary key lookup.
    pub fn with_lookup<F: Fn(&str) -> Option<String>>(mut self, lookup: F) -> Self {
        if let Some(ms) = parse_u64(lookup(ENV_SESSION_FETCH_TIMEOUT_MS)) {
            self.session_fetch_timeout_ms = ms;
        }
        if let Some(ms) = parse_u64(lookup(ENV_ROLE_LOOKUP_TIMEOUT_MS)) {
            self.role_lookup_timeout_ms = ms;
        }
        if let Some(b) = parse_bool(lookup(ENV_SIGN_OUT_ON_UNRESOLVED_ROLE)) {
            self.sign_out_on_unresolved_role = b;
        }
        self
    }
}
