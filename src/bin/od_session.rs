//!
//! od_session
//! ----------
//! Drives the session controller over the in-memory identity provider and
//! profile store from a JSON scenario script, printing every observed snapshot
//! and its render target as one JSON line. Configuration comes from defaults,
//! an optional JSON file, environment variables and CLI flags, in that order.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use odtrack::config::SessionConfig;
use odtrack::identity::memory::{InMemoryIdentityProvider, InMemoryProfileStore};
use odtrack::identity::{IdentityId, IdentityProvider, ProviderError};
use odtrack::login::{Credentials, Portal, PortalLogin};
use odtrack::router::route;
use odtrack::session::{SessionController, Snapshot, SnapshotFeed, SnapshotWatcher};

#[derive(Debug, Deserialize)]
struct Script {
    #[serde(default)]
    accounts: Vec<AccountSpec>,
    /// Email of an account whose session is already on the device at startup.
    #[serde(default)]
    restore: Option<String>,
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
struct AccountSpec {
    #[serde(default)]
    id: Option<String>,
    email: String,
    password: String,
    #[serde(default)]
    role: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Step {
    Bootstrap,
    SignIn { email: String, password: String },
    PortalLogin { portal: Portal, email: String, password: String },
    SignOut,
    Refresh,
    Expire,
    SetRole { email: String, role: Option<String> },
    FailLookups { email: String },
    ClearFailure { email: String },
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        i += 1;
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool { args.iter().any(|a| a == flag) }

fn print_snapshot(snap: &Snapshot) {
    let line = json!({
        "generation": snap.generation(),
        "state": snap.state(),
        "identity": snap.identity().map(|i| i.id.as_str()),
        "role": snap.role(),
        "target": route(snap),
    });
    println!("{}", line);
}

/// Print `initial` and then every later publish once, until the controller is gone.
async fn print_changes(initial: Snapshot, mut feed: SnapshotFeed) {
    print_snapshot(&initial);
    while let Some(snap) = feed.next().await {
        if snap != initial {
            print_snapshot(&snap);
        }
    }
}

/// Wait until the `emitted` changes a step produced after generation `before` are resolved.
/// Returns `false` if that does not happen within `limit`.
async fn settle(watcher: &mut SnapshotWatcher, before: u64, emitted: u64, limit: Duration) -> bool {
    if emitted == 0 {
        return true;
    }
    let target = before + emitted;
    match tokio::time::timeout(limit, watcher.wait_for(|s| s.generation() >= target && !s.is_loading())).await {
        Ok(Some(_)) => true,
        Ok(None) => false,
        Err(_) => {
            warn!(target: "odtrack", "od_session gave up waiting for gen={} after {} ms", target, limit.as_millis());
            false
        }
    }
}

fn settle_limit(config: &SessionConfig) -> Duration {
    config.session_fetch_timeout() + config.role_lookup_timeout() * 2
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let args: Vec<String> = env::args().collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("od_session\n\nUSAGE:\n  od_session --script PATH [--config PATH] [--sign-out-on-unresolved-role]\n\nOPTIONS:\n  --script PATH                   JSON scenario (accounts, restore, steps)\n  --config PATH                   JSON session config file\n  --sign-out-on-unresolved-role   Sign out identities without a recognized role\n\nENVIRONMENT:\n  ODTRACK_SESSION_FETCH_TIMEOUT_MS, ODTRACK_ROLE_LOOKUP_TIMEOUT_MS,\n  ODTRACK_SIGN_OUT_ON_UNRESOLVED_ROLE, RUST_LOG\n");
        return Ok(());
    }

    let script_path = arg_value(&args, "--script").map(PathBuf::from).ok_or_else(|| anyhow!("--script PATH is required"))?;
    let mut config = match arg_value(&args, "--config") {
        Some(p) => SessionConfig::from_file(&PathBuf::from(p))?,
        None => SessionConfig::default(),
    }
    .with_env();
    if has_flag(&args, "--sign-out-on-unresolved-role") {
        config.sign_out_on_unresolved_role = true;
    }

    let text = std::fs::read_to_string(&script_path).with_context(|| format!("reading script {}", script_path.display()))?;
    let script: Script = serde_json::from_str(&text).context("invalid scenario script")?;

    let idp = Arc::new(InMemoryIdentityProvider::new());
    let store = Arc::new(InMemoryProfileStore::new());
    let mut ids: HashMap<String, IdentityId> = HashMap::new();
    for acct in &script.accounts {
        let identity = match &acct.id {
            Some(id) => idp.register_with_id(IdentityId::new(id.clone()), &acct.email, &acct.password),
            None => idp.register(&acct.email, &acct.password),
        };
        store.set_role(&identity.id, acct.role.as_deref());
        ids.insert(acct.email.to_lowercase(), identity.id);
    }
    if let Some(email) = &script.restore {
        idp.restore_session(email).ok_or_else(|| anyhow!("restore: unknown account {}", email))?;
    }
    let id_for = |email: &str| ids.get(&email.to_lowercase()).cloned().ok_or_else(|| anyhow!("unknown account {}", email));

    let controller = SessionController::start(idp.clone(), store.clone(), config);
    info!(target: "odtrack", "od_session starting: script='{}' config={:?}", script_path.display(), controller.config());
    let feed = controller.feed();
    let printer = tokio::spawn(print_changes(controller.snapshot(), feed));
    let mut watcher = controller.watch();
    let login = PortalLogin::new(idp.clone(), store.clone());
    let limit = settle_limit(controller.config());

    for step in script.steps {
        let before = controller.snapshot().generation();
        let emitted_before = idp.emitted_count();
        match step {
            Step::Bootstrap => {
                controller.initialize().await;
            }
            Step::SignIn { email, password } => {
                if let Err(e) = idp.sign_in_with_password(&email, &password).await {
                    println!("{}", json!({ "step": "sign_in", "error": e.to_string() }));
                }
            }
            Step::PortalLogin { portal, email, password } => {
                if let Err(e) = login.sign_in(portal, &Credentials::new(email, password)).await {
                    println!("{}", json!({ "step": "portal_login", "error": e }));
                }
            }
            Step::SignOut => idp.sign_out().await?,
            Step::Refresh => {
                idp.refresh();
            }
            Step::Expire => idp.expire(),
            Step::SetRole { email, role } => store.set_role(&id_for(email.as_str())?, role.as_deref()),
            Step::FailLookups { email } => {
                store.fail_lookups_for(&id_for(email.as_str())?, ProviderError::Transport("injected failure".into()))
            }
            Step::ClearFailure { email } => store.clear_failure(&id_for(email.as_str())?),
        }
        settle(&mut watcher, before, idp.emitted_count() - emitted_before, limit).await;
    }

    drop(watcher);
    controller.shutdown().await;
    printer.await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use odtrack::identity::SessionChange;

    fn setup() -> (Arc<InMemoryIdentityProvider>, Arc<InMemoryProfileStore>, SessionController) {
        let idp = Arc::new(InMemoryIdentityProvider::new());
        let store = Arc::new(InMemoryProfileStore::new());
        let student = idp.register("s@college.edu", "pw");
        let club = idp.register("c@college.edu", "pw");
        store.set_role(&student.id, Some("student"));
        store.set_role(&club.id, Some("club"));
        let controller = SessionController::start(idp.clone(), store.clone(), SessionConfig::default());
        (idp, store, controller)
    }

    #[tokio::test]
    async fn settle_gives_up_instead_of_hanging() {
        let (idp, _store, controller) = setup();
        let mut watcher = controller.watch();
        // Counted as emitted but never delivered to the controller.
        controller.dispose();
        idp.emit(SessionChange::signed_out());
        assert!(!settle(&mut watcher, 0, 1, Duration::from_millis(50)).await);
        assert!(settle(&mut watcher, 0, 0, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn portal_login_outcomes_settle_on_their_own_changes() {
        let (idp, store, controller) = setup();
        let mut watcher = controller.watch();
        let login = PortalLogin::new(idp.clone(), store.clone());
        let limit = Duration::from_secs(5);

        // Role mismatch: signed in, then signed out again.
        let before = controller.snapshot().generation();
        let emitted_before = idp.emitted_count();
        let err = login.sign_in(Portal::Club, &Credentials::new("s@college.edu", "pw")).await.unwrap_err();
        assert_eq!(err.code_str(), "role_mismatch");
        assert_eq!(idp.emitted_count() - emitted_before, 2);
        assert!(settle(&mut watcher, before, 2, limit).await);
        assert_eq!(controller.snapshot().identity(), None);

        // Missing profile: signed in and left signed in.
        let orphan = idp.register("o@college.edu", "pw");
        store.remove_profile(&orphan.id);
        let before = controller.snapshot().generation();
        let emitted_before = idp.emitted_count();
        let err = login.sign_in(Portal::Student, &Credentials::new("o@college.edu", "pw")).await.unwrap_err();
        assert_eq!(err.code_str(), "profile_missing");
        assert!(settle(&mut watcher, before, idp.emitted_count() - emitted_before, limit).await);
        assert_eq!(controller.snapshot().identity().map(|i| &i.id), Some(&orphan.id));

        // Bad password: nothing emitted, nothing to wait for.
        let emitted_before = idp.emitted_count();
        assert!(login.sign_in(Portal::Student, &Credentials::new("s@college.edu", "bad")).await.is_err());
        assert_eq!(idp.emitted_count(), emitted_before);
    }

    #[tokio::test]
    async fn printer_sees_loading_and_resolved_for_each_change() {
        let (idp, _store, controller) = setup();
        let mut feed = controller.feed();
        let mut watcher = controller.watch();
        idp.sign_in_with_password("s@college.edu", "pw").await.unwrap();
        assert!(settle(&mut watcher, 0, 1, Duration::from_secs(5)).await);

        let first = feed.next().await.unwrap();
        let second = feed.next().await.unwrap();
        assert!(first.is_loading() && first.generation() == 1);
        assert!(!second.is_loading() && second.generation() == 1);
        assert!(feed.try_next().is_none());
        controller.shutdown().await;
        assert!(feed.next().await.is_none());
    }
}
