//! Capability router table tests.

use odtrack::identity::{Identity, Role};
use odtrack::router::{route, AuthFlowReason, RenderTarget, AUTH_FLOW_ENTRY};
use odtrack::session::Snapshot;

fn roles() -> Vec<Option<Role>> {
    vec![
        None,
        Some(Role::Student),
        Some(Role::Club),
        Some(Role::Unrecognized("admin".into())),
        Some(Role::Unrecognized(String::new())),
    ]
}

#[test]
fn resolved_table() {
    let u1 = || Some(Identity::new("U1"));
    let cases = [
        (Snapshot::resolved(None, None, 1), RenderTarget::AuthFlow(AuthFlowReason::NoSession)),
        (Snapshot::resolved(u1(), Some(Role::Student), 1), RenderTarget::StudentDashboard),
        (Snapshot::resolved(u1(), Some(Role::Club), 1), RenderTarget::ClubDashboard),
        (Snapshot::resolved(u1(), None, 1), RenderTarget::AuthFlow(AuthFlowReason::RoleUnresolved)),
        (
            Snapshot::resolved(u1(), Some(Role::parse("moderator")), 1),
            RenderTarget::AuthFlow(AuthFlowReason::RoleUnrecognized),
        ),
    ];
    for (snap, want) in cases {
        assert_eq!(route(&snap), want, "snapshot {:?}", snap);
    }
}

#[test]
fn anonymous_ignores_any_role() {
    for role in roles() {
        let snap = Snapshot::resolved(None, role, 4);
        assert_eq!(route(&snap), RenderTarget::AuthFlow(AuthFlowReason::NoSession));
    }
}

#[test]
fn loading_never_shows_a_dashboard() {
    for identity in [None, Some(Identity::new("U1"))] {
        for role in roles() {
            let snap = Snapshot::resolved(identity.clone(), role, 1).loading(2);
            assert_eq!(route(&snap), RenderTarget::Loading);
        }
    }
}

#[test]
fn only_recognized_roles_reach_dashboards() {
    for role in roles() {
        let recognized = role.as_ref().is_some_and(Role::is_recognized);
        let snap = Snapshot::resolved(Some(Identity::new("U1")), role, 1);
        let target = route(&snap);
        assert_eq!(target.is_dashboard(), recognized, "role {:?} -> {:?}", snap.role(), target);
        // idempotent
        assert_eq!(route(&snap), target);
    }
}

#[test]
fn auth_flow_entry_screen() {
    assert_eq!(AUTH_FLOW_ENTRY, "AuthLanding");
    assert_eq!(RenderTarget::AuthFlow(AuthFlowReason::NoSession).screen_name(), "AuthFlow");
}
