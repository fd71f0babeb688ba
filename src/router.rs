//! Capability router: maps a session snapshot to the one screen the UI shows.

use serde::{Deserialize, Serialize};

use crate::identity::Role;
use crate::session::{Snapshot, SnapshotShape};

/// First screen of the unauthenticated flow.
pub const AUTH_FLOW_ENTRY: &str = "AuthLanding";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFlowReason {
    NoSession,
    RoleUnresolved,
    RoleUnrecognized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target", content = "reason", rename_all = "snake_case")]
pub enum RenderTarget {
    Loading,
    AuthFlow(AuthFlowReason),
    StudentDashboard,
    ClubDashboard,
}

impl RenderTarget {
    /// Navigator entry name for this target.
    pub fn screen_name(&self) -> &'static str {
        match self {
            RenderTarget::Loading => "Loading",
            RenderTarget::AuthFlow(_) => "AuthFlow",
            RenderTarget::StudentDashboard => "StudentDashboard",
            RenderTarget::ClubDashboard => "ClubDashboard",
        }
    }

    pub fn is_dashboard(&self) -> bool {
        matches!(self, RenderTarget::StudentDashboard | RenderTarget::ClubDashboard)
    }
}

/// Pure and total over every snapshot shape. Anything short of a recognized role fails closed.
pub fn route(snapshot: &Snapshot) -> RenderTarget {
    match snapshot.shape() {
        SnapshotShape::Loading => RenderTarget::Loading,
        SnapshotShape::Anonymous => RenderTarget::AuthFlow(AuthFlowReason::NoSession),
        SnapshotShape::Authenticated { role: Some(Role::Student), .. } => RenderTarget::StudentDashboard,
        SnapshotShape::Authenticated { role: Some(Role::Club), .. } => RenderTarget::ClubDashboard,
        SnapshotShape::Authenticated { role: Some(Role::Unrecognized(_)), .. } => {
            RenderTarget::AuthFlow(AuthFlowReason::RoleUnrecognized)
        }
        SnapshotShape::Authenticated { role: None, .. } => RenderTarget::AuthFlow(AuthFlowReason::RoleUnresolved),
    }
}
