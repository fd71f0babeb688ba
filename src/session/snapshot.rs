use serde::{Deserialize, Serialize};

use crate::identity::{Identity, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Loading,
    Resolved,
}

/// Published, versioned view of the current session.
///
/// Fields are private so that `role` can never be set without an identity.
/// A `generation` only ever grows across the snapshots one controller publishes.
/// Deserialization goes through the same constructors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SnapshotRecord")]
pub struct Snapshot {
    identity: Option<Identity>,
    role: Option<Role>,
    state: ResolutionState,
    generation: u64,
}

#[derive(Deserialize)]
struct SnapshotRecord {
    #[serde(default)]
    identity: Option<Identity>,
    #[serde(default)]
    role: Option<Role>,
    state: ResolutionState,
    generation: u64,
}

impl From<SnapshotRecord> for Snapshot {
    fn from(r: SnapshotRecord) -> Self {
        let resolved = Snapshot::resolved(r.identity, r.role, r.generation);
        match r.state {
            ResolutionState::Resolved => resolved,
            ResolutionState::Loading => resolved.loading(r.generation),
        }
    }
}

/// The reachable snapshot shapes, for exhaustive matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotShape<'a> {
    Loading,
    Anonymous,
    Authenticated { identity: &'a Identity, role: Option<&'a Role> },
}

impl Snapshot {
    /// State before any resolution has started.
    pub fn initial() -> Self { Self { identity: None, role: None, state: ResolutionState::Loading, generation: 0 } }

    pub fn resolved(identity: Option<Identity>, role: Option<Role>, generation: u64) -> Self {
        let role = if identity.is_some() { role } else { None };
        Self { identity, role, state: ResolutionState::Resolved, generation }
    }

    /// Same identity and role as `self`, marked loading under a new generation.
    pub fn loading(&self, generation: u64) -> Self {
        Self { identity: self.identity.clone(), role: self.role.clone(), state: ResolutionState::Loading, generation }
    }

    pub fn identity(&self) -> Option<&Identity> { self.identity.as_ref() }
    pub fn role(&self) -> Option<&Role> { self.role.as_ref() }
    pub fn state(&self) -> ResolutionState { self.state }
    pub fn generation(&self) -> u64 { self.generation }
    pub fn is_loading(&self) -> bool { self.state == ResolutionState::Loading }

    /// Equality ignoring the generation.
    pub fn same_state(&self, other: &Snapshot) -> bool {
        self.identity == other.identity && self.role == other.role && self.state == other.state
    }

    pub fn shape(&self) -> SnapshotShape<'_> {
        match (self.state, &self.identity) {
            (ResolutionState::Loading, _) => SnapshotShape::Loading,
            (ResolutionState::Resolved, None) => SnapshotShape::Anonymous,
            (ResolutionState::Resolved, Some(identity)) => {
                SnapshotShape::Authenticated { identity, role: self.role.as_ref() }
            }
        }
    }
}

impl Default for Snapshot {
    fn default() -> Self { Self::initial() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_is_dropped_without_identity() {
        let s = Snapshot::resolved(None, Some(Role::Student), 3);
        assert_eq!(s.role(), None);
        assert_eq!(s.shape(), SnapshotShape::Anonymous);
    }

    #[test]
    fn deserialized_role_without_identity_is_dropped() {
        let s: Snapshot =
            serde_json::from_str(r#"{"identity":null,"role":"student","state":"resolved","generation":1}"#).unwrap();
        assert_eq!(s.identity(), None);
        assert_eq!(s.role(), None);
        assert_eq!(s.shape(), SnapshotShape::Anonymous);

        let s: Snapshot =
            serde_json::from_str(r#"{"role":"club","state":"loading","generation":4}"#).unwrap();
        assert!(s.is_loading());
        assert_eq!(s.role(), None);
        assert_eq!(s.generation(), 4);
    }

    #[test]
    fn serde_keeps_valid_snapshots() {
        let a = Snapshot::resolved(Some(Identity::new("U1")), Some(Role::Club), 9);
        let back: Snapshot = serde_json::from_str(&serde_json::to_string(&a).unwrap()).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn same_state_ignores_generation() {
        let a = Snapshot::resolved(Some(Identity::new("U1")), Some(Role::Club), 1);
        let b = Snapshot::resolved(Some(Identity::new("U1")), Some(Role::Club), 7);
        assert!(a.same_state(&b));
        assert_ne!(a, b);
        assert!(!a.same_state(&a.loading(8)));
    }

    #[test]
    fn loading_keeps_previous_values() {
        let a = Snapshot::resolved(Some(Identity::new("U1")), Some(Role::Club), 1);
        let l = a.loading(2);
        assert_eq!(l.shape(), SnapshotShape::Loading);
        assert_eq!(l.identity(), a.identity());
        assert_eq!(l.generation(), 2);
    }
}
