//! Session bootstrap and role resolution.
//! The controller is the only writer of the snapshot; everyone else watches it.

mod snapshot;
mod cell;
mod controller;

pub use snapshot::{ResolutionState, Snapshot, SnapshotShape};
pub use cell::{Commit, SnapshotCell, SnapshotFeed, SnapshotWatcher, Ticket};
pub use controller::{Resolution, SessionController};
