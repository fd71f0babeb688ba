use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::warn;

use super::snapshot::Snapshot;
use crate::identity::{Identity, Role};

/// Right to publish a resolution for one generation.
#[derive(Debug, PartialEq, Eq)]
pub struct Ticket {
    generation: u64,
}

impl Ticket {
    pub fn generation(&self) -> u64 { self.generation }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Commit {
    Published(Snapshot),
    /// A newer generation is already published.
    Stale { ticket: u64, current: u64 },
    Disposed,
}

struct CellState {
    next_generation: u64,
    disposed: bool,
}

/// Snapshots buffered per feed subscriber before it starts lagging.
const FEED_CAPACITY: usize = 256;

/// Single owned snapshot slot. Every write presents a [`Ticket`];
/// writes below the published generation and all writes after disposal are rejected.
pub struct SnapshotCell {
    state: Mutex<CellState>,
    tx: watch::Sender<Snapshot>,
    feed: broadcast::Sender<Snapshot>,
}

impl Default for SnapshotCell {
    fn default() -> Self { Self::new() }
}

impl SnapshotCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Snapshot::initial());
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self { state: Mutex::new(CellState { next_generation: 1, disposed: false }), tx, feed }
    }

    /// Start a resolution: allocate the next generation and publish it as loading.
    pub fn begin(&self) -> Option<Ticket> {
        let mut st = self.state.lock();
        if st.disposed {
            return None;
        }
        let generation = st.next_generation;
        st.next_generation += 1;
        self.tx.send_modify(|current| *current = current.loading(generation));
        self.announce();
        Some(Ticket { generation })
    }

    pub fn commit(&self, ticket: Ticket, identity: Option<Identity>, role: Option<Role>) -> Commit {
        let st = self.state.lock();
        if st.disposed {
            return Commit::Disposed;
        }
        let current = self.tx.borrow().generation();
        if ticket.generation < current {
            return Commit::Stale { ticket: ticket.generation, current };
        }
        let snapshot = Snapshot::resolved(identity, role, ticket.generation);
        self.tx.send_replace(snapshot.clone());
        self.announce();
        Commit::Published(snapshot)
    }

    // Called with the state lock held so the feed sees publishes in order.
    fn announce(&self) {
        let _ = self.feed.send(self.tx.borrow().clone());
    }

    /// Returns `true` only for the call that performed the disposal.
    pub fn dispose(&self) -> bool {
        let mut st = self.state.lock();
        !std::mem::replace(&mut st.disposed, true)
    }

    pub fn is_disposed(&self) -> bool { self.state.lock().disposed }

    pub fn current(&self) -> Snapshot { self.tx.borrow().clone() }

    pub fn watch(&self) -> SnapshotWatcher { SnapshotWatcher { rx: self.tx.subscribe() } }

    /// Every snapshot published from now on, in publish order.
    pub fn feed(&self) -> SnapshotFeed { SnapshotFeed { rx: self.feed.subscribe() } }
}

/// Read-only subscription to published snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotWatcher {
    rx: watch::Receiver<Snapshot>,
}

impl SnapshotWatcher {
    pub fn current(&self) -> Snapshot { self.rx.borrow().clone() }

    /// Wait for the next publish. Publishes in between are coalesced into the newest.
    /// `None` once the controller is gone.
    pub async fn changed(&mut self) -> Option<Snapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until a published snapshot satisfies `pred`, checking the current one first.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> Option<Snapshot>
    where
        F: FnMut(&Snapshot) -> bool,
    {
        let snap = self.rx.wait_for(|s| pred(s)).await.ok()?;
        Some(snap.clone())
    }
}

/// Uncoalesced stream of published snapshots, unlike [`SnapshotWatcher`].
#[derive(Debug)]
pub struct SnapshotFeed {
    rx: broadcast::Receiver<Snapshot>,
}

impl SnapshotFeed {
    /// Next published snapshot. `None` once the controller is gone and the feed is drained.
    pub async fn next(&mut self) -> Option<Snapshot> {
        loop {
            match self.rx.recv().await {
                Ok(snap) => return Some(snap),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(target: "odtrack::session", "session.feed lagged, skipped {} snapshots", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-published snapshot without waiting.
    pub fn try_next(&mut self) -> Option<Snapshot> {
        loop {
            match self.rx.try_recv() {
                Ok(snap) => return Some(snap),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(target: "odtrack::session", "session.feed lagged, skipped {} snapshots", n);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_publishes_loading_with_increasing_generations() {
        let cell = SnapshotCell::new();
        assert_eq!(cell.current().generation(), 0);
        let t1 = cell.begin().unwrap();
        let t2 = cell.begin().unwrap();
        assert_eq!((t1.generation(), t2.generation()), (1, 2));
        assert!(cell.current().is_loading());
        assert_eq!(cell.current().generation(), 2);
    }

    #[test]
    fn stale_ticket_is_rejected() {
        let cell = SnapshotCell::new();
        let t1 = cell.begin().unwrap();
        let t2 = cell.begin().unwrap();
        assert!(matches!(cell.commit(t2, Some(Identity::new("B")), Some(Role::Club)), Commit::Published(_)));
        assert_eq!(cell.commit(t1, Some(Identity::new("A")), Some(Role::Student)), Commit::Stale { ticket: 1, current: 2 });
        assert_eq!(cell.current().identity(), Some(&Identity::new("B")));
    }

    #[test]
    fn older_ticket_cannot_resolve_newer_loading() {
        let cell = SnapshotCell::new();
        let t1 = cell.begin().unwrap();
        let _t2 = cell.begin().unwrap();
        assert!(matches!(cell.commit(t1, None, None), Commit::Stale { .. }));
        assert!(cell.current().is_loading());
    }

    #[test]
    fn feed_sees_every_publish_in_order() {
        let cell = SnapshotCell::new();
        let mut feed = cell.feed();
        let t1 = cell.begin().unwrap();
        let t2 = cell.begin().unwrap();
        cell.commit(t2, None, None);
        cell.commit(t1, Some(Identity::new("A")), None);

        let seen: Vec<(u64, bool)> = std::iter::from_fn(|| feed.try_next()).map(|s| (s.generation(), s.is_loading())).collect();
        assert_eq!(seen, vec![(1, true), (2, true), (2, false)]);
    }

    #[test]
    fn dispose_is_once_and_blocks_writes() {
        let cell = SnapshotCell::new();
        let t = cell.begin().unwrap();
        assert!(cell.dispose());
        assert!(!cell.dispose());
        assert_eq!(cell.commit(t, None, None), Commit::Disposed);
        assert!(cell.begin().is_none());
    }
}
