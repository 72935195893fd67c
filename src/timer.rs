//! Timer heap with lazy cancellation.
//!
//! The hub keeps everything time-driven — `sleep`, `spawn_later`, and the
//! timeout arm of every timed wait — in one min-heap ordered by absolute due
//! time. Cancellation is lazy: removing a timer tombstones its id, and the
//! heap discards tombstoned entries whenever they surface at the top. This
//! keeps cancellation O(1) while the heap stays a plain binary heap.
//!
//! All public hub APIs take delays in milliseconds; entries here store the
//! absolute [`Instant`] they are due.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use crate::error::Error;

/// Boxed resume action for a parked task.
///
/// Invoked with `None` when the timer fires normally and with `Some(err)`
/// when the hub throws into the timer instead (orderly shutdown). The
/// closure owns everything it needs to deliver the resume value and
/// reschedule the task.
pub(crate) type Ring = Box<dyn FnOnce(Option<Error>)>;

/// A stored task body waiting for its start time.
pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

/// What to do when a timer fires.
pub(crate) enum TimerKind {
    /// Resume a parked task by delivering into its slot.
    Wake(Ring),
    /// Start a task spawned with `spawn_later`.
    Spawn(TaskFuture),
}

impl std::fmt::Debug for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerKind::Wake(_) => f.write_str("Wake"),
            TimerKind::Spawn(_) => f.write_str("Spawn"),
        }
    }
}

/// Handle for cancelling a scheduled timer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct TimerId(u64);

struct Entry {
    due: Instant,
    seq: u64,
    kind: TimerKind,
}

// BinaryHeap is a max-heap; reverse the ordering to pop the earliest due
// time first. seq breaks ties so ordering is total.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

/// Min-heap of pending timers with tombstone-based removal.
pub(crate) struct Scheduler {
    queue: BinaryHeap<Entry>,
    /// Ids currently sitting in the heap (tombstoned or not).
    pending: HashSet<u64>,
    /// Ids logically removed but not yet discarded from the heap.
    removed: HashSet<u64>,
    next_seq: u64,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("live", &self.len())
            .field("tombstoned", &self.removed.len())
            .finish()
    }
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Scheduler {
            queue: BinaryHeap::new(),
            pending: HashSet::new(),
            removed: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Schedule *kind* to fire after *delay*. Returns a handle usable with
    /// [`Scheduler::remove`].
    pub(crate) fn add(&mut self, delay: Duration, kind: TimerKind) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Entry {
            due: Instant::now() + delay,
            seq,
            kind,
        });
        self.pending.insert(seq);
        TimerId(seq)
    }

    /// Tombstone a timer. A removed timer never fires; the heap entry is
    /// discarded lazily when it reaches the top. Removing an id that has
    /// already fired (or was already removed) is a no-op.
    pub(crate) fn remove(&mut self, id: TimerId) {
        if self.pending.contains(&id.0) {
            self.removed.insert(id.0);
        }
    }

    /// Number of live (non-tombstoned) timers.
    pub(crate) fn len(&self) -> usize {
        self.pending.len() - self.removed.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard tombstoned entries from the top of the heap.
    fn prune(&mut self) {
        while let Some(top) = self.queue.peek() {
            if !self.removed.contains(&top.seq) {
                break;
            }
            if let Some(entry) = self.queue.pop() {
                self.pending.remove(&entry.seq);
                self.removed.remove(&entry.seq);
            }
        }
    }

    /// Absolute due time of the earliest live timer, or `None` when no live
    /// timers remain. Prunes first, so an all-tombstone heap reads as empty.
    pub(crate) fn next_due(&mut self) -> Option<Instant> {
        self.prune();
        self.queue.peek().map(|entry| entry.due)
    }

    /// Pop the earliest live timer.
    pub(crate) fn pop(&mut self) -> Option<TimerKind> {
        self.prune();
        let entry = self.queue.pop()?;
        self.pending.remove(&entry.seq);
        Some(entry.kind)
    }

    /// Take every live timer in due order, clearing the heap entirely.
    ///
    /// Used by orderly shutdown: the hub throws into each parked timer task
    /// and discards unstarted `spawn_later` bodies.
    pub(crate) fn drain(&mut self) -> Vec<TimerKind> {
        let mut kinds = Vec::with_capacity(self.len());
        while let Some(kind) = self.pop() {
            kinds.push(kind);
        }
        self.pending.clear();
        self.removed.clear();
        kinds
    }
}
