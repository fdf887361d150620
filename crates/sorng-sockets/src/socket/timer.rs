//! Deadline-ordered timer queue.
//!
//! Entries with equal deadlines fire in scheduling order. Due entries
//! are drained as a snapshot so timer handlers may schedule or cancel
//! timers without holding any lock into the queue's internals.

use crate::socket::types::Uid;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub owner: Uid,
    pub id: u32,
    pub deadline: Instant,
    pub param: u64,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    /// Ascending by deadline; equal deadlines keep insertion order.
    entries: Vec<TimerEntry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts after all entries with the same deadline, so ties fire
    /// in scheduling order.
    pub fn schedule(&mut self, owner: Uid, id: u32, deadline: Instant, param: u64) {
        let at = self.entries.partition_point(|e| e.deadline <= deadline);
        self.entries.insert(
            at,
            TimerEntry {
                owner,
                id,
                deadline,
                param,
            },
        );
    }

    /// Removes every pending timer matching `(owner, id)`. Returns
    /// whether anything was removed.
    pub fn cancel(&mut self, owner: Uid, id: u32) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| !(e.owner == owner && e.id == id));
        self.entries.len() != before
    }

    /// Removes every pending timer belonging to `owner`.
    pub fn cancel_all(&mut self, owner: Uid) {
        self.entries.retain(|e| e.owner != owner);
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.deadline)
    }

    /// Snapshots and removes everything due at `now`. A timer cancelled
    /// after this returns still fires once from the snapshot.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerEntry> {
        let due = self.entries.partition_point(|e| e.deadline <= now);
        self.entries.drain(..due).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
