//! Process-wide table of registered deferer threads.
//!
//! Every operation here runs under the defer mutex; the registry itself is
//! the data that mutex protects. Entries are appended on registration and
//! removed by moving the last entry into the vacated slot; iteration order
//! is irrelevant to the barrier engine. The backing storage grows
//! geometrically and never shrinks.

use std::sync::Arc;
use std::thread::ThreadId;

use crate::queue::DeferQueue;

/// Registry entries start at this capacity and double from there.
const INITIAL_DEFERERS: usize = 4;

/// One registered deferer: its queue plus the head snapshot taken by the
/// most recent global barrier pass.
pub(crate) struct RegistryEntry {
    pub(crate) thread: ThreadId,
    pub(crate) queue: Arc<DeferQueue>,
    pub(crate) last_head: u64,
}

pub(crate) struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::with_capacity(INITIAL_DEFERERS),
        }
    }

    pub(crate) fn add(&mut self, thread: ThreadId, queue: Arc<DeferQueue>) {
        self.entries.push(RegistryEntry {
            thread,
            queue,
            last_head: 0,
        });
    }

    /// Remove the entry owning `queue`. O(n) linear scan; the vacated slot
    /// is filled by the last entry. Panics if the queue was never
    /// registered: that is a caller bug, not a recoverable state.
    pub(crate) fn remove(&mut self, queue: &Arc<DeferQueue>) {
        let position = self
            .entries
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.queue, queue))
            .expect("unregistering a deferer that was never registered");
        let removed = self.entries.swap_remove(position);
        log::trace!("deregistered deferer thread {:?}", removed.thread);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut RegistryEntry> {
        self.entries.iter_mut()
    }

    /// Record every queue's current head in its entry and return the total
    /// occupied slot count across all queues. Heads are acquired so a drain
    /// up to a recorded snapshot sees the slots published before it.
    pub(crate) fn snapshot_heads(&mut self) -> u64 {
        let mut pending = 0u64;
        for entry in &mut self.entries {
            entry.last_head = entry.queue.snapshot_head();
            pending = pending.wrapping_add(entry.last_head.wrapping_sub(entry.queue.tail()));
        }
        pending
    }

    /// Total occupied slots without recording snapshots. The wake protocol
    /// uses this to decide whether the reclamation thread may sleep.
    pub(crate) fn pending_slots(&self) -> u64 {
        self.entries
            .iter()
            .map(|entry| entry.queue.occupied())
            .fold(0, u64::wrapping_add)
    }
}
