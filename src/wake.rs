//! Single-slot sleep/wake primitive for the reclamation thread.
//!
//! One waitable 32-bit word: `0` means no waiter, `-1` means the
//! reclamation thread is (about to go) sleeping. Producers nudge the word
//! after publishing new work; the reclamation thread announces itself on
//! the word, re-checks for pending work, and only then blocks.
//!
//! The lost-wakeup argument needs a total order between two pairs of
//! operations: the waiter's store of `-1` and its read of the queue
//! lengths, against a producer's publish of `head` and its read of the
//! word. All word accesses are sequentially consistent and both sides put
//! a full fence between their publish and their cross-read, so one of the
//! two always observes the other.
//!
//! Blocking itself uses `std::thread::park`. Its token semantics (an
//! unpark delivered before the park makes the park return immediately)
//! cover the window between the waiter's final word check and the actual
//! sleep.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering, fence};
use std::thread::{self, Thread};

use parking_lot::Mutex;

const NO_WAITER: i32 = 0;
const WAITER_SLEEPING: i32 = -1;

pub(crate) struct WakeChannel {
    futex: AtomicI32,
    /// Park handle of the current reclamation thread, registered for the
    /// lifetime of each reclaimer incarnation. Producers take this lock
    /// only on the rare `-1` path.
    waiter: Mutex<Option<Thread>>,
}

impl WakeChannel {
    pub(crate) fn new() -> Self {
        Self {
            futex: AtomicI32::new(NO_WAITER),
            waiter: Mutex::new(None),
        }
    }

    /// Register the calling thread as the sleeper. Called once per
    /// reclaimer incarnation, before its first `wait`.
    pub(crate) fn attach_waiter(&self) {
        *self.waiter.lock() = Some(thread::current());
    }

    /// Forget the sleeper and reset the word. Called by the reclaimer on
    /// its way out so a later incarnation starts clean.
    pub(crate) fn detach_waiter(&self) {
        *self.waiter.lock() = None;
        self.futex.store(NO_WAITER, Ordering::SeqCst);
    }

    /// Wake the reclamation thread if it is sleeping. Called from many
    /// producer threads; the caller must have fenced after publishing the
    /// work this wake advertises (the queue's push does).
    pub(crate) fn notify(&self) {
        if self.futex.load(Ordering::SeqCst) == WAITER_SLEEPING {
            self.futex.store(NO_WAITER, Ordering::SeqCst);
            if let Some(waiter) = self.waiter.lock().as_ref() {
                waiter.unpark();
            }
        }
    }

    /// Block until notified, unless `pending` already reports work or
    /// `cancel` is raised. Reclamation thread only.
    ///
    /// The word is stored before `pending` runs, with a full fence in
    /// between; a producer that misses the `-1` therefore published its
    /// head early enough for `pending` to count it.
    pub(crate) fn wait(&self, pending: impl Fn() -> u64, cancel: &AtomicBool) {
        self.futex.store(WAITER_SLEEPING, Ordering::SeqCst);
        // Write futex before reading queue lengths.
        fence(Ordering::SeqCst);
        if pending() != 0 {
            // Work arrived while announcing; cancel the sleep.
            self.futex.store(NO_WAITER, Ordering::SeqCst);
            return;
        }
        loop {
            // Parking has no cancellation points; re-check the flag
            // before every park. stop() raises it and nudges the word.
            if cancel.load(Ordering::SeqCst) {
                self.futex.store(NO_WAITER, Ordering::SeqCst);
                return;
            }
            if self.futex.load(Ordering::SeqCst) != WAITER_SLEEPING {
                return;
            }
            thread::park();
        }
    }
}
