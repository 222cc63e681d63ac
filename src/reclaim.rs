//! Background reclamation thread.
//!
//! A singleton per domain, alive exactly while the registry is non-empty.
//! The loop is deliberately lazy: sleep on the wake channel until some
//! producer publishes work, linger for the coalescing delay so bursts from
//! many producers land in the same batch, then run one global barrier
//! pass. One grace period then covers everything queued up to the pass's
//! snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::domain::DomainShared;

/// Granularity at which the coalescing sleep re-checks cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(10);

pub(crate) struct Reclaimer {
    cancel: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl Reclaimer {
    /// Start the reclamation thread for `shared`. Called under the outer
    /// thread mutex when the registry becomes non-empty.
    pub(crate) fn spawn(shared: Arc<DomainShared>) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let join = thread::Builder::new()
            .name("ertele-reclaim".into())
            .spawn({
                let cancel = cancel.clone();
                move || run(&shared, &cancel)
            })
            .expect("failed to spawn reclamation thread");
        Self { cancel, join }
    }

    /// Cancel, wake, and join. Called under the outer thread mutex when
    /// the registry becomes empty; the caller must not hold the defer
    /// mutex, which the thread's final barrier pass may still need.
    pub(crate) fn stop(self, shared: &DomainShared) {
        self.cancel.store(true, Ordering::SeqCst);
        shared.wake.notify();
        self.join.join().expect("reclamation thread panicked");
    }
}

fn run(shared: &DomainShared, cancel: &AtomicBool) {
    shared.wake.attach_waiter();
    log::debug!("reclamation thread started");

    loop {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        // Don't spin an idle CPU: sleep until a producer advertises work.
        shared.wake.wait(|| shared.pending_slots(), cancel);
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        // Let concurrent producers pile up callbacks for this batch.
        coalesce_sleep(shared.coalesce_delay(), cancel);
        shared.barrier_all();
    }

    shared.wake.detach_waiter();
    log::debug!("reclamation thread exiting");
}

/// Sleep for the coalescing delay, waking early on cancellation so a stop
/// request never stalls behind the full delay.
fn coalesce_sleep(delay: Duration, cancel: &AtomicBool) {
    let deadline = Instant::now() + delay;
    while !cancel.load(Ordering::SeqCst) {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            break;
        };
        thread::sleep(remaining.min(CANCEL_POLL));
    }
}
