//! Reclamation domain: lifecycle, registration, and the barrier engine.
//!
//! A [`DeferDomain`] owns the deferer registry, the wake channel, and the
//! reclamation thread for one independent reclamation scope. Threads join
//! a domain with [`register`](DeferDomain::register), obtaining a
//! [`DefererHandle`] bound to the calling thread; dropping the handle
//! deregisters it. The reclamation thread exists exactly while at least
//! one handle does.
//!
//! Two locks with a fixed order keep shutdown and barrier passes apart:
//! the outer thread mutex (the [`Reclaimer`] slot) serializes start/stop
//! of the reclamation thread and register/unregister transitions; the
//! inner defer mutex (the [`Registry`]) protects the registry, every
//! queue's `tail`, and whole barrier passes. The outer lock is never taken
//! while holding the inner one.

use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::grace::GracePeriod;
use crate::queue::{DEFAULT_QUEUE_CAPACITY, DeferFn, DeferQueue};
use crate::reclaim::Reclaimer;
use crate::registry::Registry;
use crate::wake::WakeChannel;

/// How long the reclamation thread lingers after a wake-up so that
/// concurrent producers can batch into one grace period.
pub const DEFAULT_COALESCE_DELAY: Duration = Duration::from_millis(100);

/// Tunables for a reclamation domain.
#[derive(Clone, Debug)]
pub struct DeferConfig {
    /// Ring capacity, in slots, of each registered thread's queue. Must be
    /// a power of two and at least 4.
    pub queue_capacity: usize,
    /// Sleep inserted between a wake-up and the barrier pass.
    pub coalesce_delay: Duration,
}

impl Default for DeferConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            coalesce_delay: DEFAULT_COALESCE_DELAY,
        }
    }
}

/// State shared between domain clones, handles, and the reclamation
/// thread.
pub(crate) struct DomainShared {
    grace: Box<dyn GracePeriod>,
    config: DeferConfig,
    /// Outer thread mutex; its data is the reclamation thread itself.
    reclaimer: Mutex<Option<Reclaimer>>,
    /// Inner defer mutex; its data is the registry. Queue tails advance
    /// only while this is held.
    registry: Mutex<Registry>,
    pub(crate) wake: WakeChannel,
}

impl DomainShared {
    #[inline]
    pub(crate) fn coalesce_delay(&self) -> Duration {
        self.config.coalesce_delay
    }

    /// Total occupied slots across all registered queues.
    pub(crate) fn pending_slots(&self) -> u64 {
        self.registry.lock().pending_slots()
    }

    /// One global barrier pass: snapshot every head, pay one grace period
    /// if anything is pending, then drain each queue to its snapshot.
    /// Records published after the snapshot belong to the next batch.
    pub(crate) fn barrier_all(&self) {
        let mut registry = self.registry.lock();
        let pending = registry.snapshot_heads();
        if pending == 0 {
            // No queued callbacks, so the grace period can be skipped.
            return;
        }
        log::trace!("barrier pass over {pending} pending slots");
        self.grace.synchronize();
        for entry in registry.entries_mut() {
            // SAFETY: defer mutex held, head snapshotted with acquire
            // before the grace wait, and the wait has completed.
            unsafe { entry.queue.drain(entry.last_head) };
        }
    }

    /// Local barrier: drain a single queue after one grace period. Used by
    /// the owner on fullness and at deregistration.
    pub(crate) fn barrier_queue(&self, queue: &DeferQueue) {
        let _registry = self.registry.lock();
        let head = queue.snapshot_head();
        if head == queue.tail() {
            return;
        }
        self.grace.synchronize();
        // SAFETY: defer mutex held, head acquired before the completed
        // grace wait.
        unsafe { queue.drain(head) };
    }
}

/// An independent batched-reclamation scope.
///
/// Cloning is cheap and yields another reference to the same domain.
/// Dropping the last clone after all handles are gone frees the registry.
///
/// # Example
///
/// ```rust
/// use ertele::DeferDomain;
///
/// // The grace-period provider is an external collaborator; a real one
/// // wraps the RCU reader-side machinery. Tests often count calls.
/// let domain = DeferDomain::new(|| { /* synchronize_rcu() */ });
///
/// let handle = domain.register();
/// let node: *mut u64 = Box::into_raw(Box::new(7));
/// unsafe { handle.defer_drop(node) };
/// domain.barrier();
/// ```
#[derive(Clone)]
pub struct DeferDomain {
    shared: Arc<DomainShared>,
}

impl DeferDomain {
    /// Create a domain with default tunables around the given grace-period
    /// provider.
    pub fn new(grace: impl GracePeriod + 'static) -> Self {
        Self::with_config(grace, DeferConfig::default())
    }

    /// Create a domain with explicit tunables.
    ///
    /// Panics if `config.queue_capacity` is not a power of two >= 4.
    pub fn with_config(grace: impl GracePeriod + 'static, config: DeferConfig) -> Self {
        assert!(
            config.queue_capacity.is_power_of_two() && config.queue_capacity >= 4,
            "defer queue capacity must be a power of two >= 4, got {}",
            config.queue_capacity
        );
        Self {
            shared: Arc::new(DomainShared {
                grace: Box::new(grace),
                config,
                reclaimer: Mutex::new(None),
                registry: Mutex::new(Registry::new()),
                wake: WakeChannel::new(),
            }),
        }
    }

    /// Register the calling thread as a deferer.
    ///
    /// Allocates the thread's queue and, if this is the first registration
    /// in the domain, starts the reclamation thread. The returned handle
    /// is bound to the calling thread; dropping it deregisters. A thread
    /// may hold several handles, each with its own queue.
    pub fn register(&self) -> DefererHandle {
        let mut reclaimer = self.shared.reclaimer.lock();
        let queue = Arc::new(DeferQueue::new(self.shared.config.queue_capacity));
        let deferers = {
            let mut registry = self.shared.registry.lock();
            registry.add(thread::current().id(), queue.clone());
            registry.len()
        };
        if deferers == 1 {
            debug_assert!(reclaimer.is_none());
            *reclaimer = Some(Reclaimer::spawn(self.shared.clone()));
        }
        DefererHandle {
            shared: self.shared.clone(),
            queue,
            _not_send: PhantomData,
        }
    }

    /// Execute all callbacks queued as of entry.
    ///
    /// Callbacks enqueued on the calling thread before this call are
    /// guaranteed to have run when it returns. Callbacks other threads
    /// enqueue concurrently may be left for the next batch, unless their
    /// enqueue is ordered before this call by external synchronization.
    /// Costs at most one grace period; none if every queue is empty.
    pub fn barrier(&self) {
        self.shared.barrier_all();
    }

    /// Total occupied slots across all queues in the domain. Counts ring
    /// slots, not decoded records, so it over-approximates the callback
    /// count; zero does mean no callbacks are pending.
    pub fn pending_slots(&self) -> u64 {
        self.shared.pending_slots()
    }
}

/// A thread's membership in a [`DeferDomain`].
///
/// Owns the thread's defer queue. Not `Send`: the queue has a single
/// writer by construction, and that writer is the registering thread.
/// Dropping the handle drains the queue (one grace period if non-empty)
/// and deregisters the thread; if it was the domain's last deferer, the
/// reclamation thread is stopped and joined.
pub struct DefererHandle {
    shared: Arc<DomainShared>,
    queue: Arc<DeferQueue>,
    _not_send: PhantomData<*mut ()>,
}

impl DefererHandle {
    /// Queue `fct(arg)` to run after a future grace period.
    ///
    /// Never fails. If the local ring is within its reserve headroom the
    /// call first drains it synchronously, which blocks for one grace
    /// period. Within this handle callbacks run in enqueue order; across
    /// handles no order is promised.
    ///
    /// # Safety
    ///
    /// - `fct(arg)` must be sound to call once, on any thread (it usually
    ///   runs on the reclamation thread), at any point after a grace
    ///   period has elapsed from this call.
    /// - `fct` must not re-enter barrier or defer APIs of this domain and
    ///   must not block indefinitely.
    pub unsafe fn defer(&self, fct: DeferFn, arg: *mut ()) {
        if self.queue.needs_drain() {
            // Ring is full up to the reserve; empty it ourselves.
            assert!(self.queue.occupied() <= self.queue.capacity());
            self.barrier_local();
            assert_eq!(self.queue.occupied(), 0);
        }
        self.queue.push(fct, arg);
        self.shared.wake.notify();
    }

    /// Queue `drop(Box::from_raw(ptr))` to run after a future grace
    /// period.
    ///
    /// Deferring the same `T` repeatedly hits the queue's
    /// function-suppression fast path, costing one slot per call.
    ///
    /// # Safety
    ///
    /// - `ptr` must come from `Box::into_raw` and must not be dropped or
    ///   dereferenced by anyone once a grace period has elapsed from this
    ///   call.
    /// - `ptr` must not be deferred more than once.
    pub unsafe fn defer_drop<T: 'static>(&self, ptr: *mut T) {
        unsafe fn drop_box<T>(p: *mut ()) {
            // SAFETY: p originates from Box::into_raw::<T> in defer_drop.
            unsafe { drop(Box::from_raw(p.cast::<T>())) };
        }
        // SAFETY: caller contract; drop_box runs once, after the grace
        // period, on whichever thread drains.
        unsafe { self.defer(drop_box::<T>, ptr.cast()) };
    }

    /// Drain this thread's queue only: one grace period, then every
    /// callback queued so far, in order. Returns immediately if the queue
    /// is empty.
    pub fn barrier_local(&self) {
        self.shared.barrier_queue(&self.queue);
    }

    /// Occupied slots in this thread's ring (see
    /// [`DeferDomain::pending_slots`] for the counting caveat).
    pub fn pending_slots(&self) -> u64 {
        self.queue.occupied()
    }
}

impl Drop for DefererHandle {
    fn drop(&mut self) {
        let mut reclaimer = self.shared.reclaimer.lock();
        let deferers = {
            let mut registry = self.shared.registry.lock();
            let head = self.queue.snapshot_head();
            if head != self.queue.tail() {
                self.shared.grace.synchronize();
                // SAFETY: defer mutex held, grace wait completed; the
                // queue must be empty before its entry goes away.
                unsafe { self.queue.drain(head) };
            }
            registry.remove(&self.queue);
            registry.len()
        };
        if deferers == 0
            && let Some(reclaimer) = reclaimer.take()
        {
            // Defer mutex already released: the thread's final barrier
            // pass may still need it before the join completes.
            reclaimer.stop(&self.shared);
        }
    }
}
