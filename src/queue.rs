//! Per-thread defer queue.
//!
//! A fixed-capacity ring of pointer-sized slots with a single writer (the
//! owning producer) and a single reader at a time (whoever holds the defer
//! mutex during a drain). `head` is the next slot to write and is published
//! only by the owner; `tail` is the next slot to consume and advances only
//! under the defer mutex. Both are monotonic 64-bit counters reduced to a
//! ring index by mask, with all differences taken via wrapping arithmetic.
//!
//! # Slot encoding
//!
//! The ring stores two kinds of pointer-sized values, callbacks and their
//! arguments, without a side tag. Discrimination piggybacks on the low bit:
//!
//! - **Tagged function**, `fct | FCT_BIT`: a new callback; the next slot
//!   is its argument.
//! - **Escape**, `FCT_MARK, fct, arg`: used when the tagged form would be
//!   ambiguous (the callback address already has the low bit set or would
//!   alias the mark) or when the argument value itself would decode as a
//!   tag (low bit set, or equal to the mark).
//! - **Bare argument**, anything else: an argument for the most recently
//!   decoded callback.
//!
//! `FCT_MARK` itself carries the low bit, so decoding must test for the
//! mark *before* testing the tag bit.
//!
//! A producer that keeps deferring the same callback therefore pays one
//! slot per call instead of two; the callback address is written once and
//! cached on both sides (`last_fct_in` by the producer, `last_fct_out` by
//! the drainer). Both caches persist across drain passes: the producer
//! suppresses re-writes based on what is already in the stream, so the
//! drainer must remember the last decoded callback even after emptying the
//! ring.
//!
//! # Ordering
//!
//! Slot writes and the `head` publish are release stores; the drainer
//! acquires `head` (in the barrier engine) and then acquire-loads slots, so
//! every slot value it decodes is the one written before the observed
//! `head`. `tail` is release-stored only after all callbacks of a drain
//! have run, which is what makes the slots reusable by the producer.

#[cfg(loom)]
use loom::sync::atomic::{AtomicU64, AtomicUsize, Ordering, fence};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering, fence};

use crossbeam_utils::CachePadded;

/// A deferred callback: invoked with the argument it was queued with, once
/// a grace period has elapsed since the enqueue.
pub type DeferFn = unsafe fn(*mut ());

/// Low bit tagging a slot as a freshly written callback address.
pub(crate) const FCT_BIT: usize = 1;

/// Reserved slot value escaping ambiguous encodings. All ones is never a
/// valid callback address, and its low bit is set so the decoder must
/// check for it before the tag bit.
pub(crate) const FCT_MARK: usize = !0;

/// Default ring capacity (slots) for a freshly registered thread.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1 << 14;

/// Headroom kept free so one call can always append its worst case of
/// three slots (mark + callback + argument) after the fullness check.
pub(crate) const RESERVE_SLOTS: u64 = 2;

/// Fixed-capacity ring of deferred callbacks owned by one producer thread.
pub(crate) struct DeferQueue {
    /// Next slot to write. Stored only by the owning producer.
    head: CachePadded<AtomicU64>,
    /// Next slot to consume. Stored only under the defer mutex.
    tail: CachePadded<AtomicU64>,
    ring: Box<[AtomicUsize]>,
    mask: u64,
    /// Last callback address the producer wrote into the stream.
    /// Producer-only scratch; relaxed accesses.
    last_fct_in: AtomicUsize,
    /// Last callback address the drainer decoded from the stream.
    /// Drainer-only scratch, serialized by the defer mutex.
    last_fct_out: AtomicUsize,
}

impl DeferQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity >= 4,
            "defer queue capacity must be a power of two >= 4, got {capacity}"
        );
        let ring = (0..capacity)
            .map(|_| AtomicUsize::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            ring,
            mask: capacity as u64 - 1,
            last_fct_in: AtomicUsize::new(0),
            last_fct_out: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u64 {
        self.mask + 1
    }

    #[inline]
    fn slot(&self, index: u64) -> &AtomicUsize {
        &self.ring[(index & self.mask) as usize]
    }

    /// `head` as seen by the barrier engine. Acquired so that a drain up
    /// to this snapshot sees every slot write published before it.
    #[inline]
    pub(crate) fn snapshot_head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn tail(&self) -> u64 {
        self.tail.load(Ordering::Relaxed)
    }

    /// Occupied slot count: `head - tail`, wrapping.
    #[inline]
    pub(crate) fn occupied(&self) -> u64 {
        self.snapshot_head().wrapping_sub(self.tail.load(Ordering::Acquire))
    }

    /// Producer-side fullness probe. The owner's own `head` needs no
    /// ordering; `tail` is acquired so slot reuse never precedes the
    /// drainer's release of it.
    #[inline]
    pub(crate) fn needs_drain(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) >= self.capacity() - RESERVE_SLOTS
    }

    /// Append one `(fct, arg)` record. Owner thread only; the caller must
    /// have ensured at least three free slots (see [`needs_drain`]).
    ///
    /// Writes 1-3 slots, release-publishes the new `head`, then issues the
    /// full fence that orders the publish before the producer's read of the
    /// wake futex.
    ///
    /// [`needs_drain`]: DeferQueue::needs_drain
    pub(crate) fn push(&self, fct: DeferFn, arg: *mut ()) {
        let mut head = self.head.load(Ordering::Relaxed);
        let fct_bits = fct as usize;
        let arg_bits = arg as usize;

        if self.last_fct_in.load(Ordering::Relaxed) != fct_bits {
            self.last_fct_in.store(fct_bits, Ordering::Relaxed);
            if fct_bits & FCT_BIT != 0 || fct_bits | FCT_BIT == FCT_MARK {
                // Tagged form would be ambiguous; escape with the mark.
                self.slot(head).store(FCT_MARK, Ordering::Release);
                head = head.wrapping_add(1);
                self.slot(head).store(fct_bits, Ordering::Release);
                head = head.wrapping_add(1);
            } else {
                self.slot(head).store(fct_bits | FCT_BIT, Ordering::Release);
                head = head.wrapping_add(1);
            }
        } else if arg_bits & FCT_BIT != 0 || arg_bits == FCT_MARK {
            // A bare argument would decode as a tag or the mark; re-emit
            // the callback through the escape form.
            self.slot(head).store(FCT_MARK, Ordering::Release);
            head = head.wrapping_add(1);
            self.slot(head).store(fct_bits, Ordering::Release);
            head = head.wrapping_add(1);
        }
        self.slot(head).store(arg_bits, Ordering::Release);
        head = head.wrapping_add(1);

        self.head.store(head, Ordering::Release);
        // Publish head before reading the wake futex.
        fence(Ordering::SeqCst);
    }

    /// Decode and invoke every record from `tail` up to (not including)
    /// `to_head`, then release the consumed slots by advancing `tail`.
    ///
    /// # Safety
    ///
    /// The caller must hold the defer mutex (sole drainer), `to_head` must
    /// be a value returned by [`snapshot_head`], and a full grace period
    /// must have elapsed since that snapshot was taken.
    ///
    /// [`snapshot_head`]: DeferQueue::snapshot_head
    pub(crate) unsafe fn drain(&self, to_head: u64) {
        let mut i = self.tail.load(Ordering::Relaxed);
        let mut last_fct_out = self.last_fct_out.load(Ordering::Relaxed);

        while i != to_head {
            let mut value = self.slot(i).load(Ordering::Acquire);
            i = i.wrapping_add(1);
            if value == FCT_MARK {
                last_fct_out = self.slot(i).load(Ordering::Acquire);
                i = i.wrapping_add(1);
                value = self.slot(i).load(Ordering::Acquire);
                i = i.wrapping_add(1);
            } else if value & FCT_BIT != 0 {
                last_fct_out = value & !FCT_BIT;
                value = self.slot(i).load(Ordering::Acquire);
                i = i.wrapping_add(1);
            }
            // SAFETY: last_fct_out was written by push() from a valid
            // DeferFn; the stream between tail and a published head always
            // starts with a tagged or escaped callback, so it is non-zero
            // here. The grace-period precondition makes the call itself
            // sound for reclamation callbacks.
            let fct: DeferFn = unsafe { core::mem::transmute::<usize, DeferFn>(last_fct_out) };
            unsafe { fct(value as *mut ()) };
        }

        self.last_fct_out.store(last_fct_out, Ordering::Relaxed);
        // Slots become reusable by the producer only after the callbacks
        // above have retired.
        self.tail.store(i, Ordering::Release);
    }
}
