//! Ertele: batched deferred reclamation for userspace RCU.
//! Amortized grace periods, per-thread queues, predictable producer cost.
//!
//! Ertele implements the write-side half of an RCU reclamation scheme:
//! producer threads queue `(callback, argument)` pairs into their own
//! lock-free rings, and a background reclamation thread periodically pays
//! **one** grace period for everything queued so far, then runs the
//! callbacks. The grace-period primitive itself is an external
//! collaborator supplied as a [`GracePeriod`] implementation.
//!
//! # Key Features
//!
//! - **Cheap producers**: queuing a callback is a few ring stores plus one
//!   futex-word load; no locks on the hot path
//! - **Amortized grace periods**: one `synchronize` per barrier pass, no
//!   matter how many callbacks or threads are batched into it
//! - **Compact rings**: callback addresses are low-bit tagged and
//!   suppressed across bursts of the same callback, so the common slot
//!   cost is one word per deferred call
//! - **Green idling**: the reclamation thread sleeps on a wake channel and
//!   is only nudged when work is published
//!
//! # Example
//!
//! ```rust
//! use ertele::DeferDomain;
//!
//! // Plug in the real reader-side synchronize here.
//! let domain = DeferDomain::new(|| { /* synchronize_rcu() */ });
//!
//! let handle = domain.register();
//! for value in 0..1024u64 {
//!     let stale: *mut u64 = Box::into_raw(Box::new(value));
//!     // Runs drop(Box::from_raw(stale)) once a grace period has passed.
//!     unsafe { handle.defer_drop(stale) };
//! }
//!
//! // Force everything queued so far through one grace period.
//! domain.barrier();
//! ```
//!
//! # Guarantees and non-guarantees
//!
//! Each queued callback runs exactly once, after a grace period that
//! started after its enqueue completed. Callbacks of one thread run in
//! enqueue order; across threads no order is promised. A callback queued
//! concurrently with a [`barrier`](DeferDomain::barrier) call from another
//! thread may land in the next batch unless the enqueue is ordered before
//! the call by external synchronization.
//!
//! Faults are not recoverable: allocation failure, thread-spawn failure,
//! and deregistering an unknown thread all panic, since an engine that
//! frees memory cannot meaningfully half-succeed.
//!
//! Concurrency-sensitive internals have `loom` interleaving tests; run
//! them with `RUSTFLAGS="--cfg loom" cargo test --release loom_`.

#![warn(missing_docs)]

mod domain;
mod grace;
mod queue;
mod reclaim;
mod registry;
mod wake;

pub use domain::{DEFAULT_COALESCE_DELAY, DeferConfig, DeferDomain, DefererHandle};
pub use grace::GracePeriod;
pub use queue::{DEFAULT_QUEUE_CAPACITY, DeferFn};
