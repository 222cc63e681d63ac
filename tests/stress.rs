//! Stress tests for the batched defer engine
//!
//! These push the producer encoding and the barrier machinery with
//! adversarial argument values, long bursts, and thread churn.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ertele::{DeferConfig, DeferDomain};

fn noop_grace() -> impl Fn() + Send + Sync + 'static {
    || {}
}

/// Argument patterns the slot encoding must escape or pass through:
/// plain even values, low-bit-set values, zero, and the all-ones
/// sentinel alias.
fn adversarial_arg(rng: &mut StdRng, salt: usize) -> usize {
    match rng.random_range(0..4u32) {
        0 => (salt << 4) & !1,
        1 => (salt << 4) | 1,
        2 => 0,
        _ => usize::MAX,
    }
}

#[test]
fn test_million_defers_single_thread() {
    const CALLS: usize = 1_000_000;

    static OBSERVED: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    unsafe fn observe_a(p: *mut ()) {
        OBSERVED.lock().unwrap().push(p as usize);
    }
    unsafe fn observe_b(p: *mut ()) {
        OBSERVED.lock().unwrap().push(!(p as usize));
    }

    let domain = DeferDomain::with_config(
        noop_grace(),
        DeferConfig {
            queue_capacity: 1 << 10,
            coalesce_delay: Duration::from_secs(3600),
        },
    );
    let handle = domain.register();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut expected = Vec::with_capacity(CALLS);

    for i in 0..CALLS {
        let arg = adversarial_arg(&mut rng, i);
        // Runs of the same callback exercise suppression; switches
        // exercise the tag and escape forms.
        if rng.random_range(0..8u32) == 0 {
            unsafe { handle.defer(observe_b, arg as *mut ()) };
            expected.push(!arg);
        } else {
            unsafe { handle.defer(observe_a, arg as *mut ()) };
            expected.push(arg);
        }
    }
    domain.barrier();

    let observed = OBSERVED.lock().unwrap();
    assert_eq!(observed.len(), CALLS);
    assert_eq!(*observed, expected);
}

#[test]
fn test_concurrent_producers_preserve_per_thread_order() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 20_000;

    static OBSERVED: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    unsafe fn observe(p: *mut ()) {
        OBSERVED.lock().unwrap().push(p as usize);
    }
    OBSERVED.lock().unwrap().clear();

    let domain = DeferDomain::with_config(
        noop_grace(),
        DeferConfig {
            queue_capacity: 1 << 8,
            coalesce_delay: Duration::from_millis(1),
        },
    );

    let mut workers = Vec::new();
    for tid in 0..THREADS {
        let domain = domain.clone();
        workers.push(thread::spawn(move || {
            let handle = domain.register();
            for i in 0..PER_THREAD {
                // Tag the producer in the high bits; keep the low bit
                // wiggling so escapes happen under contention too.
                let value = (tid << 56) | (i << 1) | (i & 1);
                unsafe { handle.defer(observe, value as *mut ()) };
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    // All handles dropped: every queue was drained on deregistration.
    assert_eq!(domain.pending_slots(), 0);

    let observed = OBSERVED.lock().unwrap();
    assert_eq!(observed.len(), THREADS * PER_THREAD);

    let mut per_thread: HashMap<usize, Vec<usize>> = HashMap::new();
    for &value in observed.iter() {
        per_thread.entry(value >> 56).or_default().push(value);
    }
    for tid in 0..THREADS {
        let values = &per_thread[&tid];
        let expected: Vec<usize> = (0..PER_THREAD)
            .map(|i| (tid << 56) | (i << 1) | (i & 1))
            .collect();
        assert_eq!(*values, expected, "producer {tid} order broken");
    }
}

#[test]
fn test_registration_churn_under_load() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 50;
    const PER_ROUND: usize = 200;

    let executed = Arc::new(AtomicUsize::new(0));
    // The argument is the counter itself; callbacks bump it.
    unsafe fn bump(p: *mut ()) {
        let counter = unsafe { &*p.cast::<AtomicUsize>() };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    let domain = DeferDomain::with_config(
        noop_grace(),
        DeferConfig {
            queue_capacity: 1 << 6,
            coalesce_delay: Duration::from_millis(1),
        },
    );

    let mut workers = Vec::new();
    for tid in 0..THREADS {
        let domain = domain.clone();
        let executed = executed.clone();
        workers.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(tid as u64);
            for _ in 0..ROUNDS {
                // Fresh registration every round: the reclamation thread
                // starts and stops as the registry empties and refills.
                let handle = domain.register();
                for _ in 0..PER_ROUND {
                    unsafe {
                        handle.defer(bump, Arc::as_ptr(&executed).cast_mut().cast());
                    }
                    if rng.random_range(0..64u32) == 0 {
                        handle.barrier_local();
                    }
                }
                if rng.random_range(0..2u32) == 0 {
                    domain.barrier();
                }
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(domain.pending_slots(), 0);
    assert_eq!(executed.load(Ordering::SeqCst), THREADS * ROUNDS * PER_ROUND);
}

#[test]
fn test_barrier_hammering_from_unregistered_thread() {
    const PRODUCED: usize = 50_000;

    let executed = Arc::new(AtomicUsize::new(0));
    unsafe fn bump(p: *mut ()) {
        let counter = unsafe { &*p.cast::<AtomicUsize>() };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    let domain = DeferDomain::with_config(
        noop_grace(),
        DeferConfig {
            queue_capacity: 1 << 8,
            coalesce_delay: Duration::from_millis(1),
        },
    );

    let producer = {
        let domain = domain.clone();
        let executed = executed.clone();
        thread::spawn(move || {
            let handle = domain.register();
            for _ in 0..PRODUCED {
                unsafe {
                    handle.defer(bump, Arc::as_ptr(&executed).cast_mut().cast());
                }
            }
        })
    };

    // Global barriers race the producer and the reclamation thread; each
    // drains whatever was published at its snapshot.
    while !producer.is_finished() {
        domain.barrier();
    }
    producer.join().unwrap();
    domain.barrier();

    assert_eq!(executed.load(Ordering::SeqCst), PRODUCED);
    assert_eq!(domain.pending_slots(), 0);
}
