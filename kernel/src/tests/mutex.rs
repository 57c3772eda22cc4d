/*
 * Mutex Tests
 */

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{SecondaryCpu, Trace, boot, leak, run_until};
use crate::arch::host::HostArch;
use crate::scheduler::{CpuId, Priority};
use crate::sync::Mutex;

#[test]
fn recursive_locking_balances() {
    let kernel = boot(1);
    let mutex: Mutex<HostArch> = Mutex::new();
    let me = kernel.current_thread_id();

    mutex.lock(kernel);
    mutex.lock(kernel);
    assert!(mutex.try_lock(kernel));
    assert_eq!(mutex.owner(), Some(me));
    assert_eq!(mutex.recursion_count(), 3);

    mutex.unlock(kernel);
    mutex.unlock(kernel);
    assert_eq!(mutex.owner(), Some(me));
    assert_eq!(mutex.recursion_count(), 1);

    mutex.unlock(kernel);
    assert_eq!(mutex.owner(), None);
    assert_eq!(mutex.recursion_count(), 0);
}

#[test]
fn guard_unlocks_on_drop() {
    let kernel = boot(1);
    let mutex: Mutex<HostArch> = Mutex::new();
    {
        let _guard = mutex.lock_guard(kernel);
        assert!(mutex.is_locked());
    }
    assert!(!mutex.is_locked());
}

#[test]
fn try_lock_fails_while_other_thread_owns() {
    let kernel = boot(1);
    let mutex: &'static Mutex<HostArch> = leak(Mutex::new());
    let trace = Trace::new();

    let t = trace.clone();
    kernel
        .spawn_kernel_thread("holder", Priority::NORMAL, move || {
            mutex.lock(kernel);
            t.push("held");
            kernel.yield_now();
            mutex.unlock(kernel);
        })
        .unwrap();

    let t = trace.clone();
    kernel
        .spawn_kernel_thread("contender", Priority::NORMAL, move || {
            t.push(format!("try_lock {}", mutex.try_lock(kernel)));
        })
        .unwrap();

    kernel.yield_now();
    assert_eq!(trace.entries(), ["held", "try_lock false"]);
    assert!(!mutex.is_locked());
}

#[test]
fn contended_mutex_excludes_across_cpus() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 25;

    let kernel = boot(2);
    let _cpu1 = SecondaryCpu::start(kernel, CpuId(1));
    let mutex: &'static Mutex<HostArch> = leak(Mutex::new());
    let inside = leak(AtomicBool::new(false));
    let overlaps = leak(AtomicUsize::new(0));
    let counter = leak(AtomicUsize::new(0));
    let finished = leak(AtomicUsize::new(0));

    for i in 0..THREADS {
        kernel
            .spawn_kernel_thread(&format!("contender-{}", i), Priority::NORMAL, move || {
                for round in 0..ROUNDS {
                    mutex.lock(kernel);
                    if inside.swap(true, Ordering::AcqRel) {
                        overlaps.fetch_add(1, Ordering::Relaxed);
                    }
                    counter.fetch_add(1, Ordering::Relaxed);
                    if round % 5 == 0 {
                        // sleep while holding it so others pile up
                        kernel.yield_now();
                    }
                    inside.store(false, Ordering::Release);
                    mutex.unlock(kernel);
                }
                finished.fetch_add(1, Ordering::AcqRel);
            })
            .unwrap();
    }

    run_until(kernel, || finished.load(Ordering::Acquire) == THREADS);
    assert_eq!(counter.load(Ordering::Relaxed), THREADS * ROUNDS);
    assert_eq!(overlaps.load(Ordering::Relaxed), 0);
    assert!(!mutex.is_locked());
    assert!(mutex.waiters().is_empty());
}

#[test]
#[should_panic(expected = "but not locked")]
fn unlocking_free_mutex_is_fatal() {
    let kernel = boot(1);
    let mutex: Mutex<HostArch> = Mutex::new();
    mutex.unlock(kernel);
}

#[test]
#[should_panic(expected = "but owned by")]
fn unlock_by_non_owner_is_fatal() {
    let kernel = boot(1);
    let mutex: &'static Mutex<HostArch> = leak(Mutex::new());
    kernel
        .spawn_kernel_thread("leaker", Priority::NORMAL, move || mutex.lock(kernel))
        .unwrap();
    kernel.yield_now();
    assert!(mutex.is_locked());
    mutex.unlock(kernel);
}
