/*
 * Scheduler Test Suite
 *
 * End-to-end tests that run the real scheduler on the host backend.
 *
 * HARNESS:
 * ========
 *
 * - `boot(n)` builds a kernel for `n` CPUs and adopts the test body as
 *   CPU 0's idle thread. The test body therefore only runs while CPU 0 has
 *   nothing else to do: `kernel.yield_now()` runs every runnable CPU 0
 *   thread until all of them blocked or exited.
 * - `SecondaryCpu::start` brings another CPU online on its own OS thread,
 *   polling `idle_once` until dropped.
 * - `tick` delivers one simulated timer interrupt to CPU 0 followed by the
 *   interrupt-return preemption point.
 *
 * Kernel threads record what they observe in a `Trace`; assertions run on
 * the test thread (a panic on a simulated kernel thread aborts the binary).
 *
 * Modules:
 * - scenarios:  mutex handoff, priority pick, timeout, exit/finalize
 * - waiting:    wake order, signals, sleep, misuse of blocking waits
 * - mutex:      recursion, contention across CPUs, unlock misuse
 * - lifecycle:  thread creation errors, priorities, accounting
 * - processes:  groups, sessions, zombies, reaping, address spaces
 * - smp:        placement, IPIs, affinity migration
 * - diagnostics: state dump and invariant checks
 */

mod diagnostics;
mod mutex;
mod smp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::arch::host::{self, HostAddressSpace, HostArch};
use crate::config::SchedConfig;
use crate::scheduler::{CpuId, Kernel, TickMode};

pub(crate) type K = Kernel<HostArch>;

/// Kernel for `cpus` CPUs with CPU 0 online and the caller as its idle thread
pub(crate) fn boot(cpus: usize) -> &'static K {
    boot_with(SchedConfig::default().with_cpus(cpus))
}

pub(crate) fn boot_with(config: SchedConfig) -> &'static K {
    host::become_cpu(CpuId::BSP);
    let kernel = Kernel::new(config, HostAddressSpace::new()).expect("valid config");
    let kernel: &'static K = Box::leak(Box::new(kernel));
    kernel.bootstrap_cpu(CpuId::BSP).expect("CPU 0 comes online");
    kernel
}

/// Leak a value so kernel threads can borrow it for `'static`
pub(crate) fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// One timer interrupt on CPU 0, then the interrupt-return safe point
pub(crate) fn tick(kernel: &'static K) {
    host::interrupt(|| kernel.timer_tick(CpuId::BSP, TickMode::Kernel));
    kernel.preempt_point();
}

pub(crate) fn ticks(kernel: &'static K, n: usize) {
    for _ in 0..n {
        tick(kernel);
    }
}

/// Drive CPU 0 (ticks and yields) until `done` holds
pub(crate) fn run_until(kernel: &'static K, mut done: impl FnMut() -> bool) {
    for _ in 0..20_000 {
        if done() {
            return;
        }
        kernel.yield_now();
        tick(kernel);
        std::thread::sleep(Duration::from_micros(50));
    }
    panic!("condition not reached\n{}", kernel.dump_scheduler_state());
}

/// Ordered record of what kernel threads observed
#[derive(Clone, Default)]
pub(crate) struct Trace(Arc<StdMutex<Vec<String>>>);

impl Trace {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// A secondary CPU running its idle loop on a dedicated OS thread
pub(crate) struct SecondaryCpu {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SecondaryCpu {
    pub(crate) fn start(kernel: &'static K, cpu: CpuId) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::spawn(move || {
            host::become_cpu(cpu);
            kernel.bootstrap_cpu(cpu).expect("secondary CPU comes online");
            while !flag.load(Ordering::Acquire) {
                kernel.idle_once();
            }
        });
        while !kernel.is_cpu_online(cpu) {
            std::thread::yield_now();
        }
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for SecondaryCpu {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
