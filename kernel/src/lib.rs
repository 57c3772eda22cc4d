/*
 * CLUU Scheduler Core
 *
 * This crate is the scheduling and synchronization core of the CLUU kernel.
 * It decides which thread runs on which CPU, when a thread is preempted, how
 * threads sleep and wake on queues, and how mutual exclusion works across
 * interrupt and multi-processor contexts.
 *
 * LAYOUT:
 * =======
 *
 * - arch/       Hardware seam (interrupt flag, CPU id, IPIs, context switch)
 * - sync/       Spinlock, RecursiveSpinlock, WaitQueue, Mutex
 * - scheduler/  Threads, processes, per-CPU ready queues, finalizer
 * - config      Tunables (CPU count, tick length, stack size, time slices)
 * - error       Recoverable error type
 * - utils/      Logger backend for the `log` facade
 *
 * The crate is `no_std` for the kernel image. Test builds link std and run
 * the scheduler on `arch::host`, which simulates CPUs with OS threads.
 */

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod sync;
pub mod utils;

#[cfg(test)]
mod tests;

pub use config::{SchedConfig, TimeSliceTable};
pub use error::SchedError;
pub use scheduler::{
    BlockResult, CpuId, CpuMask, Kernel, Priority, Process, ProcessId, ProcessState,
    SchedClass, Thread, ThreadBuilder, ThreadId, ThreadState, TickMode,
};
pub use sync::{Mutex, MutexGuard, RawSpinlock, RecursiveSpinlock, Spinlock, WaitOrder, WaitQueue};
