/*
 * Synchronization Primitives
 *
 * - spinlock:   busy-waiting, interrupt-safe, never sleeps
 * - wait_queue: blocking primitive every sleeping wait is built on
 * - mutex:      recursive sleeping lock on top of a wait queue
 *
 * Spinlock critical sections must be short and must not block: blocking
 * with a spinlock held is caught because the lock keeps interrupts disabled.
 */

pub mod mutex;
pub mod spinlock;
pub mod wait_queue;

pub use mutex::{Mutex, MutexGuard};
pub use spinlock::{RawSpinlock, RecursiveSpinlock, RecursiveSpinlockGuard, Spinlock, SpinlockGuard};
pub use wait_queue::{WaitOrder, WaitQueue};
