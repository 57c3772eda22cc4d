/*
 * Sleeping Mutex
 *
 * A recursive, blocking lock built on a WaitQueue. A contended lock() puts
 * the caller to sleep instead of spinning, so a Mutex may be held across
 * operations that themselves block. It must never be taken from interrupt
 * context; that misuse is caught at the first point where the caller would
 * have to sleep.
 *
 * STATE:
 * ======
 *
 * owner == None  <=>  recursion == 0
 *
 * Only the owner can raise the recursion count. unlock() by anyone but the
 * owner is fatal. Releasing the last level clears the owner and wakes one
 * waiter, which retries ownership (another thread may have slipped in).
 */

use crate::arch::Arch;
use crate::scheduler::{Kernel, ThreadId};

use super::spinlock::Spinlock;
use super::wait_queue::WaitQueue;

#[derive(Debug, Default, Clone, Copy)]
struct MutexState {
    owner: Option<ThreadId>,
    recursion: u32,
}

/// Recursive sleeping lock
pub struct Mutex<A: Arch> {
    state: Spinlock<A, MutexState>,
    waiters: WaitQueue<A>,
}

impl<A: Arch> Mutex<A> {
    pub fn new() -> Self {
        Self {
            state: Spinlock::new(MutexState::default()),
            waiters: WaitQueue::fifo(),
        }
    }

    /// Acquire the mutex for the calling thread, sleeping while contended
    pub fn lock(&self, kernel: &Kernel<A>) {
        let me = kernel.current_thread_id();
        loop {
            if self.try_lock_as(me) {
                return;
            }
            let slept = self
                .waiters
                .block_if_uninterruptible(kernel, None, || !self.try_lock_as(me));
            if slept.is_none() {
                // Ownership was taken while checking under the queue lock
                return;
            }
        }
    }

    /// Acquire without sleeping; false if another thread owns it
    pub fn try_lock(&self, kernel: &Kernel<A>) -> bool {
        self.try_lock_as(kernel.current_thread_id())
    }

    /// Release one level of ownership
    pub fn unlock(&self, kernel: &Kernel<A>) {
        let me = kernel.current_thread_id();
        let released = {
            let mut state = self.state.lock();
            if state.owner != Some(me) {
                let owner = state.owner;
                drop(state);
                match owner {
                    Some(owner) => {
                        kernel.fatal(format_args!("mutex unlocked by {} but owned by {}", me, owner))
                    }
                    None => kernel.fatal(format_args!("mutex unlocked by {} but not locked", me)),
                }
            }
            state.recursion -= 1;
            if state.recursion == 0 {
                state.owner = None;
                true
            } else {
                false
            }
        };
        if released {
            self.waiters.wake_one(kernel);
        }
    }

    /// Acquire and return a guard that unlocks on drop
    pub fn lock_guard<'a>(&'a self, kernel: &'a Kernel<A>) -> MutexGuard<'a, A> {
        self.lock(kernel);
        MutexGuard { mutex: self, kernel }
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }

    pub fn recursion_count(&self) -> u32 {
        self.state.lock().recursion
    }

    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// Threads sleeping on the mutex, in wake order
    pub fn waiters(&self) -> alloc::vec::Vec<ThreadId> {
        self.waiters.waiters()
    }

    fn try_lock_as(&self, me: ThreadId) -> bool {
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(me);
                state.recursion = 1;
                true
            }
            Some(owner) if owner == me => {
                state.recursion += 1;
                true
            }
            Some(_) => false,
        }
    }
}

impl<A: Arch> Default for Mutex<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one level of a `Mutex` until dropped
pub struct MutexGuard<'a, A: Arch> {
    mutex: &'a Mutex<A>,
    kernel: &'a Kernel<A>,
}

impl<A: Arch> Drop for MutexGuard<'_, A> {
    fn drop(&mut self) {
        self.mutex.unlock(self.kernel);
    }
}
