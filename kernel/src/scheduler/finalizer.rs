/*
 * Finalizer
 *
 * Exited threads are not torn down on the CPU they exit on: the exiting
 * thread is still running on its own stack. `exit_current` marks the thread
 * Dying, queues it here and wakes the finalizer thread, a low-priority
 * kernel thread that later:
 *
 * 1. waits until no CPU is executing on the thread any more
 * 2. releases its kernel stack
 * 3. marks it Dead and drops it from the thread table
 * 4. drops it from its process, which becomes a zombie with the last one
 *
 * No scheduling decision ever waits for reclamation.
 */

use alloc::{collections::VecDeque, sync::Arc};
use core::sync::atomic::{AtomicU64, Ordering};

use super::{
    Kernel,
    thread::{Thread, ThreadBuilder, ThreadFlags, ThreadId, ThreadState},
    types::Priority,
};
use crate::arch::Arch;
use crate::error::SchedError;
use crate::sync::{Spinlock, WaitQueue};

pub(crate) struct Finalizer<A: Arch> {
    pending: Spinlock<A, VecDeque<Arc<Thread<A>>>>,
    wakeup: WaitQueue<A>,
    thread: Spinlock<A, Option<ThreadId>>,
    reclaimed: AtomicU64,
}

impl<A: Arch> Finalizer<A> {
    pub(crate) fn new() -> Self {
        Self {
            pending: Spinlock::new(VecDeque::new()),
            wakeup: WaitQueue::fifo(),
            thread: Spinlock::new(None),
            reclaimed: AtomicU64::new(0),
        }
    }

    pub(crate) fn push(&self, thread: Arc<Thread<A>>) {
        self.pending.lock().push_back(thread);
    }

    pub(crate) fn notify(&self, kernel: &Kernel<A>) {
        self.wakeup.wake_one(kernel);
    }

    fn pop(&self) -> Option<Arc<Thread<A>>> {
        self.pending.lock().pop_front()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) fn try_pending_len(&self) -> Option<usize> {
        self.pending.try_lock().map(|p| p.len())
    }
}

impl<A: Arch> Kernel<A> {
    /// Start the finalizer thread
    pub fn start_finalizer(&'static self) -> Result<ThreadId, SchedError> {
        if self.finalizer_thread().is_some() {
            return Err(SchedError::InvalidState);
        }

        let thread = ThreadBuilder::new("finalizer")
            .priority(Priority::MIN)
            .flags(ThreadFlags::FINALIZER)
            .spawn(self, move || {
                loop {
                    let _ = self.finalizer.wakeup.block_if_uninterruptible(self, None, || {
                        self.finalizer.pending_len() == 0
                    });
                    self.run_finalizer_pass();
                }
            })?;

        *self.finalizer.thread.lock() = Some(thread.id);
        log::info!("Finalizer started as {}", thread.id);
        Ok(thread.id)
    }

    /// Finalizer thread ID, once started
    pub fn finalizer_thread(&self) -> Option<ThreadId> {
        *self.finalizer.thread.lock()
    }

    /// Threads exited but not yet finalized
    pub fn pending_finalization(&self) -> usize {
        self.finalizer.pending_len()
    }

    /// Threads finalized so far
    pub fn finalized_count(&self) -> u64 {
        self.finalizer.reclaimed.load(Ordering::Relaxed)
    }

    /// Finalize every queued Dying thread; returns how many were reclaimed
    pub fn run_finalizer_pass(&self) -> usize {
        let mut count = 0;
        while let Some(thread) = self.finalizer.pop() {
            self.reclaim_thread(thread);
            count += 1;
        }
        count
    }

    fn reclaim_thread(&self, thread: Arc<Thread<A>>) {
        // The exiting CPU may still be switching away from it
        while thread.is_on_cpu() {
            core::hint::spin_loop();
        }

        let stack = thread.stack.lock().take();
        let code = {
            let mut s = thread.sched.lock();
            if s.state != ThreadState::Dying {
                let state = s.state;
                drop(s);
                self.fatal(format_args!("finalizing {} in state {:?}", thread.id, state));
            }
            s.state = ThreadState::Dead;
            s.exit_code.unwrap_or(0)
        };
        drop(stack);
        self.threads.lock().remove(&thread.id);
        self.finalizer.reclaimed.fetch_add(1, Ordering::Relaxed);
        log::debug!("Finalized {} '{}' (exit code {})", thread.id, thread.name(), code);

        let process = thread.process.clone();
        if process.detach_thread(thread.id, code) {
            self.process_exited(&process);
        }
    }
}
