/*
 * Wait Queues
 *
 * The canonical blocking primitive: an ordered set of blocked threads
 * attached to a resource or event. Drivers, IPC and the Mutex all sleep
 * here.
 *
 * ORDERING:
 * =========
 *
 * - Fifo: the thread that blocked first is woken first
 * - Priority: highest priority first, FIFO among equal priorities
 *
 * LOCKING:
 * ========
 *
 * The blocked list lives behind its own spinlock and every operation takes
 * it. Callers that must test a resource and sleep atomically pass the test
 * to `block_if`, which evaluates it with the list lock held; any waker that
 * changes the resource before calling `wake_*` then cannot be missed.
 *
 * A blocked thread keeps a handle to the list it sits on (`blocked_on`),
 * so a timeout or a signal can take it off the right list.
 */

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};

use crate::arch::{Arch, InterruptGuard};
use crate::scheduler::{
    BlockResult, Kernel, Priority, Thread, ThreadId, ThreadState,
    sched_core::SwitchReason,
};

use super::spinlock::Spinlock;

/// Wake order of a wait queue
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum WaitOrder {
    #[default]
    Fifo,
    Priority,
}

struct Waiter<A: Arch> {
    thread: Arc<Thread<A>>,
    priority: Priority,
}

/// The locked part of a wait queue
pub(crate) struct WaitList<A: Arch> {
    order: WaitOrder,
    waiters: VecDeque<Waiter<A>>,
}

/// Shared handle to a blocked list, stored in each waiter's `blocked_on`
pub(crate) type WaitHandle<A> = Arc<Spinlock<A, WaitList<A>>>;

impl<A: Arch> WaitList<A> {
    fn new(order: WaitOrder) -> Self {
        Self {
            order,
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn insert(&mut self, thread: Arc<Thread<A>>, priority: Priority) {
        let waiter = Waiter { thread, priority };
        match self.order {
            WaitOrder::Fifo => self.waiters.push_back(waiter),
            WaitOrder::Priority => {
                let pos = self
                    .waiters
                    .iter()
                    .position(|w| w.priority < priority)
                    .unwrap_or(self.waiters.len());
                self.waiters.insert(pos, waiter);
            }
        }
    }

    pub(crate) fn pop_front(&mut self) -> Option<Arc<Thread<A>>> {
        self.waiters.pop_front().map(|w| w.thread)
    }

    pub(crate) fn remove(&mut self, thread: &Arc<Thread<A>>) -> bool {
        match self.waiters.iter().position(|w| Arc::ptr_eq(&w.thread, thread)) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Re-sort a waiter after its priority changed
    pub(crate) fn reposition(&mut self, thread: &Arc<Thread<A>>, priority: Priority) {
        if self.remove(thread) {
            self.insert(thread.clone(), priority);
        }
    }

    pub(crate) fn occurrences(&self, id: ThreadId) -> usize {
        self.waiters.iter().filter(|w| w.thread.id == id).count()
    }

    pub(crate) fn threads(&self) -> impl Iterator<Item = &Arc<Thread<A>>> {
        self.waiters.iter().map(|w| &w.thread)
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}

/// Queue of threads blocked on a resource or event
pub struct WaitQueue<A: Arch> {
    list: WaitHandle<A>,
}

impl<A: Arch> WaitQueue<A> {
    pub fn new(order: WaitOrder) -> Self {
        Self {
            list: Arc::new(Spinlock::new(WaitList::new(order))),
        }
    }

    pub fn fifo() -> Self {
        Self::new(WaitOrder::Fifo)
    }

    pub fn priority() -> Self {
        Self::new(WaitOrder::Priority)
    }

    /// Address-based identity, used in diagnostics
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.list) as *const () as usize
    }

    /// Block the calling thread until woken, timed out or signalled
    ///
    /// `timeout_ms` of `Some(0)` polls: it returns `Timeout` without sleeping.
    pub fn block(&self, kernel: &Kernel<A>, timeout_ms: Option<u64>) -> BlockResult {
        self.wait(kernel, timeout_ms, true, || true)
            .unwrap_or(BlockResult::Signaled)
    }

    /// Block only if `still_blocked()` holds, evaluated under the queue lock
    ///
    /// Returns `None` without sleeping when the condition is already false.
    pub fn block_if(
        &self,
        kernel: &Kernel<A>,
        timeout_ms: Option<u64>,
        still_blocked: impl FnMut() -> bool,
    ) -> Option<BlockResult> {
        self.wait(kernel, timeout_ms, true, still_blocked)
    }

    /// Like `block`, but signals do not end the wait
    pub fn block_uninterruptible(&self, kernel: &Kernel<A>, timeout_ms: Option<u64>) -> BlockResult {
        self.wait(kernel, timeout_ms, false, || true)
            .unwrap_or(BlockResult::Signaled)
    }

    /// Like `block_if`, but signals do not end the wait
    pub fn block_if_uninterruptible(
        &self,
        kernel: &Kernel<A>,
        timeout_ms: Option<u64>,
        still_blocked: impl FnMut() -> bool,
    ) -> Option<BlockResult> {
        self.wait(kernel, timeout_ms, false, still_blocked)
    }

    fn wait(
        &self,
        kernel: &Kernel<A>,
        timeout_ms: Option<u64>,
        interruptible: bool,
        mut still_blocked: impl FnMut() -> bool,
    ) -> Option<BlockResult> {
        if A::in_interrupt() {
            kernel.fatal(format_args!("blocking wait from interrupt context"));
        }
        if !A::interrupts_enabled() {
            kernel.fatal(format_args!(
                "blocking wait with interrupts disabled (spinlock held?)"
            ));
        }

        let _irq = InterruptGuard::<A>::new();
        let cpu = A::current_cpu();
        let me = kernel.current_thread_on(cpu);
        if me.is_idle() {
            kernel.fatal(format_args!("idle thread {} attempted to block", me.id));
        }

        {
            let mut list = self.list.lock();
            if !still_blocked() {
                return None;
            }
            if timeout_ms == Some(0) {
                return Some(BlockResult::Timeout);
            }
            let priority = {
                let mut s = me.sched.lock();
                if interruptible && me.has_pending_signals() {
                    return Some(BlockResult::Interrupted);
                }
                s.state = ThreadState::Blocked;
                s.blocked_on = Some(self.list.clone());
                s.wait_result = None;
                s.interruptible = interruptible;
                s.timeout = timeout_ms.map(|ms| kernel.arm_timeout(me.id, ms));
                s.priority
            };
            list.insert(me.clone(), priority);
            log::trace!("{} blocked on wait queue {:#x}", me.id, self.id());
        }

        kernel.schedule(cpu, SwitchReason::Block);

        let result = me.sched.lock().wait_result.take();
        Some(result.unwrap_or(BlockResult::Signaled))
    }

    /// Wake the first waiter; false if nobody was waiting
    pub fn wake_one(&self, kernel: &Kernel<A>) -> bool {
        let mut list = self.list.lock();
        match list.pop_front() {
            Some(thread) => {
                kernel.complete_wait(&thread, BlockResult::Signaled);
                true
            }
            None => false,
        }
    }

    /// Wake every waiter, returning how many were woken
    pub fn wake_all(&self, kernel: &Kernel<A>) -> usize {
        let mut list = self.list.lock();
        let mut woken = 0;
        while let Some(thread) = list.pop_front() {
            kernel.complete_wait(&thread, BlockResult::Signaled);
            woken += 1;
        }
        woken
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// IDs of the blocked threads in wake order
    pub fn waiters(&self) -> Vec<ThreadId> {
        self.list.lock().threads().map(|t| t.id).collect()
    }
}

impl<A: Arch> Default for WaitQueue<A> {
    fn default() -> Self {
        Self::fifo()
    }
}
