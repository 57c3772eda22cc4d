/*
 * Scheduler Core - Mechanism Layer
 *
 * This module implements the per-CPU scheduling mechanism:
 * 1. SchedulerState: the run queue, flags and counters of one CPU
 * 2. make_ready / complete_wait: every path that puts a thread on a ready
 *    queue (creation, wake, timeout, signal, migration)
 * 3. schedule: requeue the current thread, pick the next, switch
 * 4. timer_tick / preempt_point: slice accounting and deferred preemption
 *
 * The policy (which thread to run next) sits behind `SchedPolicy` and only
 * ever sees thread IDs and SchedEvents. This module owns "how": states,
 * locks, CPU placement, IPIs and the context switch.
 */

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use super::{
    Kernel,
    events::SchedEvent,
    thread::{Thread, ThreadId, ThreadState},
    traits::SchedPolicy,
    types::{BlockResult, CpuId, CpuMask, Priority, TickMode},
};
use crate::arch::{Arch, InterruptGuard};
use crate::error::SchedError;
use crate::sync::RecursiveSpinlock;

/// Why the running thread is leaving the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwitchReason {
    /// Voluntary yield, stays runnable
    Yield,
    /// Involuntary, at a safe point after need_resched was set
    Preempt,
    /// Sleeping on a wait queue
    Block,
    /// Exiting, handed to the finalizer
    Exit,
}

/// Counters of one CPU
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuStats {
    pub context_switches: u64,
    pub ticks: u64,
    pub idle_ticks: u64,
}

/// Run queue of one CPU, protected by `SchedulerState::rq`
pub(crate) struct CpuRunQueue<A: Arch> {
    pub(crate) policy: Box<dyn SchedPolicy>,
    pub(crate) current: Option<Arc<Thread<A>>>,
    pub(crate) idle: Option<Arc<Thread<A>>>,
    /// Thread switched away from, until the next thread finishes the switch
    pub(crate) prev: Option<Arc<Thread<A>>>,
    /// Thread leaving this CPU because its affinity excludes it
    pub(crate) migrating: Option<Arc<Thread<A>>>,
    pub(crate) timeslice_remaining: u32,
    pub(crate) stats: CpuStats,
}

/// Scheduling state of one logical CPU
///
/// The run queue sits behind a recursive spinlock: an interrupt handler on
/// the CPU that already holds it (or the fatal path dumping state) may take
/// it again. The atomics are read without the lock by placement and the
/// idle loop.
pub struct SchedulerState<A: Arch> {
    pub cpu: CpuId,
    online: AtomicBool,
    need_resched: AtomicBool,
    /// Ready threads plus the running non-idle thread
    load: AtomicUsize,
    /// Reschedule requests received from other CPUs
    ipis: AtomicU64,
    pub(crate) rq: RecursiveSpinlock<A, RefCell<CpuRunQueue<A>>>,
}

impl<A: Arch> SchedulerState<A> {
    pub(crate) fn new(cpu: CpuId, policy: Box<dyn SchedPolicy>) -> Self {
        Self {
            cpu,
            online: AtomicBool::new(false),
            need_resched: AtomicBool::new(false),
            load: AtomicUsize::new(0),
            ipis: AtomicU64::new(0),
            rq: RecursiveSpinlock::new(RefCell::new(CpuRunQueue {
                policy,
                current: None,
                idle: None,
                prev: None,
                migrating: None,
                timeslice_remaining: 0,
                stats: CpuStats::default(),
            })),
        }
    }

    pub(crate) fn install_idle(&self, idle: Arc<Thread<A>>) {
        {
            let rq = self.rq.lock();
            let mut q = rq.borrow_mut();
            q.current = Some(idle.clone());
            q.idle = Some(idle);
        }
        self.online.store(true, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    pub(crate) fn set_need_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    pub fn ipis_received(&self) -> u64 {
        self.ipis.load(Ordering::Relaxed)
    }

    pub(crate) fn current(&self) -> Option<Arc<Thread<A>>> {
        self.rq.lock().borrow().current.clone()
    }

    pub fn current_id(&self) -> Option<ThreadId> {
        self.current().map(|t| t.id)
    }

    pub fn idle_id(&self) -> Option<ThreadId> {
        self.rq.lock().borrow().idle.as_ref().map(|t| t.id)
    }

    /// Number of threads in the ready queue
    pub fn ready_len(&self) -> usize {
        self.rq.lock().borrow().policy.len()
    }

    /// Ready queue contents, highest priority first
    pub fn ready_threads(&self) -> Vec<(Priority, Vec<ThreadId>)> {
        self.rq.lock().borrow().policy.queued()
    }

    pub fn timeslice_remaining(&self) -> u32 {
        self.rq.lock().borrow().timeslice_remaining
    }

    pub fn stats(&self) -> CpuStats {
        self.rq.lock().borrow().stats
    }

    pub fn policy_name(&self) -> &'static str {
        self.rq.lock().borrow().policy.name()
    }
}

// ============================================================================
// MECHANISM
// ============================================================================

impl<A: Arch> Kernel<A> {
    /// Choose the ready queue a thread enters
    ///
    /// Among online CPUs in `affinity`: the CPU it last ran on if that one
    /// is no busier than the least-loaded CPU, otherwise the least-loaded
    /// CPU (lowest index on ties).
    pub(crate) fn select_cpu(&self, affinity: CpuMask, last: Option<CpuId>) -> CpuId {
        let allowed = affinity.intersect(self.online_mask());
        let mut best: Option<(CpuId, usize)> = None;
        for cpu in allowed.iter() {
            let load = self.state(cpu).load();
            if best.is_none_or(|(_, min)| load < min) {
                best = Some((cpu, load));
            }
        }
        let Some((least, min)) = best else {
            self.fatal(format_args!("no online CPU in affinity {:#x}", affinity.0))
        };
        match last {
            Some(cpu) if allowed.contains(cpu) && self.state(cpu).load() <= min => cpu,
            _ => least,
        }
    }

    /// Put `thread` on a ready queue and preempt the target if warranted
    pub(crate) fn make_ready(
        &self,
        thread: &Arc<Thread<A>>,
        event: impl FnOnce(ThreadId, Priority) -> SchedEvent,
    ) {
        let (affinity, last) = {
            let s = thread.sched.lock();
            (s.affinity, s.cpu)
        };
        let target = self.select_cpu(affinity, last);
        let state = self.state(target);

        let preempt = {
            let rq = state.rq.lock();
            let mut q = rq.borrow_mut();
            let priority = {
                let mut s = thread.sched.lock();
                s.state = ThreadState::Ready;
                s.cpu = Some(target);
                s.blocked_on = None;
                s.priority
            };
            let event = event(thread.id, priority);
            let urgent = event.should_reschedule_immediately();
            log::trace!("{} -> {} ready queue ({})", thread.id, target, event.name());
            q.policy.on_event(event);
            state.load.fetch_add(1, Ordering::AcqRel);

            urgent
                && match &q.current {
                    Some(current) => !Arc::ptr_eq(current, thread) && priority > current.priority(),
                    None => false,
                }
        };

        if preempt {
            self.request_reschedule(target);
        }
    }

    /// Ask `cpu` to run the scheduler at its next safe point
    pub(crate) fn request_reschedule(&self, cpu: CpuId) {
        let state = self.state(cpu);
        state.set_need_resched();
        if cpu != A::current_cpu() {
            state.ipis.fetch_add(1, Ordering::Relaxed);
            A::send_reschedule_ipi(cpu);
        }
    }

    /// End a blocked thread's wait with `result` and make it Ready
    ///
    /// The caller has already taken the thread off its wait list and still
    /// holds that list's lock.
    pub(crate) fn complete_wait(&self, thread: &Arc<Thread<A>>, result: BlockResult) {
        let timeout = {
            let mut s = thread.sched.lock();
            if s.state != ThreadState::Blocked {
                let state = s.state;
                drop(s);
                self.fatal(format_args!("woke {} in state {:?}", thread.id, state));
            }
            s.blocked_on = None;
            s.wait_result = Some(result);
            s.timeout.take()
        };
        if let Some(key) = timeout {
            self.cancel_timeout(key);
        }
        log::trace!("{} woken ({:?})", thread.id, result);
        self.make_ready(thread, |tid, priority| SchedEvent::ThreadWoke { tid, priority });
    }

    /// Take the current thread off `cpu` and run the next one
    ///
    /// Must be called on `cpu` with interrupts disabled. The caller has
    /// already moved the current thread out of Running when it is blocking
    /// or exiting.
    pub(crate) fn schedule(&self, cpu: CpuId, reason: SwitchReason) {
        if A::interrupts_enabled() {
            self.fatal(format_args!("schedule on {} with interrupts enabled", cpu));
        }
        let state = self.state(cpu);

        let switch = {
            let rq = state.rq.lock();
            let mut q = rq.borrow_mut();
            state.need_resched.store(false, Ordering::Release);

            let Some(prev) = q.current.clone() else {
                drop(q);
                drop(rq);
                self.fatal(format_args!("schedule on {} before it came online", cpu))
            };

            if !prev.is_idle() {
                let mut s = prev.sched.lock();
                if s.state == ThreadState::Running {
                    s.state = ThreadState::Ready;
                    if s.affinity.contains(cpu) {
                        let (tid, priority) = (prev.id, s.priority);
                        drop(s);
                        q.policy.on_event(match reason {
                            SwitchReason::Preempt => SchedEvent::ThreadPreempted { tid, priority },
                            _ => SchedEvent::ThreadYielded { tid, priority },
                        });
                    } else {
                        s.cpu = None;
                        drop(s);
                        state.load.fetch_sub(1, Ordering::AcqRel);
                        q.migrating = Some(prev.clone());
                    }
                } else {
                    drop(s);
                    state.load.fetch_sub(1, Ordering::AcqRel);
                }
            }

            let picked = q.policy.pick_next(cpu);
            let found = match picked {
                Some(tid) => self.threads.lock().get(&tid).cloned(),
                None => q.idle.clone(),
            };
            let Some(next) = found else {
                drop(q);
                drop(rq);
                match picked {
                    Some(tid) => self.fatal(format_args!("{} queued on {} but not in thread table", tid, cpu)),
                    None => self.fatal(format_args!("no runnable thread and no idle thread on {}", cpu)),
                }
            };

            let priority = {
                let mut s = next.sched.lock();
                s.state = ThreadState::Running;
                s.cpu = Some(cpu);
                s.priority
            };
            q.timeslice_remaining = if next.is_idle() {
                0
            } else {
                self.config.time_slices.for_priority(priority).get()
            };

            if Arc::ptr_eq(&prev, &next) {
                None
            } else {
                if prev.is_idle() {
                    prev.sched.lock().state = ThreadState::Ready;
                }
                q.current = Some(next.clone());
                q.prev = Some(prev.clone());
                q.stats.context_switches += 1;
                q.policy.on_switched(cpu, Some(prev.id), Some(next.id));
                log::trace!("{}: {} -> {} ({:?})", cpu, prev.id, next.id, reason);
                Some((prev, next))
            }
        };

        if let Some((prev, next)) = switch {
            self.context_switch(prev, next);
        }
    }

    /// Second half of every switch, run by the thread switched to
    ///
    /// Releases the previous thread to other CPUs and forwards a thread
    /// whose affinity excluded this CPU to a CPU it may run on.
    pub(crate) fn finish_switch(&self) {
        let cpu = A::current_cpu();
        let state = self.state(cpu);
        let (prev, migrating) = {
            let rq = state.rq.lock();
            let mut q = rq.borrow_mut();
            (q.prev.take(), q.migrating.take())
        };
        if let Some(prev) = prev {
            prev.on_cpu.store(false, Ordering::Release);
        }
        if let Some(thread) = migrating {
            log::debug!("{} migrating off {}", thread.id, cpu);
            self.make_ready(&thread, |tid, priority| SchedEvent::ThreadWoke { tid, priority });
        }
    }

    // ========================================================================
    // TIME AND PREEMPTION
    // ========================================================================

    /// Timer interrupt callback for `cpu`
    ///
    /// The boot CPU also advances the global clock and expires timeouts.
    /// Never switches: an exhausted slice only sets `need_resched`, acted on
    /// by `preempt_point` on interrupt return.
    pub fn timer_tick(&self, cpu: CpuId, mode: TickMode) {
        if cpu == CpuId::BSP {
            let now = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
            self.expire_timeouts(now);
        }

        let state = self.state(cpu);
        let rq = state.rq.lock();
        let mut q = rq.borrow_mut();
        q.stats.ticks += 1;

        let current = q.current.clone();
        q.policy.on_event(SchedEvent::Tick {
            cpu,
            current_thread: current.as_ref().map(|t| t.id),
        });

        match current {
            Some(thread) if !thread.is_idle() => {
                thread.charge_tick(mode);
                q.timeslice_remaining = q.timeslice_remaining.saturating_sub(1);
                if q.timeslice_remaining == 0 {
                    state.set_need_resched();
                }
            }
            _ => {
                q.stats.idle_ticks += 1;
                if !q.policy.is_empty() {
                    state.set_need_resched();
                }
            }
        }
    }

    /// Safe point: perform a pending deferred reschedule
    ///
    /// Called on interrupt and syscall return. A no-op inside an interrupt
    /// handler; returns whether the scheduler ran.
    pub fn preempt_point(&self) -> bool {
        if A::in_interrupt() {
            return false;
        }
        let _irq = InterruptGuard::<A>::new();
        let cpu = A::current_cpu();
        if !self.state(cpu).need_resched() {
            return false;
        }
        self.schedule(cpu, SwitchReason::Preempt);
        true
    }

    /// Give up the CPU; the caller stays Ready
    pub fn yield_now(&self) {
        let _irq = InterruptGuard::<A>::new();
        self.schedule(A::current_cpu(), SwitchReason::Yield);
    }

    /// Thread the next scheduling decision on `cpu` would select
    ///
    /// Pure: nothing is dequeued. Returns the idle thread when the ready
    /// queue is empty.
    pub fn pick_next(&self, cpu: CpuId) -> Result<ThreadId, SchedError> {
        let state = self.cpu(cpu)?;
        if !state.is_online() {
            return Err(SchedError::CpuOffline);
        }
        let rq = state.rq.lock();
        let q = rq.borrow();
        q.policy
            .peek_next()
            .or_else(|| q.idle.as_ref().map(|t| t.id))
            .ok_or(SchedError::CpuOffline)
    }

    /// One iteration of the idle loop
    ///
    /// Runs the scheduler if work is queued for this CPU, otherwise halts
    /// until the next interrupt.
    pub fn idle_once(&self) {
        let cpu = A::current_cpu();
        let state = self.state(cpu);
        let has_work = state.need_resched() || !state.rq.lock().borrow().policy.is_empty();
        if has_work {
            let _irq = InterruptGuard::<A>::new();
            self.schedule(cpu, SwitchReason::Yield);
        } else {
            A::wait_for_interrupt();
        }
    }

    pub fn idle_loop(&self) -> ! {
        loop {
            self.idle_once();
        }
    }

    // ========================================================================
    // PRIORITY AND AFFINITY
    // ========================================================================

    /// Change a thread's priority
    ///
    /// A Ready thread is requeued at its new level, a Blocked one is
    /// re-sorted on a priority-ordered wait queue, and a Running thread's CPU
    /// reschedules if something queued now outranks it. The state is
    /// re-read under the lock guarding the thread's current queue; a thread
    /// that moved in between is retried.
    pub fn set_priority(&self, tid: ThreadId, priority: Priority) -> Result<(), SchedError> {
        if priority == Priority::IDLE {
            return Err(SchedError::InvalidPriority);
        }
        let thread = self.thread(tid)?;
        if thread.is_idle() {
            return Err(SchedError::InvalidState);
        }
        let _irq = InterruptGuard::<A>::new();

        loop {
            let (state, cpu, handle) = {
                let s = thread.sched.lock();
                (s.state, s.cpu, s.blocked_on.clone())
            };

            match (state, cpu, handle) {
                (ThreadState::Ready, Some(cpu), _) => {
                    let st = self.state(cpu);
                    let rq = st.rq.lock();
                    let mut q = rq.borrow_mut();
                    let mut s = thread.sched.lock();
                    if s.state != ThreadState::Ready || s.cpu != Some(cpu) {
                        // picked or moved meanwhile
                        continue;
                    }
                    let old_priority = s.priority;
                    s.priority = priority;
                    drop(s);
                    q.policy.on_event(SchedEvent::PriorityChanged {
                        tid,
                        old_priority,
                        new_priority: priority,
                    });
                    let current_priority = q.current.as_ref().map(|c| c.priority());
                    drop(q);
                    drop(rq);
                    if current_priority.is_some_and(|p| priority > p) {
                        self.request_reschedule(cpu);
                    }
                }
                (ThreadState::Running, Some(cpu), _) => {
                    let st = self.state(cpu);
                    let rq = st.rq.lock();
                    let q = rq.borrow();
                    {
                        let mut s = thread.sched.lock();
                        if s.state != ThreadState::Running || s.cpu != Some(cpu) {
                            // switched out meanwhile
                            continue;
                        }
                        s.priority = priority;
                    }
                    let outranked = q.policy.highest_priority().is_some_and(|p| p > priority);
                    drop(q);
                    drop(rq);
                    if outranked {
                        self.request_reschedule(cpu);
                    }
                }
                (ThreadState::Blocked, _, Some(handle)) => {
                    let mut list = handle.lock();
                    {
                        let mut s = thread.sched.lock();
                        let same_queue = s.blocked_on.as_ref().is_some_and(|h| Arc::ptr_eq(h, &handle));
                        if s.state != ThreadState::Blocked || !same_queue {
                            // woken meanwhile
                            continue;
                        }
                        s.priority = priority;
                    }
                    list.reposition(&thread, priority);
                }
                _ => {
                    // Not on any queue: the next enqueue reads the new level
                    let mut s = thread.sched.lock();
                    if s.state != state || s.cpu != cpu {
                        continue;
                    }
                    s.priority = priority;
                }
            }

            log::debug!("{} priority set to {}", tid, priority);
            return Ok(());
        }
    }

    /// Restrict the CPUs a thread may run on
    ///
    /// A Ready thread queued on an excluded CPU moves right away; a Running
    /// one moves at its CPU's next safe point.
    pub fn set_affinity(&self, tid: ThreadId, mask: CpuMask) -> Result<(), SchedError> {
        if mask.intersect(self.online_mask()).is_empty() {
            return Err(SchedError::NoOnlineCpu);
        }
        let thread = self.thread(tid)?;
        if thread.is_idle() {
            return Err(SchedError::InvalidState);
        }
        let _irq = InterruptGuard::<A>::new();

        let (state, cpu) = {
            let mut s = thread.sched.lock();
            s.affinity = mask;
            (s.state, s.cpu)
        };
        let Some(cpu) = cpu else {
            return Ok(());
        };
        if mask.contains(cpu) {
            return Ok(());
        }

        match state {
            ThreadState::Ready => {
                let st = self.state(cpu);
                let removed = {
                    let rq = st.rq.lock();
                    let mut q = rq.borrow_mut();
                    let mut s = thread.sched.lock();
                    if s.state == ThreadState::Ready && s.cpu == Some(cpu) {
                        let priority = s.priority;
                        s.cpu = None;
                        drop(s);
                        q.policy.on_event(SchedEvent::ThreadRemoved { tid, priority });
                        st.load.fetch_sub(1, Ordering::AcqRel);
                        true
                    } else {
                        false
                    }
                };
                if removed {
                    self.make_ready(&thread, |tid, priority| SchedEvent::ThreadWoke { tid, priority });
                } else if thread.state() == ThreadState::Running {
                    self.request_reschedule(cpu);
                }
            }
            ThreadState::Running => self.request_reschedule(cpu),
            _ => {}
        }

        log::debug!("{} affinity set to {:#x}", tid, mask.0);
        Ok(())
    }
}
