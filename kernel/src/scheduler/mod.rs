/*
 * Multi-CPU Preemptive Priority Scheduler
 *
 * This module ties the scheduler together. `Kernel` is the one scheduler
 * instance of a machine: it owns one `SchedulerState` per logical CPU, the
 * thread and process tables, the timeout queue and the finalizer.
 *
 * SCHEDULING MODEL:
 * =================
 *
 * Every CPU runs its own scheduling loop against its own ready queue. A
 * wake may place a thread on another CPU's queue (least-loaded placement);
 * the target is then poked with a reschedule IPI.
 *
 * 1. Timer interrupt -> timer_tick() charges the tick and counts down the
 *    current thread's slice
 * 2. Slice exhausted -> per-CPU "need_resched" flag is set
 * 3. Interrupt return -> preempt_point() sees the flag and calls schedule()
 * 4. schedule() requeues the old thread, asks the policy for the next one
 *    and performs the context switch
 *
 * Threads leave the CPU voluntarily through yield_now(), a blocking wait
 * on a WaitQueue (directly or via Mutex::lock) or exit_current().
 *
 * PER-CPU IDLE THREAD:
 * ====================
 *
 * Each CPU adopts the code it is executing at bring-up as its idle thread
 * (`bootstrap_cpu`). The idle thread is never queued, never blocks and is
 * never finalized; schedule() falls back to it when the ready queue is
 * empty.
 *
 * LOCK ORDER:
 * ===========
 *
 *   wait queue list -> CPU run queue -> thread.sched -> leaf locks
 *
 * Leaf locks: thread table, process table, process identity, timeout
 * queue, finalizer queue. At most one run-queue lock is held at a time.
 */

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub mod context;
pub mod dump;
pub mod events;
pub mod finalizer;
pub mod policies;
pub mod process;
pub mod sched_core;
pub mod thread;
pub mod timer;
pub mod traits;
pub mod types;

pub use dump::{CpuSnapshot, InvariantViolation, QueueSnapshot, SchedulerSnapshot, ThreadSnapshot};
pub use process::{Process, ProcessId, ProcessState};
pub use sched_core::{CpuStats, SchedulerState};
pub use thread::{Thread, ThreadBuilder, ThreadFlags, ThreadId, ThreadState, ThreadStats};
pub use types::{BlockResult, CpuId, CpuMask, Priority, SchedClass, TickMode, TimeSliceTicks};

use crate::arch::{Arch, ArchContext, InterruptGuard};
use crate::config::SchedConfig;
use crate::error::SchedError;
use crate::sync::Spinlock;
use finalizer::Finalizer;
use policies::PriorityRoundRobin;
use timer::TimeoutQueue;

/// PID of the kernel process, owner of every kernel thread
pub const KERNEL_PID: ProcessId = ProcessId(0);

/// The scheduler instance of one machine
///
/// Threads keep a raw pointer back to it for their first switch-in, so a
/// `Kernel` that runs threads must live for `'static` (boot code keeps it in
/// a static or leaks a box).
pub struct Kernel<A: Arch> {
    pub(crate) config: SchedConfig,
    pub(crate) cpus: Vec<SchedulerState<A>>,
    pub(crate) threads: Spinlock<A, BTreeMap<ThreadId, Arc<Thread<A>>>>,
    pub(crate) processes: Spinlock<A, BTreeMap<ProcessId, Arc<Process<A>>>>,
    pub(crate) timeouts: Spinlock<A, TimeoutQueue>,
    pub(crate) finalizer: Finalizer<A>,
    pub(crate) kernel_process: Arc<Process<A>>,
    pub(crate) init_process: Spinlock<A, Option<ProcessId>>,
    /// Global tick clock, advanced by the boot CPU
    pub(crate) ticks: AtomicU64,
    pub(crate) next_tid: AtomicUsize,
    pub(crate) next_pid: AtomicUsize,
}

impl<A: Arch> Kernel<A> {
    /// Create the scheduler for `config.cpu_count` CPUs
    ///
    /// No CPU is online yet: each one joins with `bootstrap_cpu`.
    pub fn new(config: SchedConfig, kernel_space: A::AddressSpace) -> Result<Self, SchedError> {
        config.validate()?;

        let cpus = (0..config.cpu_count)
            .map(|i| SchedulerState::new(CpuId(i as u32), alloc::boxed::Box::new(PriorityRoundRobin::new())))
            .collect();

        let kernel_process = Arc::new(Process::new(KERNEL_PID, "kernel", None, kernel_space));
        let mut processes = BTreeMap::new();
        processes.insert(KERNEL_PID, kernel_process.clone());

        log::info!(
            "Scheduler initialized: {} CPU(s), {}ms tick, {} KiB kernel stacks",
            config.cpu_count,
            config.tick_ms,
            config.kernel_stack_size / 1024
        );

        Ok(Self {
            config,
            cpus,
            threads: Spinlock::new(BTreeMap::new()),
            processes: Spinlock::new(processes),
            timeouts: Spinlock::new(TimeoutQueue::new()),
            finalizer: Finalizer::new(),
            kernel_process,
            init_process: Spinlock::new(None),
            ticks: AtomicU64::new(0),
            next_tid: AtomicUsize::new(1),
            next_pid: AtomicUsize::new(1),
        })
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Per-CPU state of `cpu`
    pub fn cpu(&self, cpu: CpuId) -> Result<&SchedulerState<A>, SchedError> {
        self.cpus.get(cpu.as_usize()).ok_or(SchedError::CpuOffline)
    }

    /// Per-CPU state of a CPU the caller knows to exist
    pub(crate) fn state(&self, cpu: CpuId) -> &SchedulerState<A> {
        match self.cpus.get(cpu.as_usize()) {
            Some(state) => state,
            None => self.fatal(format_args!("{} is not managed by this scheduler", cpu)),
        }
    }

    pub fn is_cpu_online(&self, cpu: CpuId) -> bool {
        self.cpus.get(cpu.as_usize()).is_some_and(|s| s.is_online())
    }

    /// Mask of every online CPU
    pub fn online_mask(&self) -> CpuMask {
        self.cpus
            .iter()
            .filter(|s| s.is_online())
            .fold(CpuMask::EMPTY, |mask, s| mask.with(s.cpu))
    }

    /// Bring the calling CPU online
    ///
    /// The code running now becomes the CPU's idle thread; it should go on
    /// to call `idle_loop` (or poll `idle_once`) once bring-up is done.
    pub fn bootstrap_cpu(&self, cpu: CpuId) -> Result<Arc<Thread<A>>, SchedError> {
        let state = self.cpu(cpu)?;
        if A::current_cpu() != cpu || state.is_online() {
            return Err(SchedError::InvalidState);
        }

        let id = ThreadId(self.next_tid.fetch_add(1, Ordering::Relaxed));
        let mut name: heapless::String<16> = heapless::String::new();
        let _ = fmt::write(&mut name, format_args!("idle/{}", cpu.0));

        let idle = Arc::new(Thread::new(
            id,
            &name,
            self.kernel_process.clone(),
            ThreadFlags::IDLE | ThreadFlags::KERNEL,
            Priority::IDLE,
            CpuMask::single(cpu),
            A::Context::bootstrap(),
            None,
            None,
        ));
        {
            let mut s = idle.sched.lock();
            s.state = ThreadState::Running;
            s.cpu = Some(cpu);
        }
        idle.on_cpu.store(true, Ordering::Release);
        self.threads.lock().insert(id, idle.clone());

        state.install_idle(idle.clone());
        log::info!("{} online (idle thread {})", cpu, id);
        Ok(idle)
    }

    /// Thread currently running on `cpu`
    pub(crate) fn current_thread_on(&self, cpu: CpuId) -> Arc<Thread<A>> {
        match self.cpus.get(cpu.as_usize()).and_then(|s| s.current()) {
            Some(thread) => thread,
            None => self.fatal(format_args!("no current thread on {}", cpu)),
        }
    }

    /// Thread executing this call
    pub fn current_thread(&self) -> Arc<Thread<A>> {
        let _irq = InterruptGuard::<A>::new();
        self.current_thread_on(A::current_cpu())
    }

    pub fn current_thread_id(&self) -> ThreadId {
        self.current_thread().id
    }

    pub fn thread(&self, tid: ThreadId) -> Result<Arc<Thread<A>>, SchedError> {
        self.threads.lock().get(&tid).cloned().ok_or(SchedError::NoSuchThread)
    }

    /// Every thread not yet finalized, idle threads included
    pub fn all_threads(&self) -> Vec<Arc<Thread<A>>> {
        self.threads.lock().values().cloned().collect()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn process(&self, pid: ProcessId) -> Result<Arc<Process<A>>, SchedError> {
        self.processes.lock().get(&pid).cloned().ok_or(SchedError::NoSuchProcess)
    }

    pub fn kernel_process(&self) -> &Arc<Process<A>> {
        &self.kernel_process
    }

    /// Global tick count
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Give up on a broken scheduler invariant
    ///
    /// Logs the message and a full scheduler snapshot, then panics. Never
    /// returns: no caller can continue safely once this is reached.
    pub fn fatal(&self, args: fmt::Arguments<'_>) -> ! {
        A::disable_interrupts();
        log::error!("SCHEDULER FATAL: {}", args);
        log::error!("{}", self.dump_scheduler_state());
        panic!("scheduler fatal: {}", args);
    }
}
