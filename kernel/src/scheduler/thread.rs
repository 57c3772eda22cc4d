/*
 * Thread Management
 *
 * This module defines the Thread structure, the builder used to create
 * threads, and the thread-lifecycle operations of the kernel: creation,
 * exit, sleeping, signals and CPU-time statistics.
 *
 * THREAD LIFECYCLE:
 * =================
 *
 *   Created --enqueue--> Ready <--pick/preempt--> Running --exit--> Dying
 *                          ^                         |                 |
 *                          +------wake/timeout----- Blocked        finalizer
 *                                                                      v
 *                                                                    Dead
 *
 * A thread is in exactly one of: a ready queue (Ready), a CPU (Running),
 * one wait queue (Blocked), the finalizer queue (Dying).
 *
 * LOCKING:
 * ========
 *
 * Scheduling fields live in `sched`, a spinlock that ranks below the wait
 * queue and run-queue locks. The saved register context is only touched by
 * the CPU switching into or out of the thread; `on_cpu` hands it from one
 * CPU to the next.
 */

use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

use super::{
    Kernel, ProcessId,
    context::thread_trampoline,
    events::SchedEvent,
    process::Process,
    sched_core::SwitchReason,
    timer::TimeoutKey,
    types::{BlockResult, CpuId, CpuMask, Priority, TickMode},
};
use crate::arch::{Arch, ArchContext, InterruptGuard, KernelStack};
use crate::error::SchedError;
use crate::sync::{Spinlock, WaitQueue, wait_queue::WaitHandle};

/// Longest thread name kept (longer names are truncated)
pub const THREAD_NAME_LEN: usize = 32;

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Exists but not yet handed to the scheduler
    Created,
    /// In exactly one CPU's ready queue
    Ready,
    /// Executing on exactly one CPU
    Running,
    /// On exactly one wait queue
    Blocked,
    /// Exited, waiting for the finalizer
    Dying,
    /// Finalized, stack released
    Dead,
}

bitflags! {
    /// Static properties of a thread
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u8 {
        /// Per-CPU idle thread (never blocks, exits or gets finalized)
        const IDLE = 1;
        /// Runs only kernel code
        const KERNEL = 1 << 1;
        /// The finalizer thread
        const FINALIZER = 1 << 2;
    }
}

/// Code a new thread runs
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// Scheduling fields, protected by `Thread::sched`
pub(crate) struct ThreadSched<A: Arch> {
    pub(crate) state: ThreadState,
    pub(crate) priority: Priority,
    pub(crate) affinity: CpuMask,
    /// Ready queue holding the thread, CPU running it, or CPU it last ran on
    pub(crate) cpu: Option<CpuId>,
    pub(crate) blocked_on: Option<WaitHandle<A>>,
    pub(crate) wait_result: Option<BlockResult>,
    pub(crate) interruptible: bool,
    pub(crate) timeout: Option<TimeoutKey>,
    pub(crate) exit_code: Option<i32>,
}

/// Thread structure
///
/// Shared through `Arc`: the thread table, ready/wait queues and the
/// finalizer each hold a reference. Threads belong to a Process and switch
/// to its address space when they run.
pub struct Thread<A: Arch> {
    pub id: ThreadId,
    name: heapless::String<THREAD_NAME_LEN>,
    pub(crate) process: Arc<Process<A>>,
    flags: ThreadFlags,
    pub(crate) sched: Spinlock<A, ThreadSched<A>>,
    pub(crate) context: UnsafeCell<A::Context>,
    pub(crate) stack: Spinlock<A, Option<KernelStack>>,
    pub(crate) entry: Spinlock<A, Option<ThreadEntry>>,
    /// Set while some CPU executes on this thread's context
    pub(crate) on_cpu: AtomicBool,
    pending_signals: AtomicU32,
    user_ticks: AtomicU64,
    kernel_ticks: AtomicU64,
}

// SAFETY: `context` is only accessed by the CPU that owns the thread's
// `on_cpu` handoff; every other field is atomic or lock-protected.
unsafe impl<A: Arch> Sync for Thread<A> {}
unsafe impl<A: Arch> Send for Thread<A> {}

impl<A: Arch> Thread<A> {
    pub(crate) fn new(
        id: ThreadId,
        name: &str,
        process: Arc<Process<A>>,
        flags: ThreadFlags,
        priority: Priority,
        affinity: CpuMask,
        context: A::Context,
        stack: Option<KernelStack>,
        entry: Option<ThreadEntry>,
    ) -> Self {
        Self {
            id,
            name: truncated_name(name),
            process,
            flags,
            sched: Spinlock::new(ThreadSched {
                state: ThreadState::Created,
                priority,
                affinity,
                cpu: None,
                blocked_on: None,
                wait_result: None,
                interruptible: false,
                timeout: None,
                exit_code: None,
            }),
            context: UnsafeCell::new(context),
            stack: Spinlock::new(stack),
            entry: Spinlock::new(entry),
            on_cpu: AtomicBool::new(false),
            pending_signals: AtomicU32::new(0),
            user_ticks: AtomicU64::new(0),
            kernel_ticks: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }

    pub fn is_idle(&self) -> bool {
        self.flags.contains(ThreadFlags::IDLE)
    }

    pub fn process(&self) -> &Arc<Process<A>> {
        &self.process
    }

    pub fn process_id(&self) -> ProcessId {
        self.process.id
    }

    pub fn state(&self) -> ThreadState {
        self.sched.lock().state
    }

    pub fn priority(&self) -> Priority {
        self.sched.lock().priority
    }

    pub fn affinity(&self) -> CpuMask {
        self.sched.lock().affinity
    }

    /// CPU the thread is queued on, running on, or last ran on
    pub fn cpu(&self) -> Option<CpuId> {
        self.sched.lock().cpu
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.sched.lock().exit_code
    }

    /// True while the thread sits on some wait queue
    pub fn is_blocked_on_queue(&self) -> bool {
        self.sched.lock().blocked_on.is_some()
    }

    /// Whether the kernel stack is still allocated
    pub fn has_stack(&self) -> bool {
        self.stack.lock().is_some()
    }

    pub fn is_on_cpu(&self) -> bool {
        self.on_cpu.load(Ordering::Acquire)
    }

    pub fn has_pending_signals(&self) -> bool {
        self.pending_signals.load(Ordering::Acquire) != 0
    }

    pub fn pending_signals(&self) -> u32 {
        self.pending_signals.load(Ordering::Acquire)
    }

    pub fn user_ticks(&self) -> u64 {
        self.user_ticks.load(Ordering::Relaxed)
    }

    pub fn kernel_ticks(&self) -> u64 {
        self.kernel_ticks.load(Ordering::Relaxed)
    }

    pub(crate) fn charge_tick(&self, mode: TickMode) {
        let counter = match mode {
            TickMode::User => &self.user_ticks,
            TickMode::Kernel => &self.kernel_ticks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl<A: Arch> fmt::Debug for Thread<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("process", &self.process.id)
            .field("flags", &self.flags)
            .finish()
    }
}

fn truncated_name(name: &str) -> heapless::String<THREAD_NAME_LEN> {
    let mut out = heapless::String::new();
    for ch in name.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// Per-thread CPU usage, as reported by `Kernel::thread_stats`
#[derive(Debug, Clone)]
pub struct ThreadStats {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    pub priority: Priority,
    pub user_ticks: u64,
    pub kernel_ticks: u64,
    pub cpu_percent: u64,
}

/// Options for a new thread
///
/// ```ignore
/// let worker = ThreadBuilder::new("worker")
///     .priority(Priority::HIGH)
///     .spawn(kernel, || do_work())?;
/// ```
pub struct ThreadBuilder {
    name: String,
    priority: Option<Priority>,
    affinity: CpuMask,
    process: Option<ProcessId>,
    stack_size: Option<usize>,
    suspended: bool,
    flags: ThreadFlags,
}

impl ThreadBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            priority: None,
            affinity: CpuMask::ALL,
            process: None,
            stack_size: None,
            suspended: false,
            flags: ThreadFlags::empty(),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn affinity(mut self, mask: CpuMask) -> Self {
        self.affinity = mask;
        self
    }

    /// Owning process (the kernel process if unset)
    pub fn process(mut self, pid: ProcessId) -> Self {
        self.process = Some(pid);
        self
    }

    /// Override the configured kernel stack size
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Leave the thread in `Created` until `enqueue_runnable_thread`
    pub fn suspended(mut self) -> Self {
        self.suspended = true;
        self
    }

    pub(crate) fn flags(mut self, flags: ThreadFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn spawn<A: Arch, F>(self, kernel: &'static Kernel<A>, entry: F) -> Result<Arc<Thread<A>>, SchedError>
    where
        F: FnOnce() + Send + 'static,
    {
        kernel.create_thread(self, Box::new(entry))
    }
}

// ============================================================================
// THREAD LIFECYCLE OPERATIONS
// ============================================================================

impl<A: Arch> Kernel<A> {
    /// Create a thread from `builder`
    ///
    /// Allocates the kernel stack (failure is returned as `OutOfMemory`),
    /// registers the thread with its process and, unless the builder asked
    /// for a suspended thread, makes it Ready.
    pub fn create_thread(
        &'static self,
        builder: ThreadBuilder,
        entry: ThreadEntry,
    ) -> Result<Arc<Thread<A>>, SchedError> {
        let priority = builder.priority.unwrap_or(self.config.default_priority);
        if priority == Priority::IDLE {
            return Err(SchedError::InvalidPriority);
        }
        if builder.affinity.intersect(self.online_mask()).is_empty() {
            return Err(SchedError::NoOnlineCpu);
        }

        let process = match builder.process {
            Some(pid) => self.process(pid)?,
            None => self.kernel_process.clone(),
        };
        if !process.is_running() {
            return Err(SchedError::InvalidState);
        }

        let stack_size = builder.stack_size.unwrap_or(self.config.kernel_stack_size);
        let mut stack = A::allocate_kernel_stack(stack_size).map_err(|e| {
            log::warn!("Kernel stack allocation ({} bytes) for '{}' failed", stack_size, builder.name);
            e
        })?;

        let id = ThreadId(self.next_tid.fetch_add(1, Ordering::Relaxed));
        let arg = self as *const Kernel<A> as usize;
        let context = A::Context::prepare_initial_context(&mut stack, thread_trampoline::<A>, arg);

        let mut flags = builder.flags;
        if process.id == self.kernel_process.id {
            flags |= ThreadFlags::KERNEL;
        }

        let thread = Arc::new(Thread::new(
            id,
            &builder.name,
            process.clone(),
            flags,
            priority,
            builder.affinity,
            context,
            Some(stack),
            Some(entry),
        ));

        self.threads.lock().insert(id, thread.clone());
        process.attach_thread(id);

        log::info!(
            "Created {} '{}' (priority {}, process {})",
            id,
            thread.name(),
            priority,
            process.id
        );

        if !builder.suspended {
            self.enqueue_runnable_thread(&thread)?;
        }
        Ok(thread)
    }

    /// Spawn a kernel-process thread running `entry`
    pub fn spawn_kernel_thread<F>(
        &'static self,
        name: &str,
        priority: Priority,
        entry: F,
    ) -> Result<Arc<Thread<A>>, SchedError>
    where
        F: FnOnce() + Send + 'static,
    {
        ThreadBuilder::new(name).priority(priority).spawn(self, entry)
    }

    /// Hand a Created thread to the scheduler (Created -> Ready)
    pub fn enqueue_runnable_thread(&self, thread: &Arc<Thread<A>>) -> Result<(), SchedError> {
        if thread.state() != ThreadState::Created {
            return Err(SchedError::InvalidState);
        }
        let _irq = InterruptGuard::<A>::new();
        self.make_ready(thread, |tid, priority| SchedEvent::ThreadCreated { tid, priority });
        Ok(())
    }

    /// Terminate the calling thread (Running -> Dying)
    ///
    /// The finalizer reclaims the stack later; this CPU switches away at
    /// once and never returns here.
    pub fn exit_current(&self, code: i32) -> ! {
        let _irq = InterruptGuard::<A>::new();
        let cpu = A::current_cpu();
        {
            let me = self.current_thread_on(cpu);
            if me.is_idle() {
                self.fatal(format_args!("idle thread on {} attempted to exit", cpu));
            }
            {
                let mut s = me.sched.lock();
                s.state = ThreadState::Dying;
                s.exit_code = Some(code);
            }
            log::debug!("{} '{}' exiting with code {}", me.id, me.name(), code);
            self.finalizer.push(me);
        }
        self.finalizer.notify(self);
        self.schedule(cpu, SwitchReason::Exit);
        self.fatal(format_args!("dying thread resumed on {}", cpu))
    }

    /// Sleep for at least `ms` milliseconds
    ///
    /// Returns `Timeout` after the full sleep, `Interrupted` if a signal
    /// arrived first.
    pub fn sleep_ms(&self, ms: u64) -> BlockResult {
        let queue = WaitQueue::fifo();
        queue.block(self, Some(ms))
    }

    /// Post signal `signo` (0..=31) to a thread
    ///
    /// An interruptible wait ends with `Interrupted`; a thread running on
    /// another CPU is asked to reschedule so it reaches a safe point soon.
    pub fn send_signal(&self, tid: ThreadId, signo: u32) -> Result<(), SchedError> {
        if signo >= 32 {
            return Err(SchedError::InvalidState);
        }
        let thread = self.thread(tid)?;
        let _irq = InterruptGuard::<A>::new();

        let (state, handle, interruptible, cpu) = {
            let s = thread.sched.lock();
            thread.pending_signals.fetch_or(1 << signo, Ordering::AcqRel);
            (s.state, s.blocked_on.clone(), s.interruptible, s.cpu)
        };

        match state {
            ThreadState::Blocked if interruptible => {
                if let Some(handle) = handle {
                    let mut list = handle.lock();
                    let still_waiting = {
                        let s = thread.sched.lock();
                        s.state == ThreadState::Blocked
                            && s.blocked_on.as_ref().is_some_and(|h| Arc::ptr_eq(h, &handle))
                    };
                    if still_waiting && list.remove(&thread) {
                        self.complete_wait(&thread, BlockResult::Interrupted);
                    }
                }
            }
            ThreadState::Running => {
                if let Some(cpu) = cpu {
                    if cpu != A::current_cpu() {
                        self.request_reschedule(cpu);
                    }
                }
            }
            _ => {}
        }
        log::debug!("Signal {} posted to {}", signo, tid);
        Ok(())
    }

    /// Consume the calling thread's pending signals
    ///
    /// Called at controlled points (syscall return, after a preemption).
    pub fn take_pending_signals(&self) -> u32 {
        self.current_thread().pending_signals.swap(0, Ordering::AcqRel)
    }

    /// CPU usage of every live thread
    pub fn thread_stats(&self) -> Vec<ThreadStats> {
        let threads = self.all_threads();
        let total: u64 = threads
            .iter()
            .map(|t| t.user_ticks() + t.kernel_ticks())
            .sum();
        threads
            .iter()
            .map(|t| {
                let (state, priority) = {
                    let s = t.sched.lock();
                    (s.state, s.priority)
                };
                let used = t.user_ticks() + t.kernel_ticks();
                ThreadStats {
                    id: t.id,
                    name: String::from(t.name()),
                    state,
                    priority,
                    user_ticks: t.user_ticks(),
                    kernel_ticks: t.kernel_ticks(),
                    cpu_percent: if total == 0 { 0 } else { used * 100 / total },
                }
            })
            .collect()
    }
}
