/*
 * Host Backend (test builds only)
 *
 * Simulates CPUs on top of OS threads so the scheduler's real switching,
 * blocking and wake paths can run under `cargo test`.
 *
 * MODEL:
 * ======
 *
 * - Every kernel thread is backed by one OS thread parked on a gate.
 * - A simulated CPU is a token: exactly one gate is open per CPU at a time.
 *   `switch_context` hands the token to the next thread and parks the
 *   caller on its own gate until some CPU switches back to it.
 * - The interrupt flag, the interrupt nesting depth and the CPU number are
 *   thread-locals of whichever OS thread currently holds the token.
 * - `interrupt()` runs a closure as if it were an interrupt handler.
 * - Dropping a context (the thread was finalized) tells its parked OS
 *   thread to unwind out of `switch_context` and end.
 *
 * The test body adopts itself as CPU 0's idle thread through
 * `Kernel::bootstrap_cpu`, so it only runs while CPU 0 has nothing better
 * to do.
 */

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex, Weak};
use std::time::Duration;

use super::{Arch, ArchContext, ContextEntry, KernelStack};
use crate::scheduler::types::CpuId;

/// OS threads that never became a simulated CPU get IDs from here, so two of
/// them never look like the same CPU to a spinlock.
static NEXT_DETACHED_ID: AtomicU32 = AtomicU32::new(1024);

/// Stack size of the OS threads backing kernel threads
const SIM_THREAD_STACK: usize = 512 * 1024;

thread_local! {
    static CPU: Cell<Option<u32>> = const { Cell::new(None) };
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
    static IRQ_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Marker type implementing `Arch` for host tests
pub struct HostArch;

/// Make the calling OS thread execute as `cpu` with interrupts enabled
pub fn become_cpu(cpu: CpuId) {
    CPU.with(|c| c.set(Some(cpu.0)));
    IRQ_ENABLED.with(|f| f.set(true));
    IRQ_DEPTH.with(|d| d.set(0));
}

/// Run `f` as an interrupt handler on the current simulated CPU
pub fn interrupt<R>(f: impl FnOnce() -> R) -> R {
    let were_enabled = IRQ_ENABLED.with(|e| e.replace(false));
    IRQ_DEPTH.with(|d| d.set(d.get() + 1));
    let result = f();
    IRQ_DEPTH.with(|d| d.set(d.get() - 1));
    IRQ_ENABLED.with(|e| e.set(were_enabled));
    result
}

impl Arch for HostArch {
    type Context = HostContext;
    type AddressSpace = HostAddressSpace;

    fn current_cpu() -> CpuId {
        CPU.with(|c| match c.get() {
            Some(id) => CpuId(id),
            None => {
                let id = NEXT_DETACHED_ID.fetch_add(1, Ordering::Relaxed);
                c.set(Some(id));
                CpuId(id)
            }
        })
    }

    fn interrupts_enabled() -> bool {
        IRQ_ENABLED.with(|e| e.get())
    }

    fn disable_interrupts() {
        IRQ_ENABLED.with(|e| e.set(false));
    }

    fn enable_interrupts() {
        IRQ_ENABLED.with(|e| e.set(true));
    }

    fn in_interrupt() -> bool {
        IRQ_DEPTH.with(|d| d.get() > 0)
    }

    // Simulated CPUs poll their reschedule flag, so there is nothing to deliver.
    fn send_reschedule_ipi(_cpu: CpuId) {}

    fn switch_address_space(space: &HostAddressSpace) {
        space.activations.fetch_add(1, Ordering::Relaxed);
    }

    fn wait_for_interrupt() {
        std::thread::sleep(Duration::from_micros(50));
    }

    fn console_write(s: &str) {
        eprint!("{}", s);
    }
}

/// Page-table stand-in that counts how often it was activated
#[derive(Debug, Default)]
pub struct HostAddressSpace {
    activations: AtomicUsize,
}

impl HostAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::Relaxed)
    }
}

/// What a parked thread is woken with
enum Resume {
    /// Run on this CPU
    Cpu(u32),
    /// The thread was finalized; end the OS thread
    Terminate,
}

/// Unwind payload ending the OS thread of a finalized kernel thread
struct Terminated;

/// One-slot mailbox carrying the CPU number to the thread being resumed
struct Gate {
    slot: StdMutex<Option<Resume>>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            slot: StdMutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn post(&self, resume: Resume) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(resume);
        self.cv.notify_one();
    }

    fn open(&self, cpu: u32) {
        self.post(Resume::Cpu(cpu));
    }

    fn wait(&self) -> Resume {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(resume) = slot.take() {
                return resume;
            }
            slot = self.cv.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// See `HostContext::backing_thread`
pub struct BackingThread(Weak<Gate>);

impl BackingThread {
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// Saved "register state" of a simulated thread: the gate it parks on
pub struct HostContext {
    gate: Arc<Gate>,
}

impl ArchContext for HostContext {
    fn bootstrap() -> Self {
        HostContext {
            gate: Arc::new(Gate::new()),
        }
    }

    fn prepare_initial_context(_stack: &mut KernelStack, entry: ContextEntry, arg: usize) -> Self {
        let gate = Arc::new(Gate::new());
        let start = gate.clone();
        std::thread::Builder::new()
            .name("sim-kthread".into())
            .stack_size(SIM_THREAD_STACK)
            .spawn(move || {
                let Resume::Cpu(cpu) = start.wait() else {
                    return;
                };
                CPU.with(|c| c.set(Some(cpu)));
                IRQ_ENABLED.with(|e| e.set(false));
                IRQ_DEPTH.with(|d| d.set(0));
                let outcome = catch_unwind(AssertUnwindSafe(move || {
                    entry(arg);
                }));
                if outcome.is_err_and(|payload| payload.is::<Terminated>()) {
                    return;
                }
                // A kernel thread that panics takes its CPU token with it;
                // nothing could ever run on that CPU again.
                eprintln!("simulated kernel thread panicked, aborting");
                std::process::abort();
            })
            .expect("failed to spawn simulated kernel thread");
        HostContext { gate }
    }

    unsafe fn switch_context(prev: *mut Self, next: *const Self) {
        let cpu = HostArch::current_cpu().0;
        // `prev` may be finalized as soon as `next` runs; keep our own handle.
        let mine = unsafe { (*prev).gate.clone() };
        unsafe { (*next).gate.open(cpu) };
        match mine.wait() {
            Resume::Cpu(cpu) => CPU.with(|c| c.set(Some(cpu))),
            Resume::Terminate => resume_unwind(Box::new(Terminated)),
        }
    }
}

impl HostContext {
    /// Handle telling whether the OS thread behind this context still exists
    pub fn backing_thread(&self) -> BackingThread {
        BackingThread(Arc::downgrade(&self.gate))
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        self.gate.post(Resume::Terminate);
    }
}
