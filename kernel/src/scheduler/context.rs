/*
 * Context Switching
 *
 * The only place the scheduler core hands control from one thread to
 * another. Register save/restore belongs to `ArchContext::switch_context`;
 * this module handles everything around it:
 *
 * - address-space switch when the two threads belong to different processes
 * - the `on_cpu` handoff: a thread switched away from on one CPU may be
 *   picked by another CPU before its registers are saved, so the new CPU
 *   waits until the old one has finished with it
 * - the first switch into a thread that has never run (`thread_trampoline`)
 */

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use super::{Kernel, thread::Thread};
use crate::arch::{Arch, ArchContext};

impl<A: Arch> Kernel<A> {
    /// Save `prev`, resume `next`
    ///
    /// Returns once some CPU switches back into `prev`. Both threads are
    /// kept alive by the run queue (`current` and `prev`) until the switch
    /// has been finished by the thread we switched to.
    pub(crate) fn context_switch(&self, prev: Arc<Thread<A>>, next: Arc<Thread<A>>) {
        if prev.process.id != next.process.id {
            A::switch_address_space(&next.process.address_space);
        }

        // Another CPU may still be saving `next`
        while next.on_cpu.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        next.on_cpu.store(true, Ordering::Release);

        let prev_ctx = prev.context.get();
        let next_ctx = next.context.get() as *const A::Context;
        drop(prev);
        drop(next);

        // SAFETY: `prev` is the running thread and `next` is not running on
        // any CPU (on_cpu handoff above); both stay alive through the run
        // queue's `current`/`prev` references until `finish_switch`.
        unsafe { A::Context::switch_context(prev_ctx, next_ctx) };

        self.finish_switch();
    }
}

/// First code a new thread runs
///
/// Completes the switch that started it, enables interrupts, runs the entry
/// closure and exits with code 0 if the closure returns.
pub(crate) extern "C-unwind" fn thread_trampoline<A: Arch>(arg: usize) -> ! {
    // SAFETY: `arg` is the address of the `'static` kernel that created
    // this thread (see `Kernel::create_thread`).
    let kernel = unsafe { &*(arg as *const Kernel<A>) };
    kernel.finish_switch();
    A::enable_interrupts();

    let entry = kernel.current_thread().entry.lock().take();
    match entry {
        Some(entry) => entry(),
        None => log::warn!("{} started without an entry point", kernel.current_thread_id()),
    }

    kernel.exit_current(0)
}
