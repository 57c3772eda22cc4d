/*
 * Architecture Abstraction Layer
 *
 * This module is the only seam between the scheduler core and the hardware.
 * Everything the core needs from the CPU, the interrupt controller and the
 * memory manager is expressed by the `Arch` trait; the register-level
 * context switch sits behind `ArchContext`.
 *
 * Why this is important:
 * - The scheduler never touches registers, page tables or APIC MSRs directly
 * - One implementation per target (x86_64 for the kernel image)
 * - The host backend lets the real scheduler run under `cargo test`
 *
 * Backends:
 * - x86_64: bare-metal implementation (target_os = "none")
 * - host:   OS-thread simulation of CPUs, compiled for tests only
 */

use alloc::{boxed::Box, vec::Vec};
use core::marker::PhantomData;

use crate::error::SchedError;
use crate::scheduler::types::CpuId;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

#[cfg(test)]
pub mod host;

/// Entry point a fresh thread context starts executing
///
/// Receives the argument passed to `prepare_initial_context` and never returns.
pub type ContextEntry = extern "C-unwind" fn(usize) -> !;

/// Saved register state of a thread
pub trait ArchContext: Send + Sized + 'static {
    /// Context for the code already executing on this CPU (boot stack)
    ///
    /// The contents are filled in the first time the CPU switches away.
    fn bootstrap() -> Self;

    /// Build the context of a thread that has never run
    ///
    /// The first switch into it calls `entry(arg)` on `stack`.
    fn prepare_initial_context(stack: &mut KernelStack, entry: ContextEntry, arg: usize) -> Self;

    /// Save the running state into `prev` and resume `next`
    ///
    /// Returns when some CPU later switches back into `prev`.
    ///
    /// # Safety
    /// Both pointers must stay valid until the switch completes, `prev` must
    /// be the context of the code calling this function, and `next` must not
    /// be running on any CPU.
    unsafe fn switch_context(prev: *mut Self, next: *const Self);
}

/// Hardware services consumed by the scheduler core
///
/// All functions operate on the CPU executing the call.
pub trait Arch: Sized + Send + Sync + 'static {
    type Context: ArchContext;

    /// Handle to a process's page tables
    type AddressSpace: Send + Sync + 'static;

    /// Logical ID of the executing CPU
    fn current_cpu() -> CpuId;

    fn interrupts_enabled() -> bool;
    fn disable_interrupts();
    fn enable_interrupts();

    /// True while an interrupt handler is executing on this CPU
    fn in_interrupt() -> bool;

    /// Ask `cpu` to reschedule soon (inter-processor interrupt)
    fn send_reschedule_ipi(cpu: CpuId);

    /// Activate the page tables of `space`
    fn switch_address_space(space: &Self::AddressSpace);

    /// Halt until the next interrupt
    fn wait_for_interrupt();

    /// Write diagnostic text to the console
    fn console_write(s: &str);

    /// Allocate an exclusively owned kernel stack
    ///
    /// Failure is reported as `SchedError::OutOfMemory` rather than aborting.
    fn allocate_kernel_stack(size: usize) -> Result<KernelStack, SchedError> {
        KernelStack::allocate(size)
    }
}

/// Memory backing a thread's kernel stack
///
/// Owned by exactly one thread and released by the finalizer.
pub struct KernelStack {
    mem: Box<[u8]>,
}

impl KernelStack {
    /// Reserve `size` zeroed bytes, failing instead of aborting on exhaustion
    pub fn allocate(size: usize) -> Result<KernelStack, SchedError> {
        let mut mem: Vec<u8> = Vec::new();
        mem.try_reserve_exact(size)
            .map_err(|_| SchedError::OutOfMemory)?;
        mem.resize(size, 0);
        Ok(KernelStack { mem: mem.into_boxed_slice() })
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    /// Lowest address of the stack region
    pub fn base(&self) -> usize {
        self.mem.as_ptr() as usize
    }

    /// 16-byte aligned address one past the usable top of the stack
    pub fn top(&self) -> usize {
        (self.base() + self.len()) & !0xF
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mem.as_mut_ptr()
    }
}

impl core::fmt::Debug for KernelStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "KernelStack({:#x}, {} bytes)", self.base(), self.len())
    }
}

/// RAII guard that disables interrupts for its lifetime
///
/// The previous interrupt state is captured on creation and restored on drop,
/// so guards nest correctly with spinlocks and with each other.
pub struct InterruptGuard<A: Arch> {
    were_enabled: bool,
    _arch: PhantomData<*const A>,
}

impl<A: Arch> InterruptGuard<A> {
    pub fn new() -> Self {
        let were_enabled = A::interrupts_enabled();
        if were_enabled {
            A::disable_interrupts();
        }
        Self {
            were_enabled,
            _arch: PhantomData,
        }
    }
}

impl<A: Arch> Default for InterruptGuard<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Arch> Drop for InterruptGuard<A> {
    fn drop(&mut self) {
        // Only re-enable if they were enabled before
        if self.were_enabled {
            A::enable_interrupts();
        }
    }
}
