/*
 * Interrupt Management Module
 *
 * This module wraps the x86_64 interrupt-flag instructions and tracks, per
 * CPU, whether an interrupt handler is currently executing.
 *
 * Why this is important:
 * - Spinlocks disable interrupts on acquire and restore them on release
 * - The scheduler must never block or switch inside an interrupt handler,
 *   so it needs to know when it is running in one
 * - The reschedule IPI and the timer both end at the same safe point
 *
 * Interrupt stubs call `irq_enter()` first and `irq_exit()` last; after
 * `irq_exit()` returns false (outermost handler done) the stub may call
 * `Kernel::preempt_point()`.
 */

use core::sync::atomic::{AtomicU32, Ordering};

use ::x86_64::instructions::interrupts;

use crate::scheduler::types::MAX_CPUS;

/// Interrupt nesting depth per CPU
static IRQ_DEPTH: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(0) }; MAX_CPUS];

/// Enable interrupts on this CPU
pub fn enable() {
    interrupts::enable();
}

/// Disable interrupts on this CPU
pub fn disable() {
    interrupts::disable();
}

/// Check if interrupts are enabled on this CPU
pub fn are_enabled() -> bool {
    interrupts::are_enabled()
}

/// Mark entry into an interrupt handler on this CPU
pub fn irq_enter() {
    IRQ_DEPTH[super::apic::current_cpu().as_usize()].fetch_add(1, Ordering::Relaxed);
}

/// Mark exit from an interrupt handler
///
/// Returns true while still nested inside another handler.
pub fn irq_exit() -> bool {
    let depth = &IRQ_DEPTH[super::apic::current_cpu().as_usize()];
    depth.fetch_sub(1, Ordering::Relaxed) > 1
}

/// True while an interrupt handler runs on this CPU
pub fn in_interrupt() -> bool {
    IRQ_DEPTH[super::apic::current_cpu().as_usize()].load(Ordering::Relaxed) > 0
}
