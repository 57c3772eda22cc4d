/*
 * x86_64 Architecture Support Module
 *
 * Bare-metal implementation of the `Arch` trait for the CLUU kernel image.
 *
 * Submodules:
 * - apic: x2APIC CPU identification and reschedule IPIs
 * - context: kernel-stack context switch
 * - interrupts: interrupt flag control and nesting tracking
 * - serial: COM1 console used as the log sink
 */

pub mod apic;
pub mod context;
pub mod interrupts;
pub mod serial;

use ::x86_64::instructions::hlt;
use ::x86_64::registers::control::{Cr3, Cr3Flags};
use ::x86_64::structures::paging::PhysFrame;

use super::Arch;
use crate::scheduler::types::CpuId;

pub use context::X86Context;

/// Marker type implementing `Arch` for x86_64 hardware
pub struct X86_64;

/// Root page table of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X86AddressSpace {
    pub pml4: PhysFrame,
    pub flags: Cr3Flags,
}

impl X86AddressSpace {
    /// The page tables that are active right now (used for the kernel process)
    pub fn current() -> Self {
        let (pml4, flags) = Cr3::read();
        Self { pml4, flags }
    }
}

impl Arch for X86_64 {
    type Context = X86Context;
    type AddressSpace = X86AddressSpace;

    fn current_cpu() -> CpuId {
        apic::current_cpu()
    }

    fn interrupts_enabled() -> bool {
        interrupts::are_enabled()
    }

    fn disable_interrupts() {
        interrupts::disable();
    }

    fn enable_interrupts() {
        interrupts::enable();
    }

    fn in_interrupt() -> bool {
        interrupts::in_interrupt()
    }

    fn send_reschedule_ipi(cpu: CpuId) {
        apic::send_ipi(cpu, apic::RESCHEDULE_VECTOR);
    }

    fn switch_address_space(space: &X86AddressSpace) {
        let (active, _) = Cr3::read();
        if active != space.pml4 {
            // SAFETY: every process address space maps the kernel identically,
            // so the code and stack in use stay mapped across the switch.
            unsafe { Cr3::write(space.pml4, space.flags) };
        }
    }

    fn wait_for_interrupt() {
        hlt();
    }

    fn console_write(s: &str) {
        serial::write_str(s);
    }
}
