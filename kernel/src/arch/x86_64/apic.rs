/*
 * x2APIC access
 *
 * CPU identification and inter-processor interrupts through the x2APIC
 * MSR interface. Logical CPU numbers are assigned at bring-up with
 * `register_cpu`; unregistered APIC IDs map to themselves.
 */

use core::sync::atomic::{AtomicU32, Ordering};

use ::x86_64::registers::model_specific::Msr;

use crate::scheduler::types::{CpuId, MAX_CPUS};

/// IA32_X2APIC_APICID
const X2APIC_ID_MSR: u32 = 0x802;

/// IA32_X2APIC_ICR
const X2APIC_ICR_MSR: u32 = 0x830;

/// Vector the reschedule IPI is delivered on
pub const RESCHEDULE_VECTOR: u8 = 0xF0;

const UNREGISTERED: u32 = u32::MAX;

/// Logical CPU number -> APIC ID
static CPU_TO_APIC: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(UNREGISTERED) }; MAX_CPUS];

/// Record the APIC ID of logical CPU `cpu`
pub fn register_cpu(cpu: CpuId, apic_id: u32) {
    CPU_TO_APIC[cpu.as_usize()].store(apic_id, Ordering::Release);
}

fn apic_id() -> u32 {
    // SAFETY: reading the x2APIC ID register has no side effects.
    unsafe { Msr::new(X2APIC_ID_MSR).read() as u32 }
}

/// Logical number of the executing CPU
pub fn current_cpu() -> CpuId {
    let id = apic_id();
    CPU_TO_APIC
        .iter()
        .position(|slot| slot.load(Ordering::Acquire) == id)
        .map(|i| CpuId(i as u32))
        .unwrap_or(CpuId(id))
}

/// Send a fixed-delivery IPI with `vector` to logical CPU `cpu`
pub fn send_ipi(cpu: CpuId, vector: u8) {
    let dest = match CPU_TO_APIC[cpu.as_usize()].load(Ordering::Acquire) {
        UNREGISTERED => cpu.0,
        id => id,
    };
    let icr = ((dest as u64) << 32) | vector as u64;
    // SAFETY: writing the ICR only queues an interrupt for the target CPU.
    unsafe { Msr::new(X2APIC_ICR_MSR).write(icr) };
}
