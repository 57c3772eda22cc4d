/*
 * x86_64 Context Switch
 *
 * Kernel threads switch on their kernel stacks: the callee-saved registers
 * (rbp, rbx, r12-r15) are pushed on the outgoing stack, the stack pointer is
 * stored in the outgoing context, and the incoming stack pointer is loaded
 * and unwound the same way. Caller-saved registers are already spilled by
 * the compiler around the call, and the interrupt flag stays cleared across
 * the switch because the scheduler always switches with interrupts off.
 *
 * INITIAL STACK LAYOUT (fresh thread):
 * ====================================
 *
 *   top - 8   -> thread_entry_stub   (popped by `ret`)
 *   top - 16  -> rbp = 0
 *   top - 24  -> rbx = 0
 *   top - 32  -> r12 = entry fn
 *   top - 40  -> r13 = entry argument
 *   top - 48  -> r14 = 0
 *   top - 56  -> r15 = 0              <- saved rsp
 *
 * After `ret` the stack pointer equals `top` (16-byte aligned), so the
 * `call r12` in the stub hands the entry function a correctly aligned frame.
 */

use core::arch::naked_asm;

use crate::arch::{ArchContext, ContextEntry, KernelStack};

/// Saved state of a kernel thread: its stack pointer
#[repr(C)]
#[derive(Debug)]
pub struct X86Context {
    rsp: u64,
}

/// Number of 8-byte slots in the initial frame
const INITIAL_FRAME_SLOTS: usize = 7;

impl ArchContext for X86Context {
    fn bootstrap() -> Self {
        X86Context { rsp: 0 }
    }

    fn prepare_initial_context(stack: &mut KernelStack, entry: ContextEntry, arg: usize) -> Self {
        let top = stack.top();
        let frame = (top - INITIAL_FRAME_SLOTS * 8) as *mut u64;
        let values: [u64; INITIAL_FRAME_SLOTS] = [
            0,                                  // r15
            0,                                  // r14
            arg as u64,                         // r13
            entry as usize as u64,              // r12
            0,                                  // rbx
            0,                                  // rbp
            thread_entry_stub as usize as u64,  // return address
        ];
        // SAFETY: the frame lies inside the exclusively borrowed stack.
        unsafe {
            for (i, value) in values.iter().enumerate() {
                frame.add(i).write(*value);
            }
        }
        X86Context { rsp: frame as u64 }
    }

    unsafe fn switch_context(prev: *mut Self, next: *const Self) {
        unsafe { switch_stacks(&raw mut (*prev).rsp, (*next).rsp) }
    }
}

/// Save callee-saved registers on the current stack and resume `next_rsp`
#[unsafe(naked)]
unsafe extern "C" fn switch_stacks(prev_rsp: *mut u64, next_rsp: u64) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

/// First code a fresh thread executes: `entry(arg)`, which never returns
#[unsafe(naked)]
unsafe extern "C" fn thread_entry_stub() -> ! {
    naked_asm!("mov rdi, r13", "call r12", "ud2")
}
