/*
 * Diagnostics Tests
 */

use super::{boot, leak};
use crate::arch::host::HostArch;
use crate::scheduler::{CpuId, InvariantViolation, Priority, ThreadState};
use crate::sync::WaitQueue;

#[test]
fn snapshot_lists_queues_and_threads() {
    let kernel = boot(1);
    let queue: &'static WaitQueue<HostArch> = leak(WaitQueue::fifo());

    let sleeper = kernel
        .spawn_kernel_thread("sleeper", Priority::NORMAL, move || {
            queue.block(kernel, None);
        })
        .unwrap();
    kernel.yield_now();

    let low = kernel.spawn_kernel_thread("low", Priority::LOW, || {}).unwrap();
    let high = kernel.spawn_kernel_thread("high", Priority::HIGH, || {}).unwrap();

    let snapshot = kernel.dump_scheduler_state();
    assert_eq!(snapshot.cpus.len(), 1);
    let cpu = &snapshot.cpus[0];
    assert!(cpu.online);
    assert_eq!(cpu.load, 2);
    let q = cpu.queue.as_ref().unwrap();
    assert_eq!(q.policy, "Priority-Round-Robin");
    assert_eq!(q.current, Some(kernel.current_thread_id()));
    assert_eq!(q.idle, q.current);
    assert_eq!(
        q.ready,
        [(Priority::HIGH, vec![high.id]), (Priority::LOW, vec![low.id])]
    );

    let threads = snapshot.threads.as_ref().unwrap();
    assert_eq!(threads.len(), 4);
    let blocked = threads.iter().find(|t| t.id == sleeper.id).unwrap();
    assert_eq!(blocked.state, Some(ThreadState::Blocked));
    assert_eq!(blocked.blocked_on, Some(queue.id()));
    assert_eq!(snapshot.pending_finalization, Some(0));

    let text = snapshot.to_string();
    assert!(text.contains("CPU0: online"));
    assert!(text.contains(&format!("ready[50]: {}", high.id.0)));
    assert!(text.contains("sleeper"));
    assert!(text.contains("waiting on"));

    queue.wake_all(kernel);
    kernel.yield_now();
}

#[test]
fn invariants_hold_through_normal_operation() {
    let kernel = boot(1);
    let queue: &'static WaitQueue<HostArch> = leak(WaitQueue::priority());
    assert_eq!(kernel.check_invariants(), Ok(()));

    for priority in [Priority::LOW, Priority::NORMAL, Priority::HIGH] {
        kernel
            .spawn_kernel_thread("worker", priority, move || {
                queue.block(kernel, Some(30));
            })
            .unwrap();
    }
    assert_eq!(kernel.check_invariants(), Ok(()));

    kernel.yield_now();
    assert_eq!(queue.len(), 3);
    assert_eq!(kernel.check_invariants(), Ok(()));

    queue.wake_one(kernel);
    assert_eq!(kernel.check_invariants(), Ok(()));
    kernel.yield_now();
    assert_eq!(kernel.check_invariants(), Ok(()));

    super::ticks(kernel, 3);
    assert!(queue.is_empty());
    assert_eq!(kernel.check_invariants(), Ok(()));
}

#[test]
fn queued_thread_in_wrong_state_is_reported() {
    let kernel = boot(1);
    let thread = kernel
        .spawn_kernel_thread("victim", Priority::NORMAL, || {})
        .unwrap();

    thread.sched.lock().state = ThreadState::Created;
    assert_eq!(
        kernel.check_invariants(),
        Err(InvariantViolation::QueuedNotReady {
            tid: thread.id,
            state: ThreadState::Created,
        })
    );

    thread.sched.lock().state = ThreadState::Ready;
    assert_eq!(kernel.check_invariants(), Ok(()));
    kernel.yield_now();
}

#[test]
fn thread_queued_at_stale_level_is_reported() {
    let kernel = boot(1);
    let thread = kernel
        .spawn_kernel_thread("victim", Priority::NORMAL, || {})
        .unwrap();

    // a priority write that bypasses the run queue
    thread.sched.lock().priority = Priority::HIGH;
    assert_eq!(
        kernel.check_invariants(),
        Err(InvariantViolation::WrongLevel {
            tid: thread.id,
            level: Priority::NORMAL,
            priority: Priority::HIGH,
        })
    );

    thread.sched.lock().priority = Priority::NORMAL;
    assert_eq!(kernel.check_invariants(), Ok(()));
    kernel.yield_now();
}

#[test]
#[should_panic(expected = "invariant violated")]
fn assert_invariants_is_fatal_on_violation() {
    let kernel = boot(1);
    let thread = kernel
        .spawn_kernel_thread("victim", Priority::NORMAL, || {})
        .unwrap();
    thread.sched.lock().state = ThreadState::Blocked;
    kernel.assert_invariants();
}

#[test]
#[should_panic(expected = "scheduler fatal: out of options")]
fn fatal_panics_with_message() {
    let kernel = boot(1);
    kernel.fatal(format_args!("out of options"));
}

#[test]
#[should_panic(expected = "interrupts enabled")]
fn schedule_requires_interrupts_disabled() {
    let kernel = boot(1);
    kernel.schedule(CpuId::BSP, crate::scheduler::sched_core::SwitchReason::Yield);
}
