/*
 * Scheduler Trait Definitions
 *
 * This module defines the policy side of the policy/mechanism split:
 *
 * - SchedPolicy: the per-CPU ready-queue discipline (which thread next)
 * - the mechanism (Kernel, sched_core) owns threads, locks, time slices
 *   and context switches, and reports changes to the policy as SchedEvents
 *
 * This separation allows:
 * 1. Swapping scheduling algorithms without changing the switching code
 * 2. Testing policies in isolation
 * 3. Clear ownership boundaries (policies see ThreadIds, never Thread structs)
 */

use alloc::vec::Vec;

use super::{
    ThreadId,
    events::SchedEvent,
    types::{CpuId, Priority},
};

/// Scheduling policy trait
///
/// Each CPU owns one policy instance, always accessed under that CPU's
/// run-queue lock. The policy stores only thread IDs; the mechanism resolves
/// them to threads.
pub trait SchedPolicy: Send {
    /// React to a scheduling event (insert, remove or reorder a thread)
    fn on_event(&mut self, event: SchedEvent);

    /// Remove and return the thread that should run next
    ///
    /// `None` means the ready queue is empty and the CPU should idle.
    fn pick_next(&mut self, cpu: CpuId) -> Option<ThreadId>;

    /// The thread `pick_next` would return, without removing it
    fn peek_next(&self) -> Option<ThreadId>;

    /// Priority of the best queued thread
    fn highest_priority(&self) -> Option<Priority>;

    /// Notification that a context switch completed
    fn on_switched(&mut self, _cpu: CpuId, _prev: Option<ThreadId>, _next: Option<ThreadId>) {}

    /// Number of queued threads
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued threads grouped by priority, highest first, in pick order
    fn queued(&self) -> Vec<(Priority, Vec<ThreadId>)>;

    /// Get the policy name for debugging
    fn name(&self) -> &'static str;
}
