/*
 * Scheduler Event Definitions
 *
 * This module defines the events that the scheduler mechanism reports to
 * scheduling policies. Policies react to these events by updating their
 * ready structures.
 *
 * This design decouples the policy (what to schedule) from the mechanism
 * (how to perform context switches, manage threads, etc.).
 */

use super::{ThreadId, types::{CpuId, Priority}};

/// Events that the scheduler mechanism reports to a CPU's policy
///
/// Every event naming a thread is delivered to the policy of the CPU whose
/// ready queue the thread enters or leaves, with that CPU's run-queue lock
/// held.
#[derive(Debug, Clone)]
pub enum SchedEvent {
    /// A new thread became eligible to run for the first time
    ThreadCreated {
        tid: ThreadId,
        priority: Priority,
    },

    /// A blocked (or migrating) thread became runnable on this CPU
    ThreadWoke {
        tid: ThreadId,
        priority: Priority,
    },

    /// A running thread voluntarily gave up the CPU
    ThreadYielded {
        tid: ThreadId,
        priority: Priority,
    },

    /// A running thread was preempted at a safe point
    ///
    /// Either its slice ran out or a higher-priority thread became ready.
    ThreadPreempted {
        tid: ThreadId,
        priority: Priority,
    },

    /// A ready thread left this CPU's queue without being picked
    ///
    /// Happens when its affinity no longer allows this CPU.
    ThreadRemoved {
        tid: ThreadId,
        priority: Priority,
    },

    /// Priority of a queued thread was changed externally
    PriorityChanged {
        tid: ThreadId,
        old_priority: Priority,
        new_priority: Priority,
    },

    /// Timer interrupt (tick) occurred on a CPU
    Tick {
        cpu: CpuId,
        current_thread: Option<ThreadId>,
    },
}

impl SchedEvent {
    /// Get a short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            SchedEvent::ThreadCreated { .. } => "ThreadCreated",
            SchedEvent::ThreadWoke { .. } => "ThreadWoke",
            SchedEvent::ThreadYielded { .. } => "ThreadYielded",
            SchedEvent::ThreadPreempted { .. } => "ThreadPreempted",
            SchedEvent::ThreadRemoved { .. } => "ThreadRemoved",
            SchedEvent::PriorityChanged { .. } => "PriorityChanged",
            SchedEvent::Tick { .. } => "Tick",
        }
    }

    /// Check if this event may require preempting the running thread
    ///
    /// True for events that put a thread into the queue from outside the
    /// running context; the mechanism then compares priorities.
    pub fn should_reschedule_immediately(&self) -> bool {
        matches!(
            self,
            SchedEvent::ThreadCreated { .. }
                | SchedEvent::ThreadWoke { .. }
                | SchedEvent::PriorityChanged { .. }
        )
    }
}
