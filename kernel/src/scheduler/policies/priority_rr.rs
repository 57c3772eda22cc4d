/*
 * Priority Round-Robin Scheduling Policy
 *
 * One FIFO queue per priority level plus a 64-bit occupancy bitmap.
 *
 * Features:
 * - Highest non-empty level found with a single leading_zeros()
 * - Round-robin among equal priorities (yielded/preempted threads go to
 *   the back of their level)
 * - Priority dominates: a lower level only runs when every higher level
 *   is empty
 *
 * This is the default policy for CLUU.
 */

use alloc::{collections::VecDeque, vec::Vec};

use super::super::{
    ThreadId,
    events::SchedEvent,
    traits::SchedPolicy,
    types::{CpuId, Priority},
};

/// Priority-indexed ready queue
pub struct PriorityRoundRobin {
    /// FIFO queue of thread IDs per priority level
    levels: [VecDeque<ThreadId>; Priority::LEVELS],

    /// Bit n set <=> levels[n] is non-empty
    occupied: u64,

    /// Total queued threads
    len: usize,
}

impl PriorityRoundRobin {
    pub fn new() -> Self {
        Self {
            levels: core::array::from_fn(|_| VecDeque::new()),
            occupied: 0,
            len: 0,
        }
    }

    fn push(&mut self, tid: ThreadId, priority: Priority) {
        let level = priority.get() as usize;
        self.levels[level].push_back(tid);
        self.occupied |= 1u64 << level;
        self.len += 1;
    }

    fn remove(&mut self, tid: ThreadId, priority: Priority) -> bool {
        let level = priority.get() as usize;
        let queue = &mut self.levels[level];
        match queue.iter().position(|&t| t == tid) {
            Some(pos) => {
                queue.remove(pos);
                if queue.is_empty() {
                    self.occupied &= !(1u64 << level);
                }
                self.len -= 1;
                true
            }
            None => {
                log::warn!("[PRR Policy] {} not queued at priority {}", tid, priority);
                false
            }
        }
    }

    fn top_level(&self) -> Option<usize> {
        if self.occupied == 0 {
            None
        } else {
            Some(63 - self.occupied.leading_zeros() as usize)
        }
    }
}

impl Default for PriorityRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedPolicy for PriorityRoundRobin {
    fn on_event(&mut self, event: SchedEvent) {
        match event {
            SchedEvent::ThreadCreated { tid, priority }
            | SchedEvent::ThreadWoke { tid, priority }
            | SchedEvent::ThreadYielded { tid, priority }
            | SchedEvent::ThreadPreempted { tid, priority } => {
                self.push(tid, priority);
            }

            SchedEvent::ThreadRemoved { tid, priority } => {
                self.remove(tid, priority);
            }

            SchedEvent::PriorityChanged {
                tid,
                old_priority,
                new_priority,
            } => {
                if self.remove(tid, old_priority) {
                    self.push(tid, new_priority);
                }
            }

            SchedEvent::Tick { .. } => {
                // Slices are accounted by the mechanism
            }
        }
    }

    fn pick_next(&mut self, _cpu: CpuId) -> Option<ThreadId> {
        let level = self.top_level()?;
        let queue = &mut self.levels[level];
        let tid = queue.pop_front();
        if queue.is_empty() {
            self.occupied &= !(1u64 << level);
        }
        if tid.is_some() {
            self.len -= 1;
        }
        tid
    }

    fn peek_next(&self) -> Option<ThreadId> {
        self.top_level()
            .and_then(|level| self.levels[level].front().copied())
    }

    fn highest_priority(&self) -> Option<Priority> {
        self.top_level()
            .and_then(|level| Priority::new(level as u8).ok())
    }

    fn len(&self) -> usize {
        self.len
    }

    fn queued(&self) -> Vec<(Priority, Vec<ThreadId>)> {
        (0..Priority::LEVELS)
            .rev()
            .filter(|&level| !self.levels[level].is_empty())
            .filter_map(|level| {
                let priority = Priority::new(level as u8).ok()?;
                Some((priority, self.levels[level].iter().copied().collect()))
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "Priority-Round-Robin"
    }
}
