/*
 * Wait Timeouts
 *
 * Bounded waits register a deadline, in global ticks, in one ordered queue.
 * The boot CPU's timer tick expires every deadline that has passed and ends
 * the matching wait with `BlockResult::Timeout`, unless an explicit wake got
 * there first (the wake cancels the deadline).
 */

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

use super::{
    Kernel,
    thread::{ThreadId, ThreadState},
    types::BlockResult,
};
use crate::arch::Arch;

/// Identifies one armed timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeoutKey {
    pub deadline: u64,
    seq: u64,
}

/// Armed timeouts ordered by deadline (sequence number breaks ties)
pub(crate) struct TimeoutQueue {
    entries: BTreeMap<TimeoutKey, ThreadId>,
    next_seq: u64,
}

impl TimeoutQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn insert(&mut self, deadline: u64, tid: ThreadId) -> TimeoutKey {
        let key = TimeoutKey {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, tid);
        key
    }

    fn remove(&mut self, key: TimeoutKey) -> bool {
        self.entries.remove(&key).is_some()
    }

    /// Remove and return every entry due at or before `now`
    fn drain_expired(&mut self, now: u64) -> Vec<(TimeoutKey, ThreadId)> {
        let mut expired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().deadline > now {
                break;
            }
            let key = *entry.key();
            expired.push((key, entry.remove()));
        }
        expired
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<A: Arch> Kernel<A> {
    /// Register a timeout for `tid`, `ms` from now (rounded up to whole ticks)
    pub(crate) fn arm_timeout(&self, tid: ThreadId, ms: u64) -> TimeoutKey {
        let ticks = self.config.ms_to_ticks(ms).max(1);
        let deadline = self.ticks().saturating_add(ticks);
        self.timeouts.lock().insert(deadline, tid)
    }

    pub(crate) fn cancel_timeout(&self, key: TimeoutKey) {
        self.timeouts.lock().remove(key);
    }

    /// Number of armed timeouts
    pub fn pending_timeouts(&self) -> usize {
        self.timeouts.lock().len()
    }

    pub(crate) fn expire_timeouts(&self, now: u64) {
        let expired = self.timeouts.lock().drain_expired(now);
        for (key, tid) in expired {
            self.expire_wait(tid, key);
        }
    }

    /// End `tid`'s wait with Timeout if it is still the wait `key` was armed for
    fn expire_wait(&self, tid: ThreadId, key: TimeoutKey) {
        let Ok(thread) = self.thread(tid) else {
            return;
        };
        let handle = {
            let s = thread.sched.lock();
            if s.state != ThreadState::Blocked || s.timeout != Some(key) {
                return;
            }
            s.blocked_on.clone()
        };
        let Some(handle) = handle else {
            return;
        };

        let mut list = handle.lock();
        let still_waiting = {
            let s = thread.sched.lock();
            s.state == ThreadState::Blocked
                && s.timeout == Some(key)
                && s.blocked_on.as_ref().is_some_and(|h| Arc::ptr_eq(h, &handle))
        };
        if still_waiting && list.remove(&thread) {
            log::trace!("{} wait timed out at tick {}", tid, key.deadline);
            self.complete_wait(&thread, BlockResult::Timeout);
        }
    }
}
