/*
 * Scheduler Diagnostics
 *
 * - dump_scheduler_state(): human-readable snapshot of every CPU's run
 *   queue and every thread, for debug commands and the fatal path
 * - check_invariants(): verifies exclusive queue membership
 *
 * The snapshot never waits for a lock held elsewhere: it may be taken by
 * `Kernel::fatal` on a CPU that is in the middle of a scheduling decision.
 * Anything it cannot read is reported as busy.
 */

use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use core::fmt;

use super::{
    Kernel, ProcessId,
    sched_core::CpuStats,
    thread::{ThreadId, ThreadState},
    types::{CpuId, Priority},
};
use crate::arch::Arch;

/// State of one CPU at snapshot time
#[derive(Debug, Clone)]
pub struct CpuSnapshot {
    pub cpu: CpuId,
    pub online: bool,
    pub need_resched: bool,
    pub load: usize,
    pub ipis_received: u64,
    /// `None` when the run queue was locked by another CPU
    pub queue: Option<QueueSnapshot>,
}

/// Run-queue part of a `CpuSnapshot`
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub policy: &'static str,
    pub current: Option<ThreadId>,
    pub idle: Option<ThreadId>,
    pub timeslice_remaining: u32,
    pub stats: CpuStats,
    /// Ready threads, highest priority first
    pub ready: Vec<(Priority, Vec<ThreadId>)>,
}

/// State of one thread at snapshot time
#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    pub id: ThreadId,
    pub name: String,
    pub process: ProcessId,
    /// `None` when the thread's lock was busy
    pub state: Option<ThreadState>,
    pub priority: Option<Priority>,
    pub cpu: Option<CpuId>,
    /// Identity of the wait queue the thread is blocked on
    pub blocked_on: Option<usize>,
}

/// Everything `dump_scheduler_state` saw
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub ticks: u64,
    pub cpus: Vec<CpuSnapshot>,
    /// `None` when the thread table was busy
    pub threads: Option<Vec<ThreadSnapshot>>,
    pub pending_finalization: Option<usize>,
}

impl fmt::Display for SchedulerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Scheduler state (tick {}) ===", self.ticks)?;
        for cpu in &self.cpus {
            write!(
                f,
                "{}: {} load={} need_resched={} ipis={}",
                cpu.cpu,
                if cpu.online { "online" } else { "offline" },
                cpu.load,
                cpu.need_resched,
                cpu.ipis_received
            )?;
            match &cpu.queue {
                None => writeln!(f, " queue=<busy>")?,
                Some(q) => {
                    writeln!(
                        f,
                        " policy={} slice={} switches={} ticks={} idle_ticks={}",
                        q.policy,
                        q.timeslice_remaining,
                        q.stats.context_switches,
                        q.stats.ticks,
                        q.stats.idle_ticks
                    )?;
                    match q.current {
                        Some(id) => writeln!(f, "  current: {}", id)?,
                        None => writeln!(f, "  current: -")?,
                    }
                    for (priority, ids) in &q.ready {
                        write!(f, "  ready[{:2}]:", priority.get())?;
                        for id in ids {
                            write!(f, " {}", id.0)?;
                        }
                        writeln!(f)?;
                    }
                }
            }
        }

        match &self.threads {
            None => writeln!(f, "threads: <busy>")?,
            Some(threads) => {
                writeln!(f, "threads:")?;
                for t in threads {
                    write!(f, "  {:>4} {:<16} {}", t.id.0, t.name, t.process)?;
                    match (t.state, t.priority) {
                        (Some(state), Some(priority)) => write!(f, " {:?} prio={}", state, priority)?,
                        _ => write!(f, " <busy>")?,
                    }
                    if let Some(cpu) = t.cpu {
                        write!(f, " on {}", cpu)?;
                    }
                    if let Some(queue) = t.blocked_on {
                        write!(f, " waiting on {:#x}", queue)?;
                    }
                    writeln!(f)?;
                }
            }
        }

        if let Some(pending) = self.pending_finalization {
            writeln!(f, "finalizer: {} pending", pending)?;
        }
        Ok(())
    }
}

/// A broken queue-membership invariant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// CPU is online but has no idle thread
    MissingIdle(CpuId),
    /// CPU's current thread is not in state Running
    CurrentNotRunning { cpu: CpuId, tid: ThreadId, state: ThreadState },
    /// Thread is Running but no CPU has it as current
    RunningNotCurrent(ThreadId),
    /// Thread is a member of more than one queue
    MultipleMembership { tid: ThreadId, count: usize },
    /// Thread is Ready but in no ready queue
    ReadyNotQueued(ThreadId),
    /// Thread sits in a ready queue but is not Ready
    QueuedNotReady { tid: ThreadId, state: ThreadState },
    /// Thread sits at a ready-queue level other than its priority
    WrongLevel { tid: ThreadId, level: Priority, priority: Priority },
    /// Thread is Blocked but not exactly once on the queue it points to
    BlockedNotOnQueue(ThreadId),
    /// Ready queue names a thread missing from the thread table
    UnknownThread(ThreadId),
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvariantViolation::MissingIdle(cpu) => write!(f, "{} has no idle thread", cpu),
            InvariantViolation::CurrentNotRunning { cpu, tid, state } => {
                write!(f, "{} runs {} which is {:?}", cpu, tid, state)
            }
            InvariantViolation::RunningNotCurrent(tid) => write!(f, "{} is Running on no CPU", tid),
            InvariantViolation::MultipleMembership { tid, count } => {
                write!(f, "{} is in {} queues", tid, count)
            }
            InvariantViolation::ReadyNotQueued(tid) => write!(f, "{} is Ready but not queued", tid),
            InvariantViolation::QueuedNotReady { tid, state } => {
                write!(f, "{} is queued but {:?}", tid, state)
            }
            InvariantViolation::WrongLevel { tid, level, priority } => {
                write!(f, "{} is queued at {} but has priority {}", tid, level, priority)
            }
            InvariantViolation::BlockedNotOnQueue(tid) => {
                write!(f, "{} is Blocked but not on its wait queue", tid)
            }
            InvariantViolation::UnknownThread(tid) => write!(f, "{} is queued but unknown", tid),
        }
    }
}

impl<A: Arch> Kernel<A> {
    /// Snapshot all per-CPU ready queues and thread states
    pub fn dump_scheduler_state(&self) -> SchedulerSnapshot {
        let cpus = self
            .cpus
            .iter()
            .map(|state| {
                let queue = state.rq.try_lock().and_then(|rq| {
                    let q = rq.try_borrow().ok()?;
                    Some(QueueSnapshot {
                        policy: q.policy.name(),
                        current: q.current.as_ref().map(|t| t.id),
                        idle: q.idle.as_ref().map(|t| t.id),
                        timeslice_remaining: q.timeslice_remaining,
                        stats: q.stats,
                        ready: q.policy.queued(),
                    })
                });
                CpuSnapshot {
                    cpu: state.cpu,
                    online: state.is_online(),
                    need_resched: state.need_resched(),
                    load: state.load(),
                    ipis_received: state.ipis_received(),
                    queue,
                }
            })
            .collect();

        let threads = self.threads.try_lock().map(|table| {
            let list: Vec<_> = table.values().cloned().collect();
            drop(table);
            list.iter()
                .map(|t| {
                    let sched = t.sched.try_lock();
                    ThreadSnapshot {
                        id: t.id,
                        name: String::from(t.name()),
                        process: t.process.id,
                        state: sched.as_ref().map(|s| s.state),
                        priority: sched.as_ref().map(|s| s.priority),
                        cpu: sched.as_ref().and_then(|s| s.cpu),
                        blocked_on: sched
                            .as_ref()
                            .and_then(|s| s.blocked_on.as_ref())
                            .map(|h| Arc::as_ptr(h) as *const () as usize),
                    }
                })
                .collect()
        });

        SchedulerSnapshot {
            ticks: self.ticks(),
            cpus,
            threads,
            pending_finalization: self.finalizer.try_pending_len(),
        }
    }

    /// Verify that every thread is where its state says it is
    ///
    /// Meant for quiescent moments (debug commands, tests): the checks read
    /// one lock at a time, so a concurrent wake can produce a false report.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut membership: BTreeMap<ThreadId, usize> = BTreeMap::new();
        let mut queued: Vec<(ThreadId, Option<Priority>)> = Vec::new();
        let mut running: Vec<ThreadId> = Vec::new();

        for state in self.cpus.iter().filter(|s| s.is_online()) {
            let rq = state.rq.lock();
            let q = rq.borrow();
            if q.idle.is_none() {
                return Err(InvariantViolation::MissingIdle(state.cpu));
            }
            if let Some(current) = &q.current {
                let current_state = current.state();
                if current_state != ThreadState::Running {
                    return Err(InvariantViolation::CurrentNotRunning {
                        cpu: state.cpu,
                        tid: current.id,
                        state: current_state,
                    });
                }
                if !current.is_idle() {
                    *membership.entry(current.id).or_default() += 1;
                    running.push(current.id);
                }
            }
            if let Some(migrating) = &q.migrating {
                *membership.entry(migrating.id).or_default() += 1;
                queued.push((migrating.id, None));
            }
            for (level, ids) in q.policy.queued() {
                for id in ids {
                    *membership.entry(id).or_default() += 1;
                    queued.push((id, Some(level)));
                }
            }
        }

        for &(id, level) in &queued {
            let thread = self
                .thread(id)
                .map_err(|_| InvariantViolation::UnknownThread(id))?;
            let (state, priority) = {
                let s = thread.sched.lock();
                (s.state, s.priority)
            };
            if state != ThreadState::Ready {
                return Err(InvariantViolation::QueuedNotReady { tid: id, state });
            }
            if let Some(level) = level.filter(|&l| l != priority) {
                return Err(InvariantViolation::WrongLevel { tid: id, level, priority });
            }
        }

        for thread in self.all_threads() {
            if thread.is_idle() {
                continue;
            }
            let (state, handle) = {
                let s = thread.sched.lock();
                (s.state, s.blocked_on.clone())
            };
            match state {
                ThreadState::Running if !running.contains(&thread.id) => {
                    return Err(InvariantViolation::RunningNotCurrent(thread.id));
                }
                ThreadState::Ready if !membership.contains_key(&thread.id) => {
                    return Err(InvariantViolation::ReadyNotQueued(thread.id));
                }
                ThreadState::Blocked => {
                    let on_queue = handle.is_some_and(|h| h.lock().occurrences(thread.id) == 1);
                    if !on_queue {
                        return Err(InvariantViolation::BlockedNotOnQueue(thread.id));
                    }
                    *membership.entry(thread.id).or_default() += 1;
                }
                _ => {}
            }
        }

        match membership.into_iter().find(|&(_, count)| count > 1) {
            Some((tid, count)) => Err(InvariantViolation::MultipleMembership { tid, count }),
            None => Ok(()),
        }
    }

    /// `check_invariants`, with a violation treated as fatal
    pub fn assert_invariants(&self) {
        if let Err(violation) = self.check_invariants() {
            self.fatal(format_args!("invariant violated: {}", violation));
        }
    }
}
