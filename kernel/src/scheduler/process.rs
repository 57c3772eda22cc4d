/*
 * Process Abstraction
 *
 * A Process is the container its threads execute in:
 * - Address space (page tables), activated when one of its threads runs
 * - One or more threads
 * - Identity: parent, process group, session
 *
 * Processes are never scheduled themselves. This follows the Unix model:
 * - A child inherits its parent's process group and session
 * - When the last thread is finalized the process becomes a zombie that
 *   holds its exit code until the parent reaps it
 * - Children of an exiting process are re-parented to the init process
 *
 * The parent link is weak: a child never keeps its parent alive.
 */

use alloc::{
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::{KERNEL_PID, Kernel, thread::ThreadId, types::BlockResult};
use crate::arch::Arch;
use crate::error::SchedError;
use crate::sync::{Spinlock, WaitQueue};

/// Unique identifier for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub usize);

impl ProcessId {
    /// Get the raw ID value
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process({})", self.0)
    }
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Has live threads (or has not started any yet)
    Running,
    /// Every thread has been finalized; exit code awaits the parent
    Zombie,
    /// Reaped or reclaimed; gone from the process table
    Reaped,
}

/// Identity and membership, protected by `Process::ident`
pub(crate) struct ProcessIdent<A: Arch> {
    parent: Weak<Process<A>>,
    parent_id: Option<ProcessId>,
    pgid: ProcessId,
    sid: ProcessId,
    state: ProcessState,
    exit_code: Option<i32>,
    threads: Vec<ThreadId>,
    children: Vec<ProcessId>,
    auto_reap: bool,
}

/// A process: address space, threads and Unix-style identity
pub struct Process<A: Arch> {
    pub id: ProcessId,
    name: String,
    pub(crate) address_space: A::AddressSpace,
    pub(crate) ident: Spinlock<A, ProcessIdent<A>>,
    /// Threads created and not yet finalized
    live_threads: AtomicUsize,
    /// The parent sleeps here in `wait_for_child`
    pub(crate) child_exit: WaitQueue<A>,
}

impl<A: Arch> Process<A> {
    pub(crate) fn new(
        id: ProcessId,
        name: &str,
        parent: Option<&Arc<Process<A>>>,
        address_space: A::AddressSpace,
    ) -> Self {
        // A process without a parent leads its own group and session
        let (parent_ref, parent_id, pgid, sid) = match parent {
            Some(parent) => {
                let ident = parent.ident.lock();
                (Arc::downgrade(parent), Some(parent.id), ident.pgid, ident.sid)
            }
            None => (Weak::new(), None, id, id),
        };

        Self {
            id,
            name: String::from(name),
            address_space,
            ident: Spinlock::new(ProcessIdent {
                parent: parent_ref,
                parent_id,
                pgid,
                sid,
                state: ProcessState::Running,
                exit_code: None,
                threads: Vec::new(),
                children: Vec::new(),
                auto_reap: false,
            }),
            live_threads: AtomicUsize::new(0),
            child_exit: WaitQueue::fifo(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address_space(&self) -> &A::AddressSpace {
        &self.address_space
    }

    /// Parent process, if it still exists
    pub fn parent(&self) -> Option<Arc<Process<A>>> {
        self.ident.lock().parent.upgrade()
    }

    pub fn parent_id(&self) -> Option<ProcessId> {
        self.ident.lock().parent_id
    }

    pub fn pgid(&self) -> ProcessId {
        self.ident.lock().pgid
    }

    pub fn sid(&self) -> ProcessId {
        self.ident.lock().sid
    }

    pub fn state(&self) -> ProcessState {
        self.ident.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn is_zombie(&self) -> bool {
        self.state() == ProcessState::Zombie
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.ident.lock().exit_code
    }

    pub fn live_threads(&self) -> usize {
        self.live_threads.load(Ordering::Acquire)
    }

    /// IDs of the threads not yet finalized
    pub fn threads(&self) -> Vec<ThreadId> {
        self.ident.lock().threads.clone()
    }

    pub fn children(&self) -> Vec<ProcessId> {
        self.ident.lock().children.clone()
    }

    pub fn auto_reap(&self) -> bool {
        self.ident.lock().auto_reap
    }

    pub(crate) fn attach_thread(&self, tid: ThreadId) {
        self.ident.lock().threads.push(tid);
        self.live_threads.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a finalized thread; true if the process just became a zombie
    ///
    /// The kernel process outlives all of its threads.
    pub(crate) fn detach_thread(&self, tid: ThreadId, exit_code: i32) -> bool {
        let mut ident = self.ident.lock();
        ident.threads.retain(|&t| t != tid);
        let remaining = self.live_threads.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && ident.state == ProcessState::Running && self.id != KERNEL_PID {
            ident.state = ProcessState::Zombie;
            ident.exit_code = Some(exit_code);
            true
        } else {
            false
        }
    }
}

impl<A: Arch> fmt::Debug for Process<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("live_threads", &self.live_threads())
            .finish()
    }
}

// ============================================================================
// PROCESS LIFECYCLE OPERATIONS
// ============================================================================

impl<A: Arch> Kernel<A> {
    /// Create a child of `parent` with its own address space
    ///
    /// The child starts with no threads, in the parent's process group and
    /// session.
    pub fn create_process(
        &self,
        parent: ProcessId,
        name: &str,
        address_space: A::AddressSpace,
    ) -> Result<Arc<Process<A>>, SchedError> {
        let parent = self.process(parent)?;
        if !parent.is_running() {
            return Err(SchedError::InvalidState);
        }

        let pid = ProcessId(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let process = Arc::new(Process::new(pid, name, Some(&parent), address_space));
        parent.ident.lock().children.push(pid);
        self.processes.lock().insert(pid, process.clone());

        log::info!("Created {} '{}' (parent {})", pid, name, parent.id);
        Ok(process)
    }

    /// Move `pid` into process group `pgid`
    ///
    /// `pgid` must be `pid` itself (new group) or an existing group of the
    /// same session.
    pub fn set_process_group(&self, pid: ProcessId, pgid: ProcessId) -> Result<(), SchedError> {
        let process = self.process(pid)?;
        if !process.is_running() {
            return Err(SchedError::InvalidState);
        }
        let sid = process.sid();
        if pgid != pid {
            let group_exists = self
                .all_processes()
                .iter()
                .any(|p| p.id != pid && p.pgid() == pgid && p.sid() == sid);
            if !group_exists {
                return Err(SchedError::InvalidState);
            }
        }
        process.ident.lock().pgid = pgid;
        log::debug!("{} joined process group {}", pid, pgid.0);
        Ok(())
    }

    /// Make `pid` the leader of a new session and process group
    ///
    /// Fails for a process that already leads a group.
    pub fn create_session(&self, pid: ProcessId) -> Result<ProcessId, SchedError> {
        let process = self.process(pid)?;
        let mut ident = process.ident.lock();
        if ident.state != ProcessState::Running || ident.pgid == pid {
            return Err(SchedError::InvalidState);
        }
        ident.pgid = pid;
        ident.sid = pid;
        drop(ident);
        log::debug!("{} leads new session", pid);
        Ok(pid)
    }

    /// Orphaned children are re-parented to `pid`
    pub fn set_init_process(&self, pid: ProcessId) -> Result<(), SchedError> {
        let process = self.process(pid)?;
        if !process.is_running() {
            return Err(SchedError::InvalidState);
        }
        *self.init_process.lock() = Some(pid);
        log::info!("{} is the init process", pid);
        Ok(())
    }

    /// Reclaim the children of `pid` as soon as they exit, without a reap
    pub fn set_auto_reap(&self, pid: ProcessId, auto_reap: bool) -> Result<(), SchedError> {
        self.process(pid)?.ident.lock().auto_reap = auto_reap;
        Ok(())
    }

    /// Collect the exit code of zombie `child`, removing it for good
    ///
    /// Exactly one caller gets the code; a concurrent reaper sees
    /// `NotZombie` or `NoSuchProcess`.
    pub fn reap(&self, parent: ProcessId, child: ProcessId) -> Result<i32, SchedError> {
        let process = self.process(child)?;
        let code = {
            let mut ident = process.ident.lock();
            if ident.parent_id != Some(parent) {
                return Err(SchedError::NotChild);
            }
            if ident.state != ProcessState::Zombie {
                return Err(SchedError::NotZombie);
            }
            ident.state = ProcessState::Reaped;
            ident.exit_code.unwrap_or(0)
        };
        self.remove_process(&process);
        Ok(code)
    }

    /// Sleep until `child` is a zombie, then reap it
    ///
    /// A signal ends the wait with `Interrupted`.
    pub fn wait_for_child(&self, parent: ProcessId, child: ProcessId) -> Result<i32, SchedError> {
        let parent_proc = self.process(parent)?;
        loop {
            let process = self.process(child)?;
            if process.parent_id() != Some(parent) {
                return Err(SchedError::NotChild);
            }
            let result = parent_proc
                .child_exit
                .block_if(self, None, || !process.is_zombie());
            match result {
                None => return self.reap(parent, child),
                Some(BlockResult::Interrupted) => return Err(SchedError::Interrupted),
                Some(_) => continue,
            }
        }
    }

    /// Every process in the table, kernel process included
    pub fn all_processes(&self) -> Vec<Arc<Process<A>>> {
        self.processes.lock().values().cloned().collect()
    }

    /// Handle a process whose last thread was just finalized
    pub(crate) fn process_exited(&self, process: &Arc<Process<A>>) {
        log::info!(
            "{} '{}' exited with code {}",
            process.id,
            process.name(),
            process.exit_code().unwrap_or(0)
        );

        self.reparent_children(process);

        match process.parent() {
            Some(parent) if parent.state() != ProcessState::Reaped => {
                if parent.auto_reap() {
                    self.reclaim_process(process);
                }
                parent.child_exit.wake_all(self);
            }
            _ => self.reclaim_process(process),
        }
    }

    /// Hand the children of an exiting process to init (or orphan them)
    fn reparent_children(&self, process: &Arc<Process<A>>) {
        let children = core::mem::take(&mut process.ident.lock().children);
        if children.is_empty() {
            return;
        }
        let init_pid = *self.init_process.lock();
        let init = init_pid
            .filter(|&pid| pid != process.id)
            .and_then(|pid| self.process(pid).ok())
            .filter(|init| init.is_running());

        for cid in children {
            let Ok(child) = self.process(cid) else {
                continue;
            };
            match &init {
                Some(init) => {
                    {
                        let mut ident = child.ident.lock();
                        ident.parent = Arc::downgrade(init);
                        ident.parent_id = Some(init.id);
                    }
                    init.ident.lock().children.push(cid);
                    log::debug!("{} re-parented to {}", cid, init.id);
                    if child.is_zombie() {
                        if init.auto_reap() {
                            self.reclaim_process(&child);
                        }
                        init.child_exit.wake_all(self);
                    }
                }
                None => {
                    {
                        let mut ident = child.ident.lock();
                        ident.parent = Weak::new();
                        ident.parent_id = None;
                    }
                    if child.is_zombie() {
                        self.reclaim_process(&child);
                    }
                }
            }
        }
    }

    /// Reclaim a zombie nobody will reap; a no-op once it was reaped
    fn reclaim_process(&self, process: &Arc<Process<A>>) {
        {
            let mut ident = process.ident.lock();
            if ident.state != ProcessState::Zombie {
                return;
            }
            ident.state = ProcessState::Reaped;
        }
        self.remove_process(process);
    }

    /// Drop a process marked Reaped from its parent and the process table
    fn remove_process(&self, process: &Arc<Process<A>>) {
        if let Some(parent) = process.parent() {
            parent.ident.lock().children.retain(|&c| c != process.id);
        }
        self.processes.lock().remove(&process.id);
        log::debug!("{} reclaimed", process.id);
    }
}
