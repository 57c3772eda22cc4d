/*
 * Scheduler Error Type
 *
 * Recoverable failures reported to callers of the scheduler core. Expected
 * outcomes (an empty wait queue, a timed-out wait) are not errors and are
 * returned as plain values; invariant violations are fatal and never show up
 * here (see `Kernel::fatal`).
 */

/// Errors returned by fallible scheduler operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Kernel stack (or other bookkeeping) allocation failed
    OutOfMemory,
    /// Thread ID doesn't exist in the thread table
    NoSuchThread,
    /// Process ID doesn't exist in the process table
    NoSuchProcess,
    /// Process is not a child of the caller
    NotChild,
    /// Process still has live threads
    NotZombie,
    /// Priority out of range (or the reserved idle priority)
    InvalidPriority,
    /// Operation not allowed in the object's current state
    InvalidState,
    /// No online CPU is allowed by the requested affinity
    NoOnlineCpu,
    /// CPU index is out of range or was never brought online
    CpuOffline,
    /// A blocking wait was cut short by a pending signal
    Interrupted,
    /// Configuration value rejected at kernel construction
    InvalidConfig(&'static str),
    /// A logger was already installed for the `log` facade
    LoggerInstalled,
}

impl core::fmt::Display for SchedError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SchedError::OutOfMemory => write!(f, "Out of memory"),
            SchedError::NoSuchThread => write!(f, "No such thread"),
            SchedError::NoSuchProcess => write!(f, "No such process"),
            SchedError::NotChild => write!(f, "Not a child process"),
            SchedError::NotZombie => write!(f, "Process has not exited"),
            SchedError::InvalidPriority => write!(f, "Invalid priority"),
            SchedError::InvalidState => write!(f, "Invalid state for operation"),
            SchedError::NoOnlineCpu => write!(f, "No online CPU in affinity mask"),
            SchedError::CpuOffline => write!(f, "CPU offline"),
            SchedError::Interrupted => write!(f, "Interrupted by signal"),
            SchedError::InvalidConfig(what) => write!(f, "Invalid configuration: {}", what),
            SchedError::LoggerInstalled => write!(f, "Logger already installed"),
        }
    }
}
