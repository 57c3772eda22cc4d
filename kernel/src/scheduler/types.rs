/*
 * Scheduler Type Definitions
 *
 * This module defines the core types used throughout the scheduler subsystem.
 * These types are designed to be lightweight, Copy-able, and suitable for
 * use in both policy and mechanism layers.
 */

use core::fmt;

use crate::error::SchedError;

/// Largest number of logical CPUs a kernel instance can manage
///
/// Bounded by the width of `CpuMask`.
pub const MAX_CPUS: usize = 64;

/// CPU identifier
///
/// Represents a logical CPU core. CPU 0 is the bootstrap processor and the
/// one that drives the global tick clock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub u32);

impl CpuId {
    /// Bootstrap processor (CPU 0)
    pub const BSP: CpuId = CpuId(0);

    /// Get the CPU ID as a usize for indexing
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU{}", self.0)
    }
}

/// Set of CPUs a thread may run on
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CpuMask(pub u64);

impl CpuMask {
    /// Every CPU
    pub const ALL: CpuMask = CpuMask(u64::MAX);

    /// No CPU at all (never a valid affinity)
    pub const EMPTY: CpuMask = CpuMask(0);

    /// Mask containing exactly one CPU
    pub fn single(cpu: CpuId) -> Self {
        CpuMask(1u64 << cpu.0)
    }

    /// Mask containing CPUs `0..count`
    pub fn first_n(count: usize) -> Self {
        if count >= MAX_CPUS {
            CpuMask::ALL
        } else {
            CpuMask((1u64 << count) - 1)
        }
    }

    pub fn contains(self, cpu: CpuId) -> bool {
        cpu.as_usize() < MAX_CPUS && self.0 & (1u64 << cpu.0) != 0
    }

    pub fn with(self, cpu: CpuId) -> Self {
        CpuMask(self.0 | (1u64 << cpu.0))
    }

    pub fn intersect(self, other: CpuMask) -> Self {
        CpuMask(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate over the CPUs in the mask, lowest first
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        (0..MAX_CPUS as u32).filter(move |&i| self.0 & (1u64 << i) != 0).map(CpuId)
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        CpuMask::ALL
    }
}

/// Thread priority
///
/// Higher values indicate higher priority. Valid priorities are `0..=63`;
/// `0` is reserved for the per-CPU idle threads.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    /// Number of distinct priority levels
    pub const LEVELS: usize = 64;

    /// Idle threads only
    pub const IDLE: Priority = Priority(0);

    /// Lowest priority an ordinary thread can have (the finalizer runs here)
    pub const MIN: Priority = Priority(1);

    /// Background work
    pub const LOW: Priority = Priority(10);

    /// Default for kernel and user threads
    pub const NORMAL: Priority = Priority(30);

    /// Latency-sensitive system services
    pub const HIGH: Priority = Priority(50);

    /// Highest priority
    pub const MAX: Priority = Priority(63);

    /// Build a priority, rejecting values above `MAX`
    pub const fn new(level: u8) -> Result<Priority, SchedError> {
        if level as usize >= Self::LEVELS {
            Err(SchedError::InvalidPriority)
        } else {
            Ok(Priority(level))
        }
    }

    /// Get the raw level
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Scheduling class this priority falls into
    pub fn class(self) -> SchedClass {
        match self.0 {
            0 => SchedClass::Idle,
            1..=19 => SchedClass::Batch,
            20..=39 => SchedClass::Normal,
            40..=55 => SchedClass::Interactive,
            _ => SchedClass::RealTime,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Time slice duration in timer ticks
///
/// With a 100Hz timer (10ms per tick), TimeSliceTicks(1) = 10ms.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimeSliceTicks(pub u32);

impl TimeSliceTicks {
    /// Default time slice (10 ticks = 100ms @ 100Hz)
    pub const DEFAULT: TimeSliceTicks = TimeSliceTicks(10);

    /// Short time slice for interactive threads (2 ticks = 20ms)
    pub const SHORT: TimeSliceTicks = TimeSliceTicks(2);

    /// Long time slice for batch threads (50 ticks = 500ms)
    pub const LONG: TimeSliceTicks = TimeSliceTicks(50);

    /// Get the value as u32
    pub fn get(self) -> u32 {
        self.0
    }
}

/// Thread class/category
///
/// Derived from the priority band. The time-slice table is indexed by class.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedClass {
    /// Interactive threads (shells, UI, etc.) - prefer responsiveness
    Interactive,

    /// Batch/background threads - prefer throughput
    Batch,

    /// Real-time threads - run ahead of everything else
    RealTime,

    /// Idle threads - run only when nothing else is runnable
    Idle,

    /// Normal threads - balanced scheduling
    Normal,
}

impl Default for SchedClass {
    fn default() -> Self {
        SchedClass::Normal
    }
}

/// Outcome of a wait on a `WaitQueue`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockResult {
    /// Woken by `wake_one`/`wake_all`
    Signaled,
    /// The timeout expired before any wake arrived
    Timeout,
    /// A signal was delivered to the waiting thread
    Interrupted,
}

/// Privilege level the timer interrupt arrived from
///
/// Decides which of the thread's time counters a tick is charged to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TickMode {
    User,
    Kernel,
}
