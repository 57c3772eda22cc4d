/*
 * Scheduler Configuration
 *
 * Tunables for a kernel instance. The defaults match the CLUU kernel:
 * a 100Hz tick, 64 KiB kernel stacks and a single CPU.
 */

use crate::error::SchedError;
use crate::scheduler::types::{MAX_CPUS, Priority, SchedClass, TimeSliceTicks};

/// Default kernel stack size (64 KiB per thread)
pub const DEFAULT_KERNEL_STACK_SIZE: usize = 64 * 1024;

/// Default tick length (100Hz timer)
pub const DEFAULT_TICK_MS: u64 = 10;

/// Time slice handed out per scheduling class
///
/// A thread receives a full slice every time it newly becomes Running.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimeSliceTable {
    pub idle: TimeSliceTicks,
    pub batch: TimeSliceTicks,
    pub normal: TimeSliceTicks,
    pub interactive: TimeSliceTicks,
    pub realtime: TimeSliceTicks,
}

impl TimeSliceTable {
    pub fn get(&self, class: SchedClass) -> TimeSliceTicks {
        match class {
            SchedClass::Idle => self.idle,
            SchedClass::Batch => self.batch,
            SchedClass::Normal => self.normal,
            SchedClass::Interactive => self.interactive,
            SchedClass::RealTime => self.realtime,
        }
    }

    /// Slice for a thread running at `priority`
    pub fn for_priority(&self, priority: Priority) -> TimeSliceTicks {
        self.get(priority.class())
    }
}

impl Default for TimeSliceTable {
    fn default() -> Self {
        Self {
            idle: TimeSliceTicks(1),
            batch: TimeSliceTicks::LONG,
            normal: TimeSliceTicks::DEFAULT,
            interactive: TimeSliceTicks::SHORT,
            realtime: TimeSliceTicks::DEFAULT,
        }
    }
}

/// Kernel-wide scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Number of logical CPUs (each gets its own ready queue)
    pub cpu_count: usize,

    /// Milliseconds per timer tick
    pub tick_ms: u64,

    /// Bytes reserved for each thread's kernel stack
    pub kernel_stack_size: usize,

    /// Time slice per scheduling class
    pub time_slices: TimeSliceTable,

    /// Priority used when a thread builder does not set one
    pub default_priority: Priority,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            tick_ms: DEFAULT_TICK_MS,
            kernel_stack_size: DEFAULT_KERNEL_STACK_SIZE,
            time_slices: TimeSliceTable::default(),
            default_priority: Priority::NORMAL,
        }
    }
}

impl SchedConfig {
    pub fn with_cpus(mut self, cpu_count: usize) -> Self {
        self.cpu_count = cpu_count;
        self
    }

    pub fn with_tick_ms(mut self, tick_ms: u64) -> Self {
        self.tick_ms = tick_ms;
        self
    }

    pub fn with_kernel_stack_size(mut self, bytes: usize) -> Self {
        self.kernel_stack_size = bytes;
        self
    }

    pub fn with_time_slices(mut self, table: TimeSliceTable) -> Self {
        self.time_slices = table;
        self
    }

    pub fn with_default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    /// Reject configurations the scheduler cannot run with
    pub fn validate(&self) -> Result<(), SchedError> {
        if self.cpu_count == 0 || self.cpu_count > MAX_CPUS {
            return Err(SchedError::InvalidConfig("cpu_count must be 1..=64"));
        }
        if self.tick_ms == 0 {
            return Err(SchedError::InvalidConfig("tick_ms must be non-zero"));
        }
        if self.kernel_stack_size < 4096 {
            return Err(SchedError::InvalidConfig("kernel stack smaller than one page"));
        }
        if self.default_priority == Priority::IDLE {
            return Err(SchedError::InvalidConfig("default priority is reserved for idle"));
        }
        let t = &self.time_slices;
        if [t.idle, t.batch, t.normal, t.interactive, t.realtime]
            .iter()
            .any(|s| s.get() == 0)
        {
            return Err(SchedError::InvalidConfig("time slices must be at least one tick"));
        }
        Ok(())
    }

    /// Convert a millisecond timeout into whole ticks, rounding up
    pub fn ms_to_ticks(&self, ms: u64) -> u64 {
        ms.div_ceil(self.tick_ms)
    }
}
