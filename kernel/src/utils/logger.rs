/*
 * Kernel Logging System
 *
 * Backend for the `log` facade used throughout the scheduler. Records are
 * written as "[LEVEL] message" lines through a console sink, which is the
 * architecture's `console_write` (serial port on x86_64, stderr in host
 * tests).
 *
 * The logger is installed once. The level filter is the facade's global
 * max level, so `log::set_max_level` can change it at runtime.
 */

use core::fmt::{self, Write};

use log::{LevelFilter, Metadata, Record};
use spin::Once;

use crate::arch::Arch;
use crate::error::SchedError;

/// Where formatted log lines go
type Sink = fn(&str);

static SINK: Once<Sink> = Once::new();

/// The `log::Log` implementation of the kernel
pub struct KernelLogger;

/// Forwards formatted output to the sink piece by piece (no allocation)
struct SinkWriter(Sink);

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = SINK.get() {
            let _ = writeln!(SinkWriter(*sink), "[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger, writing through `A::console_write`
///
/// Fails with `LoggerInstalled` if a logger was already set for the `log`
/// facade.
pub fn init<A: Arch>(level: LevelFilter) -> Result<(), SchedError> {
    SINK.call_once(|| A::console_write as Sink);
    log::set_logger(&LOGGER).map_err(|_| SchedError::LoggerInstalled)?;
    log::set_max_level(level);
    log::info!("Logger initialized at level {}", level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::HostArch;

    #[test]
    fn second_init_is_rejected() {
        // Whichever call comes first in this test binary wins
        let _ = init::<HostArch>(LevelFilter::Warn);
        assert_eq!(init::<HostArch>(LevelFilter::Warn), Err(SchedError::LoggerInstalled));
        assert!(SINK.get().is_some());
    }

    #[test]
    fn sink_writer_forwards_every_piece() {
        use std::sync::Mutex as StdMutex;
        static CAPTURED: StdMutex<String> = StdMutex::new(String::new());
        fn capture(s: &str) {
            CAPTURED.lock().unwrap().push_str(s);
        }

        let mut writer = SinkWriter(capture);
        write!(writer, "[{}] {} {}", log::Level::Warn, "slice", 3).unwrap();
        assert_eq!(CAPTURED.lock().unwrap().as_str(), "[WARN] slice 3");
    }
}
