//! A [`log::Log`] that never allocates.
//!
//! Most of what we log happens inside `malloc()` or `free()`, so a logger
//! that formats into a `String` would recurse straight back into us. This one
//! formats each record into a fixed stack buffer and `write(2)`s it to
//! stderr.

use std::fmt::Write;

use log::{LevelFilter, Log, Metadata, Record};

use crate::util::print::StackBuf;

pub struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut buf = StackBuf::<512>::new();
        let _ = write!(buf, "[safeheap {:<5}] {}", record.level(), record.args());
        if buf.is_truncated() {
            let _ = buf.write_str(" ...");
        }
        let _ = buf.write_char('\n');
        buf.flush();
    }

    fn flush(&self) {}
}

/// Install the logger at `level`. Harmless if some logger is already set
/// (the test harness's, for one), in which case only the level changes.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_err() {
        log::debug!("[logger] a logger is already installed");
    }
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_without_panicking_on_long_records() {
        let long = "x".repeat(2048);
        log::set_max_level(LevelFilter::Error);
        StderrLogger.log(
            &Record::builder()
                .level(log::Level::Error)
                .args(format_args!("{long}"))
                .build(),
        );
        let metadata = Metadata::builder().level(log::Level::Error).build();
        assert!(StderrLogger.enabled(&metadata));
    }
}
