//! A logging implementation that writes every record to the kernel console
use core::fmt::Write;

use crate::print::KernelWriter;
use log::{Level, Log, Metadata, Record, SetLoggerError};

// Updating the level only touches the global log:: filter so that the logger itself can stay immutable and be
// placed in a plain `static`.

pub struct KernelLogger {
    pub initial_log_level: Level,
}

impl KernelLogger {
    pub const fn new(max_log_level: Level) -> KernelLogger {
        KernelLogger {
            initial_log_level: max_log_level,
        }
    }

    pub fn install(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self).map(|_| log::set_max_level(self.initial_log_level.to_level_filter()))
    }

    pub fn update_log_level(&'static self, level: Level) {
        log::set_max_level(level.to_level_filter());
    }
}

fn level_glyph(level: Level) -> &'static str {
    match level {
        Level::Error => "E",
        Level::Warn => "W",
        Level::Info => "I",
        Level::Debug => "D",
        Level::Trace => "T",
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            // a console that cannot be written to has nowhere to report that either
            let _ = KernelWriter {}.write_fmt(format_args!(
                "[{}] {}: {}\n",
                level_glyph(record.level()),
                record.target(),
                record.args(),
            ));
        }
    }

    fn flush(&self) {}
}
