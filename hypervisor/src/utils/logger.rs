use crate::utils::nt::{DbgPrint, KeGetCurrentIrql, DISPATCH_LEVEL};
use alloc::format;
use log::{LevelFilter, Metadata, Record, SetLoggerError};

/// Prints to the kernel debugger.
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        // Formatting allocates.
        //
        metadata.level() <= log::max_level() && unsafe { KeGetCurrentIrql() } <= DISPATCH_LEVEL
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let message = format!("{} - {}\n\0", record.level(), record.args());

            unsafe { DbgPrint("%s\0".as_ptr(), message.as_ptr()) };
        }
    }

    fn flush(&self) {}
}

pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER).map(|()| log::set_max_level(level))
}
