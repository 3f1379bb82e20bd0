use core::sync::atomic::{AtomicBool, Ordering};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Writes log records to the UEFI console.
///
/// The console belongs to the kernel once it is entered, so the logger is
/// muted right before handover.
pub struct UefiLogger {
    max_level: LevelFilter,
    console: AtomicBool,
}

impl UefiLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self {
            max_level,
            console: AtomicBool::new(true),
        }
    }

    /// Installs this logger. Call once during early init.
    ///
    /// # Errors
    /// If a logger is already installed.
    pub fn init(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }

    /// Stops console output.
    pub fn mute(&self) {
        self.console.store(false, Ordering::Release);
    }

    /// Resumes console output after a handover came back.
    pub fn unmute(&self) {
        self.console.store(true, Ordering::Release);
    }
}

impl Log for UefiLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level && self.console.load(Ordering::Acquire)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        uefi::println!(
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}
