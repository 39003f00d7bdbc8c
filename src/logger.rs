use std::fs::{File, OpenOptions};
use std::io::{stderr, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;

use anyhow::Result;
use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

static WARDEN_LOGGER: OnceCell<WardenLogger> = OnceCell::new();
static LOG_FILE: OnceCell<Option<File>> = OnceCell::new();

/// Initialize the process-wide logger. With a path, lines go to that file
/// (append mode, so restarts do not clobber history); without one they go to
/// stderr.
pub fn init(log_file: Option<PathBuf>, verbose: bool) -> Result<()> {
    let _ = LOG_FILE.get_or_init(|| {
        log_file.and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| eprintln!("failed to open log file: {:?}", e))
                .ok()
        })
    });

    let level_filter = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let logger = WARDEN_LOGGER.get_or_init(|| WardenLogger {
        level: level_filter.to_level(),
    });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(level_filter);
    }

    Ok(())
}

/// The open log fd, if logging goes to a file. The spawn path must keep this
/// fd alive when it closes everything else.
pub fn log_fd() -> Option<RawFd> {
    LOG_FILE
        .get()
        .and_then(|f| f.as_ref())
        .map(|f| f.as_raw_fd())
}

struct WardenLogger {
    level: Option<Level>,
}

impl Log for WardenLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.level.map(|l| metadata.level() <= l).unwrap_or(false)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format!(
            "{} {:<5} [{}] {}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        );
        if let Some(Some(mut file)) = LOG_FILE.get().map(|f| f.as_ref()) {
            let _ = writeln!(file, "{}", line);
        } else {
            let _ = writeln!(stderr(), "{}", line);
        }
    }

    fn flush(&self) {
        if let Some(Some(mut file)) = LOG_FILE.get().map(|f| f.as_ref()) {
            let _ = file.flush();
        } else {
            let _ = stderr().flush();
        }
    }
}
