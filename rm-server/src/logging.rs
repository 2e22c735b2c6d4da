//! Server Logging
//!
//! Backend for the `log` facade.
//!
//! # Log Output
//!
//! Log messages are written to:
//! 1. A bounded ring of recent records (drained by the host integration)
//! 2. stderr, with coloured levels, while console echo is enabled
//!
//! The level comes from the `RM_LOG` environment variable when
//! [`init_from_env`] is used (`error`, `warn`, `info`, `debug`, `trace`,
//! `off`).

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

/// Records kept in the ring before the oldest is dropped.
pub const LOG_RING_CAPACITY: usize = 512;

/// Environment variable naming the log level.
pub const LOG_ENV: &str = "RM_LOG";

/// One captured record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Milliseconds since the logger started.
    pub time_ms: u64,
    /// Record level.
    pub level: Level,
    /// Module path the record came from.
    pub target: String,
    /// Formatted message.
    pub message: String,
}

struct ServerLogger {
    ring: Mutex<VecDeque<LogEntry>>,
    console: AtomicBool,
}

impl Log for ServerLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let time_ms = elapsed_ms();
        let entry = LogEntry {
            time_ms,
            level: record.level(),
            target: record.target().to_owned(),
            message: record.args().to_string(),
        };

        if self.console.load(Ordering::Relaxed) {
            let level_str = match entry.level {
                Level::Error => "\x1b[31mERROR\x1b[0m",
                Level::Warn => "\x1b[33m WARN\x1b[0m",
                Level::Info => "\x1b[32m INFO\x1b[0m",
                Level::Debug => "\x1b[34mDEBUG\x1b[0m",
                Level::Trace => "\x1b[35mTRACE\x1b[0m",
            };
            let _ = writeln!(
                std::io::stderr().lock(),
                "[{:>8}.{:03}] {} {}: {}",
                time_ms / 1000,
                time_ms % 1000,
                level_str,
                entry.target,
                entry.message
            );
        }

        let mut ring = self.ring.lock();
        if ring.len() == LOG_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: ServerLogger = ServerLogger {
    ring: Mutex::new(VecDeque::new()),
    console: AtomicBool::new(true),
};

static START: Once<Instant> = Once::new();

fn elapsed_ms() -> u64 {
    let start = START.call_once(Instant::now);
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Install the logger at `level`.
///
/// A second call only adjusts the level.
pub fn init(level: LevelFilter) {
    START.call_once(Instant::now);
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(level))
        .ok();
    log::set_max_level(level);
}

/// Install the logger at the level named by `RM_LOG`, or `default`.
pub fn init_from_env(default: LevelFilter) {
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|value| parse_level(&value))
        .unwrap_or(default);
    init(level);
}

/// Parse a level name.
#[must_use]
pub fn parse_level(value: &str) -> Option<LevelFilter> {
    value.trim().parse().ok()
}

/// Enable or disable stderr echo.
pub fn set_console(enabled: bool) {
    LOGGER.console.store(enabled, Ordering::Relaxed);
}

/// Take every buffered record, oldest first.
#[must_use]
pub fn drain() -> Vec<LogEntry> {
    LOGGER.ring.lock().drain(..).collect()
}
