//! Session logger: level-tagged lines mirrored to an optional file and an
//! in-memory ring of recent entries.
//!
//! The file sink is **truncated at each `init`**, so it only ever holds the
//! current session.  The ring keeps the last few hundred lines so a host (or
//! a test) can show what the engine reported without touching the disk.
//!
//! Usage: anywhere in the crate use the `log_info!` / `log_warn!` /
//! `log_err!` macros, or call `crate::logger::write(...)` directly.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default number of lines retained in memory.
pub const DEFAULT_RING_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn tag(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    /// Parse a settings value; unknown strings yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" | "err" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

struct Sink {
    min_level: LogLevel,
    file: Option<File>,
    path: Option<PathBuf>,
    recent: VecDeque<String>,
    capacity: usize,
}

impl Sink {
    fn new() -> Self {
        Self {
            min_level: LogLevel::Info,
            file: None,
            path: None,
            recent: VecDeque::with_capacity(DEFAULT_RING_CAPACITY),
            capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

static SINK: OnceLock<Mutex<Sink>> = OnceLock::new();

fn sink() -> &'static Mutex<Sink> {
    SINK.get_or_init(|| Mutex::new(Sink::new()))
}

/// Configure the logger.  `file` is created (or truncated); failure to open
/// it is reported once on stderr and otherwise ignored.
pub fn init(min_level: LogLevel, file: Option<&Path>) {
    let Ok(mut s) = sink().lock() else { return };
    s.min_level = min_level;
    s.file = None;
    s.path = None;

    if let Some(path) = file {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).write(true).truncate(true).open(path) {
            Ok(f) => {
                s.file = Some(f);
                s.path = Some(path.to_path_buf());
            }
            Err(e) => eprintln!("[logger] Failed to open log file {:?}: {}", path, e),
        }
    }

    let header = format!("=== stackpaint session started (unix {}) ===", unix_seconds());
    push_line(&mut s, header);
}

/// Returns the path of the active log file, if any.
pub fn log_path() -> Option<PathBuf> {
    sink().lock().ok().and_then(|s| s.path.clone())
}

/// Write a timestamped, level-tagged line.  Never fails the caller.
pub fn write(level: LogLevel, msg: &str) {
    let Ok(mut s) = sink().lock() else { return };
    if level < s.min_level {
        return;
    }
    let line = format!("[{}] [{}] {}", timestamp(), level.tag(), msg);
    push_line(&mut s, line);
}

fn push_line(s: &mut Sink, line: String) {
    if let Some(file) = s.file.as_mut() {
        let _ = writeln!(file, "{}", line);
    }
    if s.recent.len() == s.capacity {
        s.recent.pop_front();
    }
    s.recent.push_back(line);
}

/// Snapshot of the most recent lines, oldest first.
pub fn recent_lines() -> Vec<String> {
    sink()
        .lock()
        .map(|s| s.recent.iter().cloned().collect())
        .unwrap_or_default()
}

/// True if any retained line contains `needle`.
pub fn contains(needle: &str) -> bool {
    sink()
        .lock()
        .map(|s| s.recent.iter().any(|l| l.contains(needle)))
        .unwrap_or(false)
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::LogLevel::Info, &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::LogLevel::Warn, &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::LogLevel::Error, &format!($($arg)*));
    };
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// HH:MM:SS within the current UTC day.
fn timestamp() -> String {
    let secs = unix_seconds();
    format!("{:02}:{:02}:{:02}", (secs % 86400) / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parsing_is_lenient() {
        assert_eq!(LogLevel::parse(" Warning "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("ERR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn lines_reach_the_ring() {
        crate::log_warn!("ring probe {}", 42);
        assert!(contains("ring probe 42"));
        assert!(recent_lines().iter().any(|l| l.contains("[WARN]")));
    }
}
