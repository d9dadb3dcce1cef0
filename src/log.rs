//! Run log for conflux invocations.
//!
//! Log levels:
//! - ERROR: Failures that abort an analysis or merge
//! - WARN: Recoverable conditions (cycles, unresolved conflicts, rollbacks)
//! - INFO: One line per analyzer/detector/coordinator invocation
//! - DEBUG: Ordering decisions, staging writes, verification commands
//! - TRACE: Per-pair conflict checks and captured verification output
//!
//! Every line is tagged with the running subcommand, so one log file can hold
//! an analyze, detect and merge of the same orchestration cycle side by side.
//! Nothing is written until [`init`] has run; library callers and tests never
//! touch the filesystem through the logger.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static SINK: OnceLock<Sink> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

struct Sink {
    path: PathBuf,
    context: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "1" | "true" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Level requested through the environment.
///
/// `CONFLUX_LOG=<level>` wins over `CONFLUX_DEBUG=1|true`.
fn env_level() -> Option<LogLevel> {
    if let Some(level) = std::env::var("CONFLUX_LOG")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        return Some(level);
    }
    std::env::var("CONFLUX_DEBUG")
        .ok()
        .filter(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .map(|_| LogLevel::Debug)
}

/// Default log file: `~/.conflux/conflux.log`.
pub fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".conflux").join("conflux.log"))
}

/// Start logging `context` (the subcommand name) to the default log file.
///
/// `--debug` raises the level to DEBUG unless the environment asks for more.
pub fn init(context: &str, debug: bool) {
    let requested = env_level().unwrap_or(LogLevel::Info);
    let level = if debug {
        requested.max(LogLevel::Debug)
    } else {
        requested
    };
    set_level(level);

    if let Some(path) = default_path() {
        init_at(&path, context);
    }
}

/// Start logging to `path`, truncating it.
pub fn init_at(path: &Path, context: &str) {
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    let _ = std::fs::write(path, "");
    let _ = SINK.set(Sink {
        path: path.to_path_buf(),
        context: context.to_string(),
    });
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Whether a message at `level` would be written.
pub fn enabled(level: LogLevel) -> bool {
    SINK.get().is_some() && level <= self::level()
}

pub fn is_debug() -> bool {
    level() >= LogLevel::Debug
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > self::level() {
        return;
    }
    let Some(sink) = SINK.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&sink.path) {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let _ = writeln!(
            file,
            "[{}] [{}] [{}] {}",
            timestamp,
            level.as_str(),
            sink.context,
            msg
        );
    }
}

/// Log at an explicit level; the message is only formatted when enabled.
#[macro_export]
macro_rules! cxlog_at {
    ($level:expr, $($arg:tt)*) => {
        if $crate::log::enabled($level) {
            $crate::log::log_at($level, &format!($($arg)*))
        }
    };
}

/// Log macro for INFO level.
#[macro_export]
macro_rules! cxlog {
    ($($arg:tt)*) => {
        $crate::cxlog_at!($crate::log::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! cxlog_error {
    ($($arg:tt)*) => {
        $crate::cxlog_at!($crate::log::LogLevel::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! cxlog_warn {
    ($($arg:tt)*) => {
        $crate::cxlog_at!($crate::log::LogLevel::Warn, $($arg)*)
    };
}

/// Log macro for DEBUG level (only logs when debug mode is enabled).
#[macro_export]
macro_rules! cxlog_debug {
    ($($arg:tt)*) => {
        $crate::cxlog_at!($crate::log::LogLevel::Debug, $($arg)*)
    };
}

#[macro_export]
macro_rules! cxlog_trace {
    ($($arg:tt)*) => {
        $crate::cxlog_at!($crate::log::LogLevel::Trace, $($arg)*)
    };
}
