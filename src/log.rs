//! Run log for planwright.
//!
//! One file per invocation at `~/.planwright/planwright.log`, truncated when
//! the CLI starts. What goes where:
//! - ERROR: the run moved to `Failed` (malformed spec, cycle, invalid batch)
//! - WARN: a batch halted, a retry was scheduled, context went over budget
//! - INFO: phase transitions, dispatches, verified batches
//! - DEBUG: parser, decomposer, graph and checkpoint details
//! - TRACE: full prompts and executor output
//!
//! `PLANWRIGHT_LOG=<level>` picks the level outright. Otherwise `--debug` or
//! `PLANWRIGHT_DEBUG=1` selects DEBUG and the default is INFO. Before
//! `init_with_debug` runs nothing is written, so library users and tests
//! never touch the home directory.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

struct Sink {
    path: PathBuf,
    file: Mutex<File>,
}

static SINK: OnceLock<Sink> = OnceLock::new();
static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

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
    const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn current() -> Self {
        let raw = LEVEL.load(Ordering::Relaxed) as usize;
        Self::ALL[raw.min(Self::ALL.len() - 1)]
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown log level '{}'", s))
    }
}

/// Level chosen from `PLANWRIGHT_LOG`, then the debug switches.
fn resolve_level(debug: bool, level_var: Option<&str>, debug_var: Option<&str>) -> LogLevel {
    if let Some(level) = level_var.and_then(|v| v.parse().ok()) {
        return level;
    }
    let env_debug = debug_var.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Open (and truncate) the run log. Later calls only adjust the level.
pub fn init_with_debug(debug: bool) {
    let level = resolve_level(
        debug,
        std::env::var("PLANWRIGHT_LOG").ok().as_deref(),
        std::env::var("PLANWRIGHT_DEBUG").ok().as_deref(),
    );
    LEVEL.store(level as u8, Ordering::SeqCst);

    if SINK.get().is_some() {
        return;
    }
    let Some(dir) = dirs::home_dir().map(|h| h.join(".planwright")) else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let path = dir.join("planwright.log");
    if let Ok(file) = File::create(&path) {
        let _ = SINK.set(Sink {
            path,
            file: Mutex::new(file),
        });
    }
}

/// Path of the run log once initialized.
pub fn log_path() -> Option<&'static PathBuf> {
    SINK.get().map(|sink| &sink.path)
}

pub fn enabled(level: LogLevel) -> bool {
    level <= LogLevel::current()
}

/// Append one line. Lines from concurrent tasks never interleave.
pub fn log_at(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(sink) = SINK.get() else {
        return;
    };
    if let Ok(mut file) = sink.file.lock() {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _ = writeln!(file, "{} {:<5} {}", timestamp, level.as_str(), msg);
    }
}

#[macro_export]
macro_rules! pwlog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! pwlog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! pwlog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

/// Skips formatting entirely unless DEBUG is enabled.
#[macro_export]
macro_rules! pwlog_debug {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Debug) {
            $crate::log::log_at($crate::log::LogLevel::Debug, &format!($($arg)*))
        }
    };
}

/// Skips formatting entirely unless TRACE is enabled; prompts are large.
#[macro_export]
macro_rules! pwlog_trace {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Trace) {
            $crate::log::log_at($crate::log::LogLevel::Trace, &format!($($arg)*))
        }
    };
}
