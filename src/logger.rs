//! Session log for map operations.
//!
//! One file per process, truncated when the session opens, so it only holds
//! the latest run. Every generator call, patch placement, removal and failed
//! image release ends up here.
//!
//! Default location:
//!   Windows:  `%APPDATA%\pixelmap\pixelmap.log`
//!   Linux:    `~/.local/share/pixelmap/pixelmap.log`
//!   macOS:    `~/Library/Application Support/pixelmap/pixelmap.log`
//!
//! Log through `log_info!` / `log_warn!` / `log_err!`. Until [`init`] or
//! [`init_at`] opens a session, lines are dropped (or only echoed), so the
//! library and its tests need no setup.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn label(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

struct Session {
    path: PathBuf,
    file: Mutex<File>,
}

static SESSION: OnceLock<Session> = OnceLock::new();
static ECHO: AtomicBool = AtomicBool::new(false);

/// Path of the open session log, if any.
pub fn log_path() -> Option<&'static Path> {
    SESSION.get().map(|s| s.path.as_path())
}

/// Mirror every line to stderr (CLI `--verbose`).
pub fn set_echo(enabled: bool) {
    ECHO.store(enabled, Ordering::Relaxed);
}

fn emit(line: &str) {
    if ECHO.load(Ordering::Relaxed) {
        eprintln!("{}", line);
    }
    if let Some(session) = SESSION.get()
        && let Ok(mut file) = session.file.lock()
    {
        // I/O errors are swallowed; logging never fails an operation.
        let _ = writeln!(file, "{}", line);
    }
}

/// `[HH:MM:SS.mmm] [LEVEL] message`
fn format_line(millis_since_epoch: u128, level: Level, msg: &str) -> String {
    let ms = millis_since_epoch % 1000;
    let secs = millis_since_epoch / 1000;
    format!(
        "[{:02}:{:02}:{:02}.{:03}] [{}] {}",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        ms,
        level.label(),
        msg
    )
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Timestamped, level-tagged line.
pub fn write(level: Level, msg: &str) {
    emit(&format_line(now_millis(), level, msg));
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Warn, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Error, &format!($($arg)*))
    };
}

/// Open the session log at the platform default location.
pub fn init() {
    init_at(&default_log_path());
}

/// Open the session log at `path`. Later calls are ignored.
///
/// The file is created or truncated, a session header is written, and a
/// panic hook is chained in front of the existing one so panics reach the
/// log too.
pub fn init_at(path: &Path) {
    if SESSION.get().is_some() {
        return;
    }
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let file = match OpenOptions::new().create(true).write(true).truncate(true).open(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("[logger] cannot open {}: {}", path.display(), e);
            return;
        }
    };
    let session = Session {
        path: path.to_path_buf(),
        file: Mutex::new(file),
    };
    if SESSION.set(session).is_err() {
        return;
    }

    let started = now_millis() / 1000;
    emit(&format!("=== pixelmap {} session (unix {}) ===", env!("CARGO_PKG_VERSION"), started));
    emit(&format!("log: {}", path.display()));

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        emit(&format_line(now_millis(), Level::Error, &format!("panic: {}", info)));
        prev(info);
    }));
}

fn default_log_path() -> PathBuf {
    data_dir().join("pixelmap").join("pixelmap.log")
}

/// Platform data directory, without the app folder.
fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(appdata) = std::env::var("APPDATA") {
        return PathBuf::from(appdata);
    }
    #[cfg(target_os = "macos")]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join("Library").join("Application Support");
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".local").join("share")))
        .unwrap_or_else(|_| PathBuf::from("."))
}
