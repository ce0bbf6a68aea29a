use anyhow::{Context, Result};
use chrono::Local;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

lazy_static! {
    static ref LOG_FILE: Mutex<Option<File>> = Mutex::new(None);
}

fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("querydeck")
        .join("logs")
}

/// Opens a fresh timestamped log file. Until this is called every logging
/// function is a no-op, which keeps library consumers and tests quiet.
pub fn init_logger() -> Result<()> {
    init_logger_in(&default_log_dir()).map(|_| ())
}

/// Starts logging to a new file under `log_dir` and returns its path.
pub fn init_logger_in(log_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(log_dir).context("Failed to create log directory")?;

    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let path = log_dir.join(format!("querydeck_{}.log", timestamp));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .context("Failed to create log file")?;

    *LOG_FILE.lock() = Some(file);
    Ok(path)
}

pub fn log(level: LogLevel, message: &str) {
    let mut guard = LOG_FILE.lock();
    let Some(file) = guard.as_mut() else {
        return;
    };
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let entry = format!("[{}] {} - {}\n", timestamp, level.as_str(), message);
    if let Err(e) = file.write_all(entry.as_bytes()).and_then(|_| file.flush()) {
        eprintln!("Failed to write to log file: {}", e);
    }
}

pub fn debug(message: &str) {
    log(LogLevel::Debug, message)
}

pub fn info(message: &str) {
    log(LogLevel::Info, message)
}

pub fn warn(message: &str) {
    log(LogLevel::Warning, message)
}

pub fn error(message: &str) {
    log(LogLevel::Error, message)
}

/// Errors that must reach the user without interrupting the session.
pub fn handle_non_critical_error(err: &dyn std::error::Error) {
    error(&format!("{}", err));
}
