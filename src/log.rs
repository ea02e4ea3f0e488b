//! Structured logging for the orchestrator.
//!
//! Log levels:
//! - ERROR: Failed undo, abandoned reconnection, failed task callbacks
//! - WARN: Lost devices, rejected registrations, dropped frames
//! - INFO: Connections, dispatches, executed commands
//! - DEBUG: Per-frame and per-probe traces
//!
//! `RUST_LOG` always wins. Otherwise debug mode is enabled with the
//! `--debug` flag or `CONSTELLATION_DEBUG=1`, and the default level is INFO.
//! Output goes to ~/.constellation/constellation.log, truncated on startup,
//! or to stderr when there is no home directory.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::EnvFilter;

pub const DEBUG_ENV: &str = "CONSTELLATION_DEBUG";

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging at INFO unless the environment asks for more.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Only the first call installs a subscriber; later calls are no-ops.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = make_filter(debug_enabled);
    let file = log_file();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let _ = match file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Where log output goes, if logging to a file.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn fallback_level(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

fn make_filter(debug: bool) -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::from_default_env(),
        _ => EnvFilter::try_new(fallback_level(debug)).unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

fn log_file() -> Option<File> {
    let dir = dirs::home_dir()?.join(".constellation");
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("constellation.log");
    // Truncate file on startup
    let file = File::create(&path).ok()?;
    LOG_PATH.set(path).ok();
    Some(file)
}
