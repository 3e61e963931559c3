//! Tracing configuration and log routing.
//!
//! Console logs go to stderr so command output on stdout stays pipeable. Every run also writes a
//! plain-text log file, because per-task failures of the consumer are reported nowhere else:
//! `RUSTY_DIGEST_LOG_FILE` appends to one fixed file, otherwise a daily-rolling file is kept in
//! `RUSTY_DIGEST_LOG_DIR` (default `logs/`).
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_DIR: &str = "logs";
const LOG_FILE_PREFIX: &str = "rusty-digest.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Where the file layer writes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogTarget {
    /// Append to a single file.
    File(PathBuf),
    /// Roll daily inside a directory.
    Daily(PathBuf),
}

impl LogTarget {
    fn resolve(file: Option<String>, dir: Option<String>) -> Self {
        match (file, dir) {
            (Some(file), _) if !file.trim().is_empty() => Self::File(PathBuf::from(file)),
            (_, Some(dir)) if !dir.trim().is_empty() => Self::Daily(PathBuf::from(dir)),
            _ => Self::Daily(PathBuf::from(DEFAULT_LOG_DIR)),
        }
    }

    fn from_env() -> Self {
        Self::resolve(
            std::env::var("RUSTY_DIGEST_LOG_FILE").ok(),
            std::env::var("RUSTY_DIGEST_LOG_DIR").ok(),
        )
    }
}

/// Install the global subscriber: `RUST_LOG` filtering (default `info`), a compact stderr layer
/// and, when the target can be opened, a file layer with targets and without ANSI colors.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    match file_writer(&LogTarget::from_env()) {
        Some(writer) => {
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .compact();
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }
}

fn file_writer(target: &LogTarget) -> Option<NonBlocking> {
    let (non_blocking, guard) = match target {
        LogTarget::File(path) => {
            ensure_parent(path)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| eprintln!("Failed to open log file {}: {err}", path.display()))
                .ok()?;
            tracing_appender::non_blocking(file)
        }
        LogTarget::Daily(dir) => {
            if let Err(err) = std::fs::create_dir_all(dir) {
                eprintln!("Failed to create log directory {}: {err}", dir.display());
                return None;
            }
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX))
        }
    };
    let _ = LOG_GUARD.set(guard);
    Some(non_blocking)
}

fn ensure_parent(path: &Path) -> Option<()> {
    match path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        Some(parent) => std::fs::create_dir_all(parent)
            .map_err(|err| eprintln!("Failed to create log directory {}: {err}", parent.display()))
            .ok(),
        None => Some(()),
    }
}
