//! Error-log initialization
//!
//! Structured logging goes through `tracing`; the subscriber writes either
//! to the configured error log file or to stderr. `RUST_LOG` overrides the
//! configured level when set, which keeps ad-hoc debugging cheap.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Installs the global subscriber. Called once per process; workers call it
/// again after fork, which is a no-op because the parent already installed
/// one before forking.
pub fn init(cfg: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.level.as_filter()));

    let file = if cfg.error_log.as_os_str().is_empty() {
        None
    } else {
        open_log_file(&cfg.error_log)
    };

    let result = match file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .try_init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };

    // A second init happens in tests and in-process workers; ignore it.
    let _ = result;
}

fn open_log_file(path: &Path) -> Option<std::fs::File> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("cannot open error log {}: {e}", path.display());
            None
        }
    }
}
