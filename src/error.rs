//! Crate-level error type

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced at the crate boundary. Per-connection I/O conditions
/// (would-block, peer-closed) are not errors and are reported by
/// [`crate::net::buffer::FdIo`] instead.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error during socket or file operations
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Configuration file could not be read or contains invalid values
    #[error("config error: {0}")]
    Config(String),

    /// Listener socket creation or bind failed
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound
        addr: String,
        /// The underlying socket error
        source: io::Error,
    },

    /// TLS context could not be built from the configured cert/key
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate or key file missing or unparseable
    #[error("cannot load {path}: {reason}")]
    TlsMaterial {
        /// Path of the offending PEM file
        path: PathBuf,
        /// What went wrong with it
        reason: String,
    },

    /// fork/waitpid/signal syscall failure in the master
    #[error("process error: {0}")]
    Process(#[from] nix::errno::Errno),
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
