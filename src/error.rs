//! Error types for pty spawning and session management.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    /// A caller-supplied option failed value validation. Always recoverable
    /// by correcting the input; never raised by the native layer.
    #[error("invalid option `{field}`: expected {expected}, got {actual}")]
    InvalidOption {
        field: &'static str,
        expected: &'static str,
        actual: String,
    },

    /// Geometry passed to a constructor or `resize` was unusable.
    #[error("invalid geometry {cols}x{rows}: cols and rows must be non-zero")]
    InvalidGeometry { cols: u16, rows: u16 },

    /// The operation has no meaning on this platform (e.g. sending a POSIX
    /// signal to a Windows process).
    #[error("{0} is not supported on this platform")]
    UnsupportedPlatform(&'static str),

    /// The native pty backend could not be loaded or does not exist on this
    /// host. Surfaced explicitly instead of falling back silently.
    #[error("native pty backend unavailable: {0}")]
    NativeUnavailable(String),

    /// The native layer failed to start the requested process.
    #[error("failed to spawn `{file}`: {source}")]
    Spawn {
        file: String,
        #[source]
        source: io::Error,
    },

    /// Resize was requested for a process that already exited.
    #[error("cannot resize: process has already exited")]
    AlreadyExited,

    #[error("pty I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PtyError>;
