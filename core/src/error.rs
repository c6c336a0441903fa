//! Error types for sandbox lifecycle operations.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for sandbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Workspace or version-control command failed.
    #[error("failed to provision workspace: {0}")]
    Provisioning(String),

    /// No free port left in the scanned range.
    #[error("no free port in range starting at {start} (size {size})")]
    ResourceExhausted { start: u16, size: u16 },

    /// The OS could not create the worker process.
    #[error("failed to launch worker process: {0}")]
    Launch(String),

    /// Worker exited before or during the readiness wait.
    #[error("worker process exited before becoming ready (exit code {exit_code:?})")]
    Disconnected {
        exit_code: Option<i32>,
        /// Set when one of the worker's ports was taken by another process.
        port_contended: bool,
    },

    /// Readiness budget exhausted while the worker was still alive.
    #[error("worker did not become ready within {0:?}")]
    Timeout(Duration),

    /// Lifecycle operation called from a state that forbids it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Sandbox id outside the accepted alphabet or length.
    #[error("invalid sandbox id: {0}")]
    InvalidSandboxId(String),

    /// Unknown sandbox, spec, or workspace file.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation this backend does not provide.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Path escapes the sandbox workspace.
    #[error("invalid sandbox path: {0}")]
    InvalidPath(PathBuf),

    /// IO error during sandbox operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true when a fresh launch with new ports may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Disconnected {
                port_contended: true,
                ..
            }
        )
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;
