//! Error types for command execution

use std::time::Duration;
use thiserror::Error;

/// Unified error type for command execution
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to spawn a process
    #[error("failed to spawn process: {reason}")]
    SpawnFailed {
        /// The reason for the spawn failure
        reason: String,
    },

    /// Command not found
    #[error("command not found: {command}")]
    CommandNotFound {
        /// The command that was not found
        command: String,
    },

    /// The command ran past its deadline and was killed
    #[error("command timed out after {}s: {command}", timeout.as_secs())]
    Timeout {
        /// The command line that timed out
        command: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// A scripted runner had no response for a command
    #[error("no scripted response for: {command}")]
    Unscripted {
        /// The command line that had no response
        command: String,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a spawn failed error
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
