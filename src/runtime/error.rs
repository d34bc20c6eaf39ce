//! Error types for the sequence runtime
//!
//! Domain errors use thiserror; configuration and file IO use anyhow at the
//! storage boundary.

use thiserror::Error;

use crate::sequence::Diagnostics;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Sequence failed to parse
    #[error(transparent)]
    Sequence(#[from] Diagnostics),

    /// Device already executing a run
    #[error("device {0} is busy")]
    DeviceBusy(String),

    /// No device registered under the id
    #[error("device {0} not found")]
    UnknownDevice(String),

    /// Field-protocol failure; fatal to the run
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A sensor did not confirm arrival within the configured bound
    #[error("sensor {tag} did not report within {waited_ms} ms")]
    SensorTimeout {
        /// Sensor tag being polled
        tag: String,
        /// Time spent waiting
        waited_ms: u64,
    },

    /// Sequence contains something the runtime cannot execute
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Spawned run task failed to complete
    #[error("run task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Errors raised by field-protocol operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Endpoint could not be reached
    #[error("failed to connect to {endpoint}: {detail}")]
    Connect {
        /// Endpoint URL
        endpoint: String,
        /// Failure detail
        detail: String,
    },

    /// Session could not be opened or closed
    #[error("session error: {0}")]
    Session(String),

    /// Combined write rejected
    #[error("write failed: {0}")]
    Write(String),

    /// Read rejected
    #[error("read of {tag} failed: {detail}")]
    Read {
        /// Tag being read
        tag: String,
        /// Failure detail
        detail: String,
    },

    /// Tag not present on the device
    #[error("unknown tag {0}")]
    UnknownTag(String),

    /// Tag held a value of the wrong type
    #[error("tag {tag} is not {expected}")]
    TypeMismatch {
        /// Tag being read
        tag: String,
        /// Expected type name
        expected: &'static str,
    },
}

/// Convenience result alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Convenience result alias for protocol operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

impl RuntimeError {
    /// Whether the error rejected the request before any session was opened.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RuntimeError::Sequence(_)
                | RuntimeError::DeviceBusy(_)
                | RuntimeError::UnknownDevice(_)
                | RuntimeError::Unsupported(_)
        )
    }
}
