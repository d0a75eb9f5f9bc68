//! Error types for sidecall.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Companion process could not be created (missing executable or entry
    /// script, OS refused to fork/exec). Fatal to the bridge instance.
    #[error("failed to spawn companion `{program}`: {source}")]
    Spawn {
        /// The program that was being spawned.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Malformed or undecodable wire message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote function raised. The process remains usable.
    #[error("companion error: {message}")]
    Companion {
        /// Message reported by the companion.
        message: String,
        /// Companion-side stack trace, when provided.
        stack: Option<String>,
        /// Whatever the companion wrote to its error stream.
        stderr: Option<String>,
    },

    /// Companion exited or closed its output stream mid-call.
    /// The bridge transitions to closed; no further calls will succeed.
    #[error("companion closed its output stream mid-call")]
    StreamClosed {
        /// Whatever the companion wrote to its error stream.
        stderr: Option<String>,
    },

    /// Call attempted after the bridge was closed.
    #[error("bridge is closed")]
    Closed,

    /// Invocation of an operation that was never registered.
    #[error("no operation named `{0}` is registered")]
    UnknownOperation(String),

    /// Call exceeded its deadline. The companion is terminated as part of
    /// handling this, and the bridge transitions to closed.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error on the companion's streams.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;
