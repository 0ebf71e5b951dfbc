//! Error types for the Conflux execution layer.
//!
//! Every operation in this crate reports failures through the single
//! [`Error`] enum. Task-level failures are stored on their future and only
//! surface when the outcome is retrieved; pool-level failures abort the call
//! that hit them.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Root error type for the execution layer.
#[derive(Debug, Error)]
pub enum Error {
    /// A worker-executed callable panicked; carries the panic message
    #[error("task failed: {0}")]
    TaskFailure(String),

    /// The worker that owned the task went away before reporting an outcome
    #[error("task {id} was lost before it completed")]
    TaskLost {
        /// Submission index of the lost task
        id: usize,
    },

    /// A subprocess did not finish in time and was killed
    #[error("command `{command}` timed out after {after:?}")]
    Timeout {
        /// The command as it was invoked
        command: String,
        /// The timeout that elapsed
        after: Duration,
    },

    /// A subprocess could not be started
    #[error("failed to launch `{command}`: {source}")]
    LaunchFailure {
        /// The command as it was invoked
        command: String,
        /// The underlying OS error
        #[source]
        source: io::Error,
    },

    /// A subprocess exited with a non-zero code (see `ProcessResult::check`)
    #[error("command `{command}` exited with code {code}")]
    NonZeroExit {
        /// The command as it was invoked
        command: String,
        /// The exit code reported by the process
        code: i32,
    },

    /// An operation was attempted against a resource in the wrong state
    #[error("invalid state: {0}")]
    PoolState(String),

    /// The supplied configuration cannot be used
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A value could not cross the process boundary
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The requested backend is not available on this platform
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "<unknown panic>".to_string()
    }
}

/// Run `f`, turning a panic into [`Error::TaskFailure`].
pub(crate) fn catch_task<R>(f: impl FnOnce() -> R) -> Result<R> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
        .map_err(|payload| Error::TaskFailure(panic_message(payload.as_ref())))
}
