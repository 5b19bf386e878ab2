//! Link errors

use thiserror::Error;

/// Connection-level failures. All of these affect the manager's state and
/// reconnection scheduling; per-line problems are reported separately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The port listing itself failed
    #[error("Port discovery failed: {0}")]
    DiscoveryFailed(String),

    /// Discovery returned no candidates
    #[error("No serial ports available")]
    NoPortsAvailable,

    /// The open did not finish within the timeout, in milliseconds
    #[error("Connection timeout after {0}ms")]
    OpenTimeout(u64),

    /// The backend refused to open the port
    #[error("Failed to open {path}: {reason}")]
    OpenFailed {
        /// Port path
        path: String,
        /// Backend error text
        reason: String,
    },

    /// The port closed without being asked to
    #[error("Connection lost: {0}")]
    UnintentionalClose(String),

    /// The reconnection cap was reached
    #[error("Max reconnection attempts reached ({0})")]
    MaxAttemptsExceeded(u32),

    /// A write was requested with no port held
    #[error("Port not connected")]
    NotConnected,

    /// Reading or writing the port failed
    #[error("Serial I/O error: {0}")]
    Io(String),

    /// The manager task has stopped
    #[error("Connection manager is closed")]
    ManagerClosed,
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::Io(e.to_string())
    }
}
