//! Notifications emitted by the connection manager
//!
//! The manager never talks to a UI directly. Everything observable is pushed
//! through an [`EventSink`], which may forward to a window, an IPC bridge, a
//! channel or the log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::serial::ConnectionState;

/// Progress of the reconnection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectStatus {
    /// An attempt is armed and will fire after the configured delay
    Scheduled,
    /// The timer fired and an attempt is starting
    Attempting,
    /// The attempt cap was hit; nothing further is scheduled
    MaxAttemptsReached,
    /// An operator forced a fresh reconnection
    ManualReconnectStarted,
}

/// Everything the manager reports to the outside
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LinkEvent {
    /// Connection state changed
    Status {
        /// New state
        state: ConnectionState,
        /// Human-readable reason for the change
        message: String,
        /// When the change happened
        timestamp: DateTime<Utc>,
    },
    /// A recognised device port appeared while on a fallback port
    #[serde(rename_all = "camelCase")]
    BetterPortDetected {
        /// Port currently held, if any
        current_port: Option<String>,
        /// The recognised port that was found
        new_port: String,
        /// When the scan found it
        timestamp: DateTime<Utc>,
    },
    /// The manager moved to a different port
    #[serde(rename_all = "camelCase")]
    PortSwitched {
        /// Port released by the switch
        old_port: Option<String>,
        /// Port now held
        new_port: String,
        /// When the new port opened
        timestamp: DateTime<Utc>,
    },
    /// The device closed the port without being asked to
    #[serde(rename_all = "camelCase")]
    ConnectionLost {
        /// Port that closed
        port: String,
        /// Attempts already used when the port closed
        reconnect_attempts: u32,
        /// When the close was observed
        timestamp: DateTime<Utc>,
    },
    /// Reconnection policy progress
    #[serde(rename_all = "camelCase")]
    Reconnect {
        /// Where the policy is
        status: ReconnectStatus,
        /// Attempts used so far
        attempts: u32,
        /// Configured attempt cap
        max_attempts: u32,
        /// Delay before the scheduled attempt fires
        #[serde(skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
    },
    /// A non-blank line arrived
    DataReceived {
        /// The line, trimmed
        raw: String,
        /// Port it arrived on
        port: Option<String>,
        /// Arrival time
        timestamp: DateTime<Utc>,
    },
    /// A payload was written to the device
    DataSent {
        /// Payload without the trailing newline
        data: String,
        /// Port it was written to
        port: Option<String>,
        /// When the write completed
        timestamp: DateTime<Utc>,
    },
    /// No data has arrived for longer than the silence threshold
    #[serde(rename_all = "camelCase")]
    HealthWarning {
        /// Time since the last line
        silent_for_ms: u64,
        /// Port that went quiet
        port: Option<String>,
    },
    /// A record was dropped for missing a required field
    RecordSkipped {
        /// First required field that was absent or empty
        missing_field: String,
    },
    /// A record was stored
    #[serde(rename_all = "camelCase")]
    Stored {
        /// Destination table
        table: String,
        /// Identifier the store assigned
        insert_id: String,
        /// Port the record came from
        port: Option<String>,
    },
    /// Storage rejected a record
    StoreFailed {
        /// Destination table
        table: String,
        /// Why the record was not stored
        message: String,
    },
    /// Any other failure worth surfacing
    Error {
        /// Description of the failure
        message: String,
    },
}

impl LinkEvent {
    pub(crate) fn status(state: ConnectionState, message: impl Into<String>) -> Self {
        LinkEvent::Status {
            state,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn error(message: impl Into<String>) -> Self {
        LinkEvent::Error {
            message: message.into(),
        }
    }
}

/// Receiver of manager notifications.
///
/// Called from the manager task; implementations must not block.
pub trait EventSink: Send + Sync {
    /// Deliver one event
    fn notify(&self, event: LinkEvent);
}

impl<F> EventSink for F
where
    F: Fn(LinkEvent) + Send + Sync,
{
    fn notify(&self, event: LinkEvent) {
        self(event)
    }
}

/// Forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver that observes it
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn notify(&self, event: LinkEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

/// Writes every event to the `tracing` log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn notify(&self, event: LinkEvent) {
        match &event {
            LinkEvent::Error { message } => tracing::error!("{message}"),
            LinkEvent::StoreFailed { table, message } => {
                tracing::error!("store into {table} failed: {message}")
            }
            LinkEvent::HealthWarning { silent_for_ms, .. } => {
                tracing::warn!("no data received for {}s", silent_for_ms / 1000)
            }
            LinkEvent::DataReceived { raw, .. } => tracing::debug!("serial raw: {raw}"),
            other => match serde_json::to_string(other) {
                Ok(json) => tracing::info!("{json}"),
                Err(_) => tracing::info!("{other:?}"),
            },
        }
    }
}
