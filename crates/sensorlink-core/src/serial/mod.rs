//! Serial Link Management
//!
//! Discovers the sensor's port, holds the connection, and recovers from
//! unplugs and port renumbering.
//!
//! The [`ConnectionManager`] is a handle to a single task that owns the port,
//! the state machine and every timer. Hardware events, timer firings and
//! control commands all pass through that task's mailbox, so transitions never
//! overlap.

mod codec;
mod discovery;
mod error;
mod manager;
mod transport;

pub use codec::LineCodec;
pub use discovery::{is_known_device, list_ports, select_best, PortInfo, Selection};
pub use error::LinkError;
pub use manager::{ConnectionManager, ConnectionState, LinkStatus, PortStatus};
pub use transport::{SerialBackend, SerialIo, SystemSerial};

/// Substrings of the USB manufacturer string that identify sensor boards
pub const KNOWN_MANUFACTURERS: &[&str] = &[
    "arduino",
    "esp32",
    "silicon labs",
    "ch340",
    "ftdi",
    "prolific",
];

/// USB vendor ids of common USB-serial bridges
pub const KNOWN_VENDOR_IDS: &[u16] = &[
    0x10C4, // Silicon Labs CP210x
    0x1A86, // WCH CH340
    0x0403, // FTDI
    0x2341, // Arduino
];

/// Longest line accepted before the reader gives up on finding a delimiter
pub const MAX_LINE_LENGTH: usize = 64 * 1024;
