//! # SensorLink Core Library
//!
//! Keeps a sensor device reachable over a serial port whose path may change
//! between plug-ins, and turns the device's line-oriented output into records.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Serial port discovery ranked by known USB-serial bridge signatures
//! - A connection manager with bounded reconnection and live port switching
//! - Line decoding for JSON object, JSON array, CSV and raw payloads
//! - Required-field validation and per-field encryption before storage
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sensorlink_core::prelude::*;
//!
//! let config = ConnectionConfig {
//!     data_type: DataType::Csv,
//!     field_mapping: vec!["temp".into(), "humidity".into()],
//!     target_table: Some("sensors_table".into()),
//!     ..Default::default()
//! };
//!
//! let manager = ConnectionManager::spawn(
//!     config,
//!     Arc::new(SystemSerial),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(TracingSink),
//! )?;
//! manager.connect()?;
//! println!("{:?}", manager.status().await?);
//! ```

pub mod config;
pub mod decode;
pub mod events;
pub mod serial;
pub mod store;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConfigError, ConnectionConfig, DataType};
    pub use crate::decode::{DecodeError, DecodedRecord, FrameDecoder, RecordValidator};
    pub use crate::events::{ChannelSink, EventSink, LinkEvent, ReconnectStatus, TracingSink};
    pub use crate::serial::{
        ConnectionManager, ConnectionState, LinkError, LinkStatus, PortInfo, SerialBackend,
        SystemSerial,
    };
    pub use crate::store::{FieldCipher, MemoryStore, PersistenceGateway, StoreReceipt};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
