//! Connection configuration
//!
//! Every option the connection manager understands, with the defaults applied
//! when a key is missing. Keys follow the camelCase names used by existing
//! deployment files.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default serial speed for sensor boards
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default line terminator emitted by most sketches (`Serial.println`)
pub const DEFAULT_LINE_DELIMITER: &str = "\r\n";

/// Wire format of a single line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    /// One JSON object per line
    #[default]
    JsonObject,
    /// One JSON array per line, mapped positionally through `fieldMapping`
    JsonArray,
    /// Delimited values, mapped positionally through `fieldMapping`
    Csv,
    /// Stored verbatim under `raw_data`
    Raw,
}

impl DataType {
    /// Whether this format needs a field mapping to name its positional values
    pub fn is_positional(self) -> bool {
        matches!(self, DataType::JsonArray | DataType::Csv)
    }

    /// Name as written in configuration files
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::JsonObject => "json-object",
            DataType::JsonArray => "json-array",
            DataType::Csv => "csv",
            DataType::Raw => "raw",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "json-object" => Ok(DataType::JsonObject),
            "json-array" => Ok(DataType::JsonArray),
            "csv" => Ok(DataType::Csv),
            "raw" => Ok(DataType::Raw),
            other => Err(ConfigError::UnsupportedDataType(other.to_string())),
        }
    }
}

/// Configuration problems detected before the manager starts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Unknown wire format name
    #[error("Unsupported dataType: {0}")]
    UnsupportedDataType(String),

    /// A positional format without field names
    #[error("dataType '{0}' requires a non-empty fieldMapping")]
    MissingFieldMapping(DataType),

    /// A delimiter setting is empty
    #[error("{0} must not be empty")]
    EmptyDelimiter(&'static str),

    /// A count or duration that must be positive is zero
    #[error("{name} must be greater than zero")]
    ZeroValue {
        /// Setting name
        name: &'static str,
    },

    /// Silence could never be detected between two health checks
    #[error(
        "dataSilenceThreshold ({threshold_ms}ms) must exceed healthCheckInterval ({interval_ms}ms)"
    )]
    SilenceThresholdTooShort {
        /// Configured silence threshold
        threshold_ms: u64,
        /// Configured health check interval
        interval_ms: u64,
    },

    /// A setting could not be parsed
    #[error("Invalid value for {key}: {value}")]
    InvalidValue {
        /// Setting name
        key: String,
        /// Rejected text
        value: String,
    },
}

/// Connection manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Fixed port path; `None` enables auto-discovery
    pub port_path: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Wire format of each line
    pub data_type: DataType,
    /// Sequence that terminates a line
    pub line_delimiter: String,
    /// Separator between CSV values
    pub csv_delimiter: String,
    /// Field names for positional formats, in wire order
    pub field_mapping: Vec<String>,
    /// Table records are stored into; `None` disables storage
    #[serde(alias = "dbTableName")]
    pub target_table: Option<String>,
    /// Fields that must be present and non-blank for a record to be stored
    pub required_fields: Vec<String>,
    /// Fields replaced by their encrypted form before storage
    pub fields_to_encrypt: Vec<String>,
    /// Schedule reconnection after failures and unexpected closes
    pub auto_reconnect: bool,
    /// Delay between reconnection attempts in milliseconds
    #[serde(rename = "reconnectDelay")]
    pub reconnect_delay_ms: u64,
    /// Reconnection attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Open timeout in milliseconds
    #[serde(rename = "connectionTimeout")]
    pub connection_timeout_ms: u64,
    /// Interval between scans for a better port in milliseconds
    #[serde(rename = "portScanInterval")]
    pub port_scan_interval_ms: u64,
    /// Hot-swap to a recognised device port when one appears
    pub enable_dynamic_port_switching: bool,
    /// Interval between data-silence checks in milliseconds
    #[serde(rename = "healthCheckInterval")]
    pub health_check_interval_ms: u64,
    /// Silence after which a health warning is emitted, in milliseconds
    #[serde(rename = "dataSilenceThreshold")]
    pub data_silence_threshold_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_path: None,
            baud_rate: DEFAULT_BAUD_RATE,
            data_type: DataType::JsonObject,
            line_delimiter: DEFAULT_LINE_DELIMITER.to_string(),
            csv_delimiter: ",".to_string(),
            field_mapping: Vec::new(),
            target_table: None,
            required_fields: Vec::new(),
            fields_to_encrypt: Vec::new(),
            auto_reconnect: true,
            reconnect_delay_ms: 3000,
            max_reconnect_attempts: 10,
            connection_timeout_ms: 5000,
            port_scan_interval_ms: 15000,
            enable_dynamic_port_switching: true,
            health_check_interval_ms: 10000,
            data_silence_threshold_ms: 30000,
        }
    }
}

impl ConnectionConfig {
    /// Check the configuration for contradictions the manager cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::ZeroValue { name: "baudRate" });
        }
        if self.line_delimiter.is_empty() {
            return Err(ConfigError::EmptyDelimiter("lineDelimiter"));
        }
        if self.data_type == DataType::Csv && self.csv_delimiter.is_empty() {
            return Err(ConfigError::EmptyDelimiter("csvDelimiter"));
        }
        if self.data_type.is_positional() && self.field_mapping.is_empty() {
            return Err(ConfigError::MissingFieldMapping(self.data_type));
        }

        for (name, value) in [
            ("connectionTimeout", self.connection_timeout_ms),
            ("portScanInterval", self.port_scan_interval_ms),
            ("healthCheckInterval", self.health_check_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroValue { name });
            }
        }

        if self.data_silence_threshold_ms <= self.health_check_interval_ms {
            return Err(ConfigError::SilenceThresholdTooShort {
                threshold_ms: self.data_silence_threshold_ms,
                interval_ms: self.health_check_interval_ms,
            });
        }

        Ok(())
    }

    /// Whether the operator pinned a specific port
    pub fn is_pinned(&self) -> bool {
        self.port_path.is_some()
    }

    pub(crate) fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub(crate) fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub(crate) fn port_scan_interval(&self) -> Duration {
        Duration::from_millis(self.port_scan_interval_ms)
    }

    pub(crate) fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub(crate) fn data_silence_threshold(&self) -> Duration {
        Duration::from_millis(self.data_silence_threshold_ms)
    }
}
