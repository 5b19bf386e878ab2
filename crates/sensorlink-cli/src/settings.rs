//! Run configuration
//!
//! A JSON file in the same camelCase shape the library deserializes, with the
//! `SERIAL_*` environment variables of existing deployments layered on top.

use anyhow::{Context, Result};
use sensorlink_core::config::{ConfigError, ConnectionConfig};
use std::path::Path;

/// Table records go to when neither the file nor the environment names one
pub const DEFAULT_TABLE: &str = "sensors_table";

/// Load the configuration file (if any) and apply environment overrides
pub fn load(path: Option<&Path>) -> Result<ConnectionConfig> {
    let config = match path {
        Some(path) => read_file(path)?,
        None => ConnectionConfig::default(),
    };
    resolve(config, |key| std::env::var(key).ok())
}

/// Environment overlay plus the defaults only the command line applies
fn resolve(
    mut config: ConnectionConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ConnectionConfig> {
    apply_env(&mut config, lookup).context("invalid SERIAL_* environment setting")?;
    if config.target_table.is_none() {
        config.target_table = Some(DEFAULT_TABLE.to_string());
    }
    Ok(config)
}

/// Parse a JSON configuration file
pub fn read_file(path: &Path) -> Result<ConnectionConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

/// Overlay `SERIAL_*` variables resolved through `lookup`. Unset or blank
/// variables leave the configured value alone.
pub fn apply_env(
    config: &mut ConnectionConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(port) = var("SERIAL_PORT") {
        config.port_path = Some(port.trim().to_string());
    }
    if let Some(baud) = var("SERIAL_BAUDRATE") {
        config.baud_rate = baud
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: "SERIAL_BAUDRATE".into(),
                value: baud.clone(),
            })?;
    }
    if let Some(delimiter) = var("SERIAL_LINE_DELIMITER") {
        config.line_delimiter = unescape(&delimiter);
    }
    if let Some(data_type) = var("SERIAL_DATA_TYPES") {
        config.data_type = data_type.trim().parse()?;
    }
    if let Some(table) = var("SERIAL_DB_TABLE_NAME") {
        config.target_table = Some(table.trim().to_string());
    }
    if let Some(fields) = var("SERIAL_REQUIRED_FIELDS") {
        config.required_fields = split_list(&fields);
    }
    if let Some(fields) = var("SERIAL_FIELD_TO_ENCRYPT") {
        config.fields_to_encrypt = split_list(&fields);
    }

    Ok(())
}

/// Comma-separated list, trimmed, blanks dropped
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Shells and `.env` files tend to pass `\r\n` literally
fn unescape(value: &str) -> String {
    value
        .replace("\\r", "\r")
        .replace("\\n", "\n")
        .replace("\\t", "\t")
}
