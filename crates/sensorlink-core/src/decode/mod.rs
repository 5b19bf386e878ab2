//! Line decoding
//!
//! Turns one line of device output into a [`DecodedRecord`] according to the
//! configured [`DataType`].

mod validate;

pub use validate::{EncryptionFailure, RecordValidator};

use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::config::{ConfigError, ConnectionConfig, DataType};

/// Field name → value mapping produced for every decoded line
pub type DecodedRecord = Map<String, Value>;

/// Field holding the verbatim line for the `raw` format
pub const RAW_DATA_FIELD: &str = "raw_data";

/// Field holding the capture time for the `raw` format
pub const RAW_TIMESTAMP_FIELD: &str = "timestamp";

/// Per-line decoding failures. The offending line is dropped; the session
/// carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The line is not valid JSON
    #[error("Malformed JSON: {0}")]
    MalformedJson(String),

    /// Valid JSON of the wrong kind
    #[error("Expected a JSON {expected}, got {found}")]
    UnexpectedShape {
        /// Kind the format requires
        expected: &'static str,
        /// Kind the line contained
        found: &'static str,
    },

    /// Item count differs from the field mapping
    #[error("{format} data mismatch. Expected {expected} items, got {actual}")]
    ArityMismatch {
        /// Positional format in use
        format: DataType,
        /// Length of the field mapping
        expected: usize,
        /// Items on the line
        actual: usize,
    },
}

/// Stateless decoder for one configured wire format
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    data_type: DataType,
    csv_delimiter: String,
    field_mapping: Vec<String>,
}

impl FrameDecoder {
    /// Build a decoder from the connection configuration
    pub fn new(config: &ConnectionConfig) -> Result<Self, ConfigError> {
        if config.data_type.is_positional() && config.field_mapping.is_empty() {
            return Err(ConfigError::MissingFieldMapping(config.data_type));
        }
        if config.data_type == DataType::Csv && config.csv_delimiter.is_empty() {
            return Err(ConfigError::EmptyDelimiter("csvDelimiter"));
        }

        Ok(Self {
            data_type: config.data_type,
            csv_delimiter: config.csv_delimiter.clone(),
            field_mapping: config.field_mapping.clone(),
        })
    }

    /// Configured wire format
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Decode one line.
    ///
    /// Returns `Ok(None)` for blank lines, which are skipped rather than
    /// treated as errors.
    pub fn decode(&self, raw_line: &str) -> Result<Option<DecodedRecord>, DecodeError> {
        let line = raw_line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let record = match self.data_type {
            DataType::JsonObject => decode_json_object(line)?,
            DataType::JsonArray => self.decode_json_array(line)?,
            DataType::Csv => self.decode_csv(line)?,
            DataType::Raw => decode_raw(line),
        };
        Ok(Some(record))
    }

    fn decode_json_array(&self, line: &str) -> Result<DecodedRecord, DecodeError> {
        let items = match parse_json(line)? {
            Value::Array(items) => items,
            other => {
                return Err(DecodeError::UnexpectedShape {
                    expected: "array",
                    found: json_kind(&other),
                })
            }
        };
        self.check_arity(items.len())?;

        Ok(self.field_mapping.iter().cloned().zip(items).collect())
    }

    fn decode_csv(&self, line: &str) -> Result<DecodedRecord, DecodeError> {
        let segments: Vec<&str> = line.split(self.csv_delimiter.as_str()).collect();
        self.check_arity(segments.len())?;

        Ok(self
            .field_mapping
            .iter()
            .zip(segments)
            .map(|(field, segment)| (field.clone(), coerce_csv_value(segment)))
            .collect())
    }

    fn check_arity(&self, actual: usize) -> Result<(), DecodeError> {
        let expected = self.field_mapping.len();
        if actual != expected {
            return Err(DecodeError::ArityMismatch {
                format: self.data_type,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

fn parse_json(line: &str) -> Result<Value, DecodeError> {
    serde_json::from_str(line).map_err(|e| DecodeError::MalformedJson(e.to_string()))
}

fn decode_json_object(line: &str) -> Result<DecodedRecord, DecodeError> {
    match parse_json(line)? {
        Value::Object(map) => Ok(map),
        other => Err(DecodeError::UnexpectedShape {
            expected: "object",
            found: json_kind(&other),
        }),
    }
}

fn decode_raw(line: &str) -> DecodedRecord {
    let mut record = Map::new();
    record.insert(RAW_DATA_FIELD.to_string(), Value::String(line.to_string()));
    record.insert(
        RAW_TIMESTAMP_FIELD.to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );
    record
}

/// Trim a CSV segment and turn it into a number when the whole segment is a
/// finite numeric literal. Unsigned `0x`, `0o` and `0b` literals count too,
/// since some firmware prints registers that way.
fn coerce_csv_value(segment: &str) -> Value {
    let trimmed = segment.trim();
    if trimmed.is_empty() {
        return Value::String(String::new());
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Some(int) = parse_radix_literal(trimmed) {
        return Value::Number(int.into());
    }
    match trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        Some(number) => Value::Number(number),
        None => Value::String(trimmed.to_string()),
    }
}

fn parse_radix_literal(text: &str) -> Option<u64> {
    let radix = match text.get(..2)? {
        "0x" | "0X" => 16,
        "0o" | "0O" => 8,
        "0b" | "0B" => 2,
        _ => return None,
    };
    let digits = &text[2..];
    // from_str_radix would accept a sign after the prefix
    if digits.starts_with(['+', '-']) {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// String form of a value, as used for blank checks and encryption input
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>().join(","),
        Value::Object(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn decoder(data_type: DataType, mapping: &[&str]) -> FrameDecoder {
        let config = ConnectionConfig {
            data_type,
            field_mapping: mapping.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        FrameDecoder::new(&config).unwrap()
    }

    fn as_json(record: DecodedRecord) -> Value {
        Value::Object(record)
    }

    #[test]
    fn test_csv_coerces_numbers() {
        let d = decoder(DataType::Csv, &["temp", "humidity"]);
        let record = d.decode("23.5,60").unwrap().unwrap();
        assert_eq!(as_json(record), json!({ "temp": 23.5, "humidity": 60 }));
    }

    #[test]
    fn test_csv_keeps_text_and_trims() {
        let d = decoder(DataType::Csv, &["id", "status", "level"]);
        let record = d.decode(" node-1 ,  ok , -4 ").unwrap().unwrap();
        assert_eq!(
            as_json(record),
            json!({ "id": "node-1", "status": "ok", "level": -4 })
        );
    }

    #[test]
    fn test_csv_non_finite_stays_text() {
        let d = decoder(DataType::Csv, &["a", "b", "c"]);
        let record = d.decode("inf,NaN,").unwrap().unwrap();
        assert_eq!(as_json(record), json!({ "a": "inf", "b": "NaN", "c": "" }));
    }

    #[test]
    fn test_csv_prefixed_integers() {
        let d = decoder(DataType::Csv, &["flags", "mask", "mode", "bad", "signed"]);
        let record = d.decode("0x1A,0b101,0o17,0xZZ,0x-1").unwrap().unwrap();
        assert_eq!(
            as_json(record),
            json!({ "flags": 26, "mask": 5, "mode": 15, "bad": "0xZZ", "signed": "0x-1" })
        );
    }

    #[test]
    fn test_csv_custom_delimiter() {
        let config = ConnectionConfig {
            data_type: DataType::Csv,
            csv_delimiter: ";".to_string(),
            field_mapping: vec!["x".into(), "y".into()],
            ..Default::default()
        };
        let d = FrameDecoder::new(&config).unwrap();
        let record = d.decode("1.25;2").unwrap().unwrap();
        assert_eq!(as_json(record), json!({ "x": 1.25, "y": 2 }));
    }

    #[test]
    fn test_csv_arity_mismatch() {
        let d = decoder(DataType::Csv, &["temp", "humidity"]);
        assert_eq!(
            d.decode("23.5,60,1"),
            Err(DecodeError::ArityMismatch {
                format: DataType::Csv,
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn test_json_array_positional() {
        let d = decoder(DataType::JsonArray, &["temp", "label", "ok"]);
        let record = d.decode(r#"[21.0, "lab", true]"#).unwrap().unwrap();
        let keys: Vec<&String> = record.keys().collect();
        assert_eq!(keys, vec!["temp", "label", "ok"]);
        assert_eq!(
            as_json(record),
            json!({ "temp": 21.0, "label": "lab", "ok": true })
        );
    }

    #[test]
    fn test_json_array_arity_and_shape() {
        let d = decoder(DataType::JsonArray, &["a", "b"]);
        assert!(matches!(
            d.decode("[1]"),
            Err(DecodeError::ArityMismatch {
                expected: 2,
                actual: 1,
                ..
            })
        ));
        assert_eq!(
            d.decode(r#"{"a": 1}"#),
            Err(DecodeError::UnexpectedShape {
                expected: "array",
                found: "object"
            })
        );
    }

    #[test]
    fn test_json_object() {
        let d = decoder(DataType::JsonObject, &[]);
        let record = d.decode(r#"{"temp": 22, "node": "a"}"#).unwrap().unwrap();
        assert_eq!(as_json(record), json!({ "temp": 22, "node": "a" }));

        assert!(matches!(
            d.decode("{temp: 22"),
            Err(DecodeError::MalformedJson(_))
        ));
        assert!(matches!(
            d.decode("42"),
            Err(DecodeError::UnexpectedShape {
                expected: "object",
                ..
            })
        ));
    }

    #[test]
    fn test_raw_wraps_line() {
        let d = decoder(DataType::Raw, &[]);
        let record = d.decode("  hello device  ").unwrap().unwrap();
        assert_eq!(record[RAW_DATA_FIELD], json!("hello device"));
        let stamp = record[RAW_TIMESTAMP_FIELD].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[test]
    fn test_blank_lines_skipped() {
        for data_type in [DataType::JsonObject, DataType::Csv, DataType::Raw] {
            let d = decoder(data_type, &["a"]);
            assert_eq!(d.decode(""), Ok(None));
            assert_eq!(d.decode("   \t "), Ok(None));
        }
    }

    #[test]
    fn test_positional_without_mapping_is_config_error() {
        let config = ConnectionConfig {
            data_type: DataType::Csv,
            ..Default::default()
        };
        assert_eq!(
            FrameDecoder::new(&config).unwrap_err(),
            ConfigError::MissingFieldMapping(DataType::Csv)
        );
    }

    #[test]
    fn test_stringify() {
        assert_eq!(stringify(&json!(null)), "");
        assert_eq!(stringify(&json!(23.5)), "23.5");
        assert_eq!(stringify(&json!(false)), "false");
        assert_eq!(stringify(&json!([1, "a"])), "1,a");
        assert_eq!(stringify(&json!({"k": 1})), r#"{"k":1}"#);
    }
}
