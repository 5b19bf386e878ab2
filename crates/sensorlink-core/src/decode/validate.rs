//! Record validation and field encryption
//!
//! Records missing a required field are dropped before they reach storage.
//! Encryption is applied field by field so that one failing field never blocks
//! the rest of the record.

use serde_json::Value;

use super::{stringify, DecodedRecord};
use crate::config::ConnectionConfig;

/// A field that could not be encrypted and was stored as-is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionFailure {
    /// Field name
    pub field: String,
    /// Reason reported by the cipher
    pub message: String,
}

/// Checks required fields and encrypts selected fields of decoded records
#[derive(Debug, Clone, Default)]
pub struct RecordValidator {
    required_fields: Vec<String>,
    fields_to_encrypt: Vec<String>,
}

impl RecordValidator {
    /// Create a validator for the given required and encrypted field lists
    pub fn new(required_fields: Vec<String>, fields_to_encrypt: Vec<String>) -> Self {
        Self {
            required_fields,
            fields_to_encrypt,
        }
    }

    /// Create a validator from the connection configuration
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            config.required_fields.clone(),
            config.fields_to_encrypt.clone(),
        )
    }

    /// Whether any fields are configured for encryption
    pub fn encrypts(&self) -> bool {
        !self.fields_to_encrypt.is_empty()
    }

    /// Whether the record carries every required field
    pub fn validate(&self, record: &DecodedRecord) -> bool {
        self.first_missing(record).is_none()
    }

    /// First required field that is absent, null, or blank
    pub fn first_missing(&self, record: &DecodedRecord) -> Option<&str> {
        self.required_fields
            .iter()
            .find(|field| is_blank(record.get(field.as_str())))
            .map(String::as_str)
    }

    /// Replace every configured, present, non-null field with
    /// `encrypt(stringify(value))`.
    ///
    /// Fields whose encryption fails keep their original value and are
    /// returned so the caller can report them.
    pub fn encrypt_fields<F, E>(&self, record: &mut DecodedRecord, encrypt: F) -> Vec<EncryptionFailure>
    where
        F: Fn(&str) -> Result<String, E>,
        E: std::fmt::Display,
    {
        let mut failures = Vec::new();

        for field in &self.fields_to_encrypt {
            let Some(value) = record.get_mut(field.as_str()) else {
                continue;
            };
            if value.is_null() {
                continue;
            }

            match encrypt(&stringify(value)) {
                Ok(ciphertext) => *value = Value::String(ciphertext),
                Err(e) => failures.push(EncryptionFailure {
                    field: field.clone(),
                    message: e.to_string(),
                }),
            }
        }

        failures
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(v) => stringify(v).trim().is_empty(),
    }
}
