//! Persistence handoff
//!
//! The manager only needs two capabilities from the storage layer: store a
//! record into a table, and optionally encrypt a field value. Query semantics
//! and the cipher itself live behind these traits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::decode::DecodedRecord;

/// Errors raised by a persistence gateway
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store has no such table
    #[error("Table not found: {0}")]
    UnknownTable(String),

    /// The record itself was refused
    #[error("Store rejected record: {0}")]
    Rejected(String),

    /// The backend failed independently of the record
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Errors raised by a field cipher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Encrypting a value failed
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    /// Decrypting a value failed
    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

/// Identifier assigned to a stored record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReceipt {
    /// Row id or document key, depending on the backend
    pub insert_id: String,
}

/// Paired encrypt/decrypt capability for individual field values
pub trait FieldCipher: Send + Sync {
    /// Encrypt one stringified field value
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError>;

    /// Reverse [`FieldCipher::encrypt`]
    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError>;
}

/// Storage collaborator consumed by the connection manager
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Store a record into `table`
    async fn store(&self, table: &str, record: DecodedRecord) -> Result<StoreReceipt, StoreError>;

    /// Field encryption capability, if this backend offers one
    fn cipher(&self) -> Option<&dyn FieldCipher> {
        None
    }
}

/// In-process gateway keeping records per table
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<DecodedRecord>>>,
    next_id: AtomicU64,
    cipher: Option<Arc<dyn FieldCipher>>,
}

impl MemoryStore {
    /// Create an empty store without encryption
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that offers the given cipher
    pub fn with_cipher(cipher: Arc<dyn FieldCipher>) -> Self {
        Self {
            cipher: Some(cipher),
            ..Self::default()
        }
    }

    /// Snapshot of the records stored into `table`
    pub fn records(&self, table: &str) -> Vec<DecodedRecord> {
        self.tables().get(table).cloned().unwrap_or_default()
    }

    /// Total number of stored records across all tables
    pub fn len(&self) -> usize {
        self.tables().values().map(Vec::len).sum()
    }

    /// Whether nothing has been stored yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every write is a single push, so a poisoned map is still consistent
    fn tables(&self) -> MutexGuard<'_, HashMap<String, Vec<DecodedRecord>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn store(&self, table: &str, record: DecodedRecord) -> Result<StoreReceipt, StoreError> {
        let mut tables = self.tables();
        tables.entry(table.to_string()).or_default().push(record);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(StoreReceipt {
            insert_id: id.to_string(),
        })
    }

    fn cipher(&self) -> Option<&dyn FieldCipher> {
        self.cipher.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Reversible stand-in for a real cipher
    struct HexCipher;

    impl FieldCipher for HexCipher {
        fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
            Ok(plaintext.bytes().map(|b| format!("{b:02x}")).collect())
        }

        fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
            let bytes = (0..ciphertext.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&ciphertext[i..i + 2], 16))
                .collect::<Result<Vec<u8>, _>>()
                .map_err(|e| CipherError::Decrypt(e.to_string()))?;
            String::from_utf8(bytes).map_err(|e| CipherError::Decrypt(e.to_string()))
        }
    }

    #[tokio::test]
    async fn test_memory_store_assigns_ids() {
        let store = MemoryStore::new();
        let mut record = DecodedRecord::new();
        record.insert("temp".into(), json!(21));

        let first = store.store("sensors", record.clone()).await.unwrap();
        let second = store.store("sensors", record).await.unwrap();

        assert_eq!(first.insert_id, "1");
        assert_eq!(second.insert_id, "2");
        assert_eq!(store.records("sensors").len(), 2);
        assert!(store.records("other").is_empty());
        assert!(store.cipher().is_none());
    }

    #[test]
    fn test_cipher_round_trip() {
        let store = MemoryStore::with_cipher(Arc::new(HexCipher));
        let cipher = store.cipher().unwrap();

        let sealed = cipher.encrypt("23.5").unwrap();
        assert_ne!(sealed, "23.5");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "23.5");
    }

    #[tokio::test]
    async fn test_poisoned_lock_keeps_records_visible() {
        let store = Arc::new(MemoryStore::new());
        store
            .store("sensors_table", json!({ "temp": 21 }).as_object().cloned().unwrap())
            .await
            .unwrap();

        let poisoner = store.clone();
        let result = std::thread::spawn(move || {
            let _guard = poisoner.tables.lock().unwrap();
            panic!("writer died holding the lock");
        })
        .join();
        assert!(result.is_err());
        assert!(store.tables.is_poisoned());

        assert_eq!(store.len(), 1);
        assert_eq!(store.records("sensors_table")[0]["temp"], 21);

        let receipt = store
            .store("sensors_table", json!({ "temp": 22 }).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert_eq!(receipt.insert_id, "2");
        assert_eq!(store.records("sensors_table").len(), 2);
    }
}
