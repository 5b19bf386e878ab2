//! JSON-lines file store
//!
//! Each table is a `<table>.jsonl` file in the output directory, one record per
//! line, appended in arrival order.

use async_trait::async_trait;
use sensorlink_core::decode::DecodedRecord;
use sensorlink_core::store::{PersistenceGateway, StoreError, StoreReceipt};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct JsonLinesStore {
    dir: PathBuf,
    next_id: AtomicU64,
    /// Serializes appends so lines never interleave
    write_lock: Mutex<()>,
}

impl JsonLinesStore {
    /// Use `dir` as the output directory, creating it if needed
    pub async fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            next_id: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        })
    }

    /// File backing `table`
    pub fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.jsonl"))
    }
}

/// Table names become file names
fn check_table_name(table: &str) -> Result<(), StoreError> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::UnknownTable(table.to_string()))
    }
}

#[async_trait]
impl PersistenceGateway for JsonLinesStore {
    async fn store(&self, table: &str, record: DecodedRecord) -> Result<StoreReceipt, StoreError> {
        check_table_name(table)?;

        let mut line = serde_json::to_string(&record)
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.table_path(table))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(StoreReceipt {
            insert_id: id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn record(value: Value) -> DecodedRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    #[tokio::test]
    async fn test_appends_records_per_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesStore::open(dir.path().join("out")).await.unwrap();

        let first = store
            .store("sensors_table", record(json!({ "temp": 23.5, "humidity": 60 })))
            .await
            .unwrap();
        let second = store
            .store("sensors_table", record(json!({ "temp": 24, "humidity": 61 })))
            .await
            .unwrap();
        store
            .store("raw_log", record(json!({ "raw_data": "BOOT" })))
            .await
            .unwrap();

        assert_eq!(first.insert_id, "1");
        assert_eq!(second.insert_id, "2");

        let text = std::fs::read_to_string(store.table_path("sensors_table")).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(
            lines,
            vec![
                json!({ "temp": 23.5, "humidity": 60 }),
                json!({ "temp": 24, "humidity": 61 })
            ]
        );
        assert!(store.table_path("raw_log").exists());
    }

    #[tokio::test]
    async fn test_rejects_path_like_table_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesStore::open(dir.path()).await.unwrap();

        for table in ["", "../escape", "a/b", "sensors.table"] {
            assert_eq!(
                store.store(table, DecodedRecord::new()).await,
                Err(StoreError::UnknownTable(table.to_string()))
            );
        }
    }

    #[test]
    fn test_no_cipher_offered() {
        let store = JsonLinesStore {
            dir: PathBuf::from("."),
            next_id: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        };
        assert!(store.cipher().is_none());
    }
}
