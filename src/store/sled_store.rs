//! Embedded KV backend for the persistent store, using `sled`.
//!
//! `sled`'s `scan_prefix` and `Batch` map directly onto spec §6's
//! lexicographic prefix scans and atomic batch writes, so this is a thin
//! adapter rather than a reimplementation.

use async_trait::async_trait;
use tracing::debug;

use crate::errors::{EngineError, Result};
use crate::models::prefix_range_end;
use crate::store::{BatchOp, Store, WriteBatch};

pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path).map_err(|e| EngineError::Store(e.to_string()))?;
        debug!(path, "opened sled store");
        Ok(Self { db })
    }
}

#[async_trait]
impl Store for SledStore {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            db.get(key.as_bytes())
                .map(|opt| opt.map(|ivec| ivec.to_vec()))
                .map_err(|e| EngineError::Store(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?
    }

    async fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            db.insert(key.as_bytes(), value)
                .map(|_| ())
                .map_err(|e| EngineError::Store(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?
    }

    async fn delete_raw(&self, key: &str) -> Result<()> {
        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            db.remove(key.as_bytes())
                .map(|_| ())
                .map_err(|e| EngineError::Store(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?
    }

    async fn scan_prefix_raw(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let db = self.db.clone();
        let start = prefix.as_bytes().to_vec();
        let end = prefix_range_end(prefix);
        tokio::task::spawn_blocking(move || {
            db.range(start..=end)
                .map(|entry| {
                    let (k, v) = entry.map_err(|e| EngineError::Store(e.to_string()))?;
                    let key = String::from_utf8(k.to_vec())
                        .map_err(|e| EngineError::Store(e.to_string()))?;
                    Ok((key, v.to_vec()))
                })
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?
    }

    async fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let db = self.db.clone();
        let ops = batch.into_ops();
        tokio::task::spawn_blocking(move || {
            let mut sled_batch = sled::Batch::default();
            for op in ops {
                match op {
                    BatchOp::Put { key, value } => sled_batch.insert(key.as_bytes(), value),
                    BatchOp::Delete { key } => sled_batch.remove(key.as_bytes()),
                }
            }
            db.apply_batch(sled_batch)
                .map_err(|e| EngineError::Store(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?
    }
}
