//! The persistent store abstraction.
//!
//! Spec treats the embedded key/value store as an external collaborator:
//! "a key-prefixed map with atomic batch writes." This module is that
//! interface plus one production backend ([`sled_store::SledStore`]) and one
//! in-memory backend (`memory::MemoryStore`, behind `#[cfg(test)]`) used by
//! unit and integration tests. Nothing above this module ever talks to sled
//! directly.

pub mod memory;
pub mod sled_store;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{EngineError, Result};

/// One write within an atomic batch.
pub enum BatchOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| EngineError::Store(e.to_string()))?;
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: bytes,
        });
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// A key-prefixed map with atomic batch writes and lexicographic prefix
/// scans, per spec §6.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete_raw(&self, key: &str) -> Result<()>;
    /// Lexicographic range scan `[prefix, prefix + 0xFFFF]`.
    async fn scan_prefix_raw(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
    /// Apply every op in `batch` atomically: either all land or none do.
    async fn write_batch(&self, batch: WriteBatch) -> Result<()>;
}

/// Typed convenience helpers layered over the raw byte store. Every caller
/// in this crate goes through these, never `get_raw`/`put_raw` directly.
#[async_trait]
pub trait StoreExt: Store {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| EngineError::Store(format!("decode {key}: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn put<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| EngineError::Store(e.to_string()))?;
        self.put_raw(key, bytes).await
    }

    async fn scan_prefix<T: DeserializeOwned + Send>(&self, prefix: &str) -> Result<Vec<T>> {
        let raw = self.scan_prefix_raw(prefix).await?;
        raw.into_iter()
            .map(|(_, bytes)| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| EngineError::Store(format!("decode scan {prefix}: {e}")))
            })
            .collect()
    }
}

impl<S: Store + ?Sized> StoreExt for S {}
