//! In-memory store backend used by unit and integration tests. Mirrors
//! `SledStore`'s semantics (atomic batch, lexicographic prefix scan) without
//! touching disk.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::Result;
use crate::models::prefix_range_end;
use crate::store::{BatchOp, Store, WriteBatch};

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.data.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_raw(&self, key: &str) -> Result<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn scan_prefix_raw(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let end = String::from_utf8_lossy(&prefix_range_end(prefix)).into_owned();
        let guard = self.data.lock().unwrap();
        Ok(guard
            .range(prefix.to_string()..=end)
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut guard = self.data.lock().unwrap();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    guard.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    guard.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreExt;

    #[tokio::test]
    async fn scan_prefix_only_returns_matching_keys() {
        let store = MemoryStore::new();
        store.put("balance:alice:mind:MIND", &1u32).await.unwrap();
        store.put("balance:alice:mind:USDT", &2u32).await.unwrap();
        store.put("balance:bob:mind:MIND", &3u32).await.unwrap();

        let values: Vec<u32> = store.scan_prefix("balance:alice:").await.unwrap();
        assert_eq!(values.len(), 2);
    }

    #[tokio::test]
    async fn batch_write_is_all_or_nothing_in_effect() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put("a", &1u32).unwrap();
        batch.put("b", &2u32).unwrap();
        store.write_batch(batch).await.unwrap();

        assert_eq!(store.get::<u32>("a").await.unwrap(), Some(1));
        assert_eq!(store.get::<u32>("b").await.unwrap(), Some(2));
    }
}
