//! A bounded, TTL-evicting cache keyed by string ids.
//!
//! The indexer's per-chain `processed_transactions` guard (spec §4.3) only
//! needs to answer "have I seen this hash recently enough to skip it" — the
//! durable answer lives in the `deposit:`/`gasFundingTx:` store records.
//! This cache is the in-process fast path in front of that, bounded so a
//! long-running chain with a high deposit volume can't grow it without
//! limit.

use std::collections::HashMap;
use std::time::{Duration, Instant};

const DEFAULT_MAX_SIZE: usize = 100_000;
const DEFAULT_TTL_SECS: u64 = 86_400;

pub struct BoundedHashCache {
    map: HashMap<String, Instant>,
    max_size: usize,
    ttl: Duration,
}

impl BoundedHashCache {
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        Self {
            map: HashMap::new(),
            max_size,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.get(key).is_some_and(|&t| t.elapsed() < self.ttl)
    }

    pub fn insert(&mut self, key: String) {
        let now = Instant::now();
        self.map.retain(|_, &mut t| now.duration_since(t) < self.ttl);
        while self.map.len() >= self.max_size && !self.map.is_empty() {
            let oldest = self.map.iter().min_by_key(|(_, t)| *t).map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.map.remove(&k);
                }
                None => break,
            }
        }
        self.map.insert(key, now);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for BoundedHashCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE, DEFAULT_TTL_SECS)
    }
}
