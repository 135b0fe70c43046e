use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{DedupStatus, DedupStore};
use crate::error::StoreError;

/// Single-process dedup store. Expired records are replaced lazily on lookup and
/// removed in bulk by the scheduled sweep.
#[derive(Default)]
pub struct MemoryDedupStore {
    records: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn check_and_mark(
        &self,
        key: &str,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<DedupStatus, StoreError> {
        let mut records = self.records.lock().await;
        match records.get(key) {
            Some(first_seen) if *first_seen > cutoff => Ok(DedupStatus::AlreadySeen),
            _ => {
                records.insert(key.to_string(), now);
                Ok(DedupStatus::FirstSeen)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.records.lock().await.remove(key);
        Ok(())
    }

    async fn evict_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, first_seen| *first_seen > cutoff);
        Ok(before - records.len())
    }

    async fn tracked(&self, prefix: &str) -> Result<usize, StoreError> {
        let records = self.records.lock().await;
        Ok(records.keys().filter(|k| k.starts_with(prefix)).count())
    }
}
