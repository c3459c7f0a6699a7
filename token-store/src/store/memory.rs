use super::kv::{KeyValue, KvOp, WriteBatch};
use crate::error::{Result, TokenError};
use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use moka::Expiry;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    ttl: Option<Duration>,
}

/// Gives every entry the TTL it was written with.
struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// Process-local engine on top of Moka.
///
/// Entries past the capacity limit may be evicted before their TTL, so this
/// engine is meant for single-process deployments and tests.
#[derive(Clone)]
pub struct MemoryKv {
    cache: MokaCache<String, Entry>,
}

impl MemoryKv {
    pub fn new(capacity_mib: usize) -> Result<Self> {
        // Convert MiB to bytes for max_capacity (1 MiB = 1024 * 1024 bytes)
        let max_capacity_bytes: u64 = capacity_mib
            .checked_mul(1024 * 1024)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| {
                TokenError::Configuration(format!("memory capacity overflow: {capacity_mib} MiB"))
            })?;

        let cache = MokaCache::builder()
            .expire_after(EntryExpiry)
            .weigher(|key: &String, entry: &Entry| -> u32 {
                (key.len() + entry.value.len())
                    .try_into()
                    .unwrap_or(u32::MAX)
            })
            .max_capacity(max_capacity_bytes)
            .build();

        Ok(Self { cache })
    }

    #[cfg(test)]
    pub(crate) async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl KeyValue for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.get(key).await.map(|entry| entry.value))
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        // Applied one by one; a reader may observe a partially applied batch.
        for op in batch.into_ops() {
            match op {
                KvOp::Put { key, value, ttl } => {
                    self.cache.insert(key, Entry { value, ttl }).await;
                }
                KvOp::Delete { key } => {
                    self.cache.remove(&key).await;
                }
                KvOp::IndexAdd { .. } | KvOp::IndexRemove { .. } => {}
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}
