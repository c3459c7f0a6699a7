//! Single-file engine on top of redb.
//!
//! redb has no per-key expiry, so values are wrapped in an envelope carrying
//! their deadline. Expired envelopes read as absent and are purged when the
//! file is opened.

use super::kv::{KeyValue, KvOp, WriteBatch};
use crate::clock::Clock;
use crate::error::{Result, TokenError};
use crate::model::add_duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

const TOKENS: TableDefinition<&str, &str> = TableDefinition::new("tokens");

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

impl Envelope {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Clone)]
pub struct FileKv {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl FileKv {
    /// Opens (or creates) the database file and drops expired entries.
    pub async fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Database::create(path))
            .await?
            .map_err(|err| TokenError::from(redb::Error::from(err)))?;
        let kv = Self {
            db: Arc::new(db),
            clock,
        };
        let purged = kv.purge_expired().await?;
        if purged > 0 {
            info!("Purged {} expired entries from the token file", purged);
        }
        Ok(kv)
    }

    /// Deletes every entry whose deadline has passed.
    pub async fn purge_expired(&self) -> Result<usize> {
        let db = self.db.clone();
        let now = self.clock.now();
        let purged = tokio::task::spawn_blocking(move || -> std::result::Result<usize, redb::Error> {
            let txn = db.begin_write()?;
            let mut purged = 0;
            {
                let mut table = txn.open_table(TOKENS)?;
                let mut expired = Vec::new();
                for entry in table.iter()? {
                    let (key, value) = entry?;
                    let live = serde_json::from_str::<Envelope>(value.value())
                        .map(|envelope| envelope.is_live(now))
                        .unwrap_or(false);
                    if !live {
                        expired.push(key.value().to_string());
                    }
                }
                for key in expired {
                    table.remove(key.as_str())?;
                    purged += 1;
                }
            }
            txn.commit()?;
            Ok(purged)
        })
        .await??;
        Ok(purged)
    }
}

fn read(db: &Database, key: &str) -> std::result::Result<Option<String>, redb::Error> {
    let txn = db.begin_read()?;
    let table = match txn.open_table(TOKENS) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(table.get(key)?.map(|guard| guard.value().to_string()))
}

fn apply(db: &Database, rows: Vec<(String, Option<String>)>) -> std::result::Result<(), redb::Error> {
    let txn = db.begin_write()?;
    {
        let mut table = txn.open_table(TOKENS)?;
        for (key, value) in &rows {
            match value {
                Some(value) => {
                    table.insert(key.as_str(), value.as_str())?;
                }
                None => {
                    table.remove(key.as_str())?;
                }
            }
        }
    }
    txn.commit()?;
    Ok(())
}

#[async_trait]
impl KeyValue for FileKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.clone();
        let owned = key.to_string();
        let raw = tokio::task::spawn_blocking(move || read(&db, &owned)).await??;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_str(&raw)?;
        if envelope.is_live(self.clock.now()) {
            Ok(Some(envelope.value))
        } else {
            debug!("Ignoring expired file entry");
            Ok(None)
        }
    }

    /// Applies the whole batch in one write transaction.
    async fn write(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        let mut rows = Vec::with_capacity(batch.len());
        for op in batch.into_ops() {
            match op {
                KvOp::Put { key, value, ttl } => {
                    let envelope = Envelope {
                        value,
                        expires_at: ttl.map(|ttl| add_duration(now, ttl)),
                    };
                    rows.push((key, Some(serde_json::to_string(&envelope)?)));
                }
                KvOp::Delete { key } => rows.push((key, None)),
                KvOp::IndexAdd { .. } | KvOp::IndexRemove { .. } => {}
            }
        }
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || apply(&db, rows)).await??;
        Ok(())
    }

    async fn health_check(&self) -> std::result::Result<(), String> {
        let db = self.db.clone();
        match tokio::task::spawn_blocking(move || db.begin_read().map(|_| ())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(format!("File store health check failed: {}", err)),
            Err(err) => Err(format!("File store health check failed: {}", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn batch_of(ops: &[(&str, &str, Option<Duration>)]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for (key, value, ttl) in ops {
            batch.put(key.to_string(), value.to_string(), *ttl);
        }
        batch
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(Utc::now());
        let kv = FileKv::open(dir.path().join("t.redb"), Arc::new(clock))
            .await
            .unwrap();

        assert!(kv.get("missing").await.unwrap().is_none());

        kv.write(batch_of(&[("a", "1", None), ("b", "2", None)]))
            .await
            .unwrap();
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("1"));

        let mut batch = WriteBatch::new();
        batch.delete("a".to_string());
        kv.write(batch).await.unwrap();
        assert!(kv.get("a").await.unwrap().is_none());
        assert_eq!(kv.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_expired_entries_read_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(Utc::now());
        let kv = FileKv::open(dir.path().join("t.redb"), Arc::new(clock.clone()))
            .await
            .unwrap();

        kv.write(batch_of(&[
            ("short", "x", Some(Duration::from_secs(5))),
            ("forever", "y", None),
        ]))
        .await
        .unwrap();

        clock.advance(Duration::from_secs(5));
        assert!(kv.get("short").await.unwrap().is_none());
        assert_eq!(kv.get("forever").await.unwrap().as_deref(), Some("y"));
        assert_eq!(kv.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.redb");
        let clock = ManualClock::new(Utc::now());
        {
            let kv = FileKv::open(&path, Arc::new(clock.clone())).await.unwrap();
            kv.write(batch_of(&[("k", "v", Some(Duration::from_secs(60)))]))
                .await
                .unwrap();
        }

        let kv = FileKv::open(&path, Arc::new(clock)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(kv.health_check().await.is_ok());
    }
}
