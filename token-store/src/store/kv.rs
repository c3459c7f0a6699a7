//! Token layout over a plain key-value engine.
//!
//! A grant is denormalized into independent keys, each with its own TTL:
//!
//! | key                              | value                       | TTL     |
//! |----------------------------------|-----------------------------|---------|
//! | `access:<hash>`                  | record JSON                 | grant   |
//! | `auth:<hash>`                    | authentication JSON         | grant   |
//! | `refresh:<hash>`                 | record JSON                 | refresh |
//! | `refresh_auth:<hash>`            | authentication JSON         | refresh |
//! | `auth_to_access:<fingerprint>`   | access hash                 | grant   |
//! | `access_to_refresh:<hash>`       | refresh hash                | grant   |
//! | `refresh_to_access:<hash>`       | access hash                 | refresh |
//! | `client_id_to_access:<clientId>` | sorted set of access hashes | longest |
//! | `uname_to_access:<userId>`       | sorted set of access hashes | longest |
//! | `code:<hash>`                    | record JSON                 | code    |
//!
//! "grant" is the later of the access and refresh expiries, so the
//! fingerprint mapping outlives an expired access token while its refresh
//! token can still be reused. Index members are scored by their grant
//! expiry; each add prunes expired members and only ever extends the
//! index key's TTL ("longest").
//!
//! All keys touched by one operation go to the engine as a single
//! [`WriteBatch`]; whether the batch lands atomically depends on the engine.

use super::reuse::{plan_create, CreatePlan};
use super::TokenStore;
use crate::clock::Clock;
use crate::error::{Result, TokenError};
use crate::fingerprint::{short, token_key, Fingerprint};
use crate::model::{remaining, TokenRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// One write against a key-value engine.
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    /// Set `key`; `ttl: None` keeps it until deleted.
    Put {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
    /// Add `member` to the sorted index `key`, scored by `expires_at`
    /// (`None` never expires), and drop members that expired at or before
    /// `prune_until`. Engines without sorted sets ignore index operations.
    IndexAdd {
        key: String,
        member: String,
        expires_at: Option<DateTime<Utc>>,
        prune_until: DateTime<Utc>,
    },
    IndexRemove {
        key: String,
        member: String,
    },
}

/// Ordered list of writes applied in sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<KvOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a put. A TTL that has already run out becomes a delete.
    pub fn put(&mut self, key: String, value: String, ttl: Option<Duration>) -> &mut Self {
        if ttl == Some(Duration::ZERO) {
            return self.delete(key);
        }
        self.ops.push(KvOp::Put { key, value, ttl });
        self
    }

    pub fn delete(&mut self, key: String) -> &mut Self {
        self.ops.push(KvOp::Delete { key });
        self
    }

    pub fn index_add(
        &mut self,
        key: String,
        member: String,
        expires_at: Option<DateTime<Utc>>,
        prune_until: DateTime<Utc>,
    ) -> &mut Self {
        self.ops.push(KvOp::IndexAdd {
            key,
            member,
            expires_at,
            prune_until,
        });
        self
    }

    pub fn index_remove(&mut self, key: String, member: String) -> &mut Self {
        self.ops.push(KvOp::IndexRemove { key, member });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[KvOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<KvOp> {
        self.ops
    }
}

/// A general-purpose keyed store with per-key expiry.
#[async_trait]
pub trait KeyValue: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn write(&self, batch: WriteBatch) -> Result<()>;

    async fn health_check(&self) -> std::result::Result<(), String>;
}

/// [`TokenStore`] implemented over any [`KeyValue`] engine.
#[derive(Clone)]
pub struct KvTokenStore<B> {
    pub(crate) kv: B,
    namespace: String,
    clock: Arc<dyn Clock>,
}

impl<B: KeyValue> KvTokenStore<B> {
    pub fn new(kv: B, namespace: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
            clock,
        }
    }

    pub fn engine(&self) -> &B {
        &self.kv
    }

    pub(crate) fn key(&self, kind: &str, id: &str) -> String {
        format!("{}{}:{}", self.namespace, kind, id)
    }

    pub(crate) async fn read_record(&self, key: &str) -> Result<TokenRecord> {
        match self.kv.get(key).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(TokenError::NotFound),
        }
    }

    /// Queues every key of a live grant.
    fn put_grant(&self, batch: &mut WriteBatch, record: &TokenRecord) -> Result<()> {
        let now = self.clock.now();
        let json = serde_json::to_string(record)?;
        let auth_json = serde_json::to_string(&record.authentication())?;
        let grant_expires_at = record.grant_expires_at();
        let grant_ttl = remaining(grant_expires_at, now);
        let access_key = token_key(&record.access);

        batch
            .put(self.key("access", &access_key), json.clone(), grant_ttl)
            .put(self.key("auth", &access_key), auth_json.clone(), grant_ttl)
            .put(
                self.key("auth_to_access", record.fingerprint().as_str()),
                access_key.clone(),
                grant_ttl,
            )
            .index_add(
                self.key("client_id_to_access", &record.client_id),
                access_key.clone(),
                grant_expires_at,
                now,
            )
            .index_add(
                self.key("uname_to_access", &record.user_id),
                access_key.clone(),
                grant_expires_at,
                now,
            );

        if !record.refresh.is_empty() {
            let refresh_key = token_key(&record.refresh);
            let refresh_ttl = remaining(record.refresh_expires_at(), now);
            batch
                .put(self.key("refresh", &refresh_key), json, refresh_ttl)
                .put(self.key("refresh_auth", &refresh_key), auth_json, refresh_ttl)
                .put(
                    self.key("access_to_refresh", &access_key),
                    refresh_key.clone(),
                    grant_ttl,
                )
                .put(
                    self.key("refresh_to_access", &refresh_key),
                    access_key,
                    refresh_ttl,
                );
        }
        Ok(())
    }

    /// Queues removal of the access-side keys of `record`.
    fn drop_access(&self, batch: &mut WriteBatch, record: &TokenRecord) {
        let access_key = token_key(&record.access);
        batch
            .delete(self.key("access", &access_key))
            .delete(self.key("auth", &access_key))
            .delete(self.key("access_to_refresh", &access_key))
            .index_remove(
                self.key("client_id_to_access", &record.client_id),
                access_key.clone(),
            )
            .index_remove(self.key("uname_to_access", &record.user_id), access_key);
    }

    /// Queues removal of the refresh-side keys of `record`.
    fn drop_refresh(&self, batch: &mut WriteBatch, record: &TokenRecord) {
        let refresh_key = token_key(&record.refresh);
        batch
            .delete(self.key("refresh", &refresh_key))
            .delete(self.key("refresh_auth", &refresh_key))
            .delete(self.key("refresh_to_access", &refresh_key));
    }

    /// Queues removal of the fingerprint mapping if it still points at
    /// `access_key`; a newer grant may own it already.
    async fn drop_fingerprint(
        &self,
        batch: &mut WriteBatch,
        record: &TokenRecord,
        access_key: &str,
    ) -> Result<()> {
        let fingerprint_key = self.key("auth_to_access", record.fingerprint().as_str());
        if self.kv.get(&fingerprint_key).await?.as_deref() == Some(access_key) {
            batch.delete(fingerprint_key);
        }
        Ok(())
    }

    async fn drop_grant(&self, batch: &mut WriteBatch, record: &TokenRecord) -> Result<()> {
        if !record.access.is_empty() {
            self.drop_access(batch, record);
            self.drop_fingerprint(batch, record, &token_key(&record.access))
                .await?;
        }
        if !record.refresh.is_empty() {
            self.drop_refresh(batch, record);
        }
        Ok(())
    }

    async fn create_code(&self, record: TokenRecord) -> Result<TokenRecord> {
        let now = self.clock.now();
        let mut batch = WriteBatch::new();
        batch.put(
            self.key("code", &token_key(&record.code)),
            serde_json::to_string(&record)?,
            remaining(record.code_expires_at(), now),
        );
        self.kv.write(batch).await?;
        Ok(record)
    }
}

#[async_trait]
impl<B: KeyValue> TokenStore for KvTokenStore<B> {
    async fn create(&self, mut record: TokenRecord) -> Result<TokenRecord> {
        record.validate()?;
        if !record.code.is_empty() {
            return self.create_code(record).await;
        }

        let fingerprint = record.fingerprint();
        let existing = match self.get_by_fingerprint(&fingerprint).await {
            Ok(existing) => Some(existing),
            Err(TokenError::NotFound) => None,
            Err(err) => return Err(err),
        };

        let mut batch = WriteBatch::new();
        match plan_create(existing.as_ref(), &mut record, self.clock.now()) {
            CreatePlan::Reuse => {
                debug!("Reusing live grant {}", short(fingerprint.as_str()));
                return Ok(record);
            }
            CreatePlan::Insert => {
                self.put_grant(&mut batch, &record)?;
            }
            CreatePlan::Rotate { previous } => {
                debug!("Rotating access token of grant {}", short(fingerprint.as_str()));
                if previous.access != record.access {
                    self.drop_access(&mut batch, &previous);
                }
                self.put_grant(&mut batch, &record)?;
            }
            CreatePlan::Replace { stale } => {
                debug!("Replacing stale grant {}", short(fingerprint.as_str()));
                self.drop_access(&mut batch, &stale);
                if !stale.refresh.is_empty() {
                    self.drop_refresh(&mut batch, &stale);
                }
                self.put_grant(&mut batch, &record)?;
            }
        }
        self.kv.write(batch).await?;
        Ok(record)
    }

    async fn get_by_access(&self, access: &str) -> Result<TokenRecord> {
        self.read_record(&self.key("access", &token_key(access)))
            .await
    }

    async fn get_by_refresh(&self, refresh: &str) -> Result<TokenRecord> {
        self.read_record(&self.key("refresh", &token_key(refresh)))
            .await
    }

    async fn get_by_code(&self, code: &str) -> Result<TokenRecord> {
        self.read_record(&self.key("code", &token_key(code))).await
    }

    async fn get_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<TokenRecord> {
        let access_key = self
            .kv
            .get(&self.key("auth_to_access", fingerprint.as_str()))
            .await?
            .ok_or(TokenError::NotFound)?;
        self.read_record(&self.key("access", &access_key)).await
    }

    async fn remove_by_access(&self, access: &str) -> Result<()> {
        let record = self.get_by_access(access).await?;
        let access_key = token_key(access);
        let mut batch = WriteBatch::new();
        self.drop_access(&mut batch, &record);
        self.drop_fingerprint(&mut batch, &record, &access_key)
            .await?;
        self.kv.write(batch).await
    }

    async fn remove_by_refresh(&self, refresh: &str) -> Result<()> {
        let record = self.get_by_refresh(refresh).await?;
        let mut batch = WriteBatch::new();
        self.drop_refresh(&mut batch, &record);
        let linked = self
            .kv
            .get(&self.key("refresh_to_access", &token_key(refresh)))
            .await?;
        let access_key = linked.unwrap_or_else(|| token_key(&record.access));
        let access_record = match self.read_record(&self.key("access", &access_key)).await {
            Ok(current) => current,
            Err(TokenError::NotFound) => record.clone(),
            Err(err) => return Err(err),
        };
        self.drop_access(&mut batch, &access_record);
        self.drop_fingerprint(&mut batch, &access_record, &access_key)
            .await?;
        self.kv.write(batch).await
    }

    async fn remove_by_code(&self, code: &str) -> Result<()> {
        let record = self.get_by_code(code).await?;
        let mut batch = WriteBatch::new();
        batch.delete(self.key("code", &token_key(code)));
        self.drop_grant(&mut batch, &record).await?;
        self.kv.write(batch).await
    }

    async fn health_check(&self) -> std::result::Result<(), String> {
        self.kv.health_check().await
    }
}
