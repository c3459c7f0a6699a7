//! SQLite backend.
//!
//! Three denormalized tables keyed by token hashes. The access table holds
//! at most one row per fingerprint; `create` relies on a conditional insert
//! and falls back to an update when the insert affects no rows. A
//! [`Sweeper`] task deletes rows whose expiration has passed.

use super::reuse::{plan_create, CreatePlan};
use super::TokenStore;
use crate::clock::Clock;
use crate::config::DatabaseStoreConfig;
use crate::error::{Result, TokenError};
use crate::fingerprint::{short, token_key, Fingerprint};
use crate::model::TokenRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Table names after applying the configured prefix.
#[derive(Debug, Clone)]
struct Tables {
    access: String,
    refresh: String,
    code: String,
}

impl Tables {
    fn new(prefix: &str) -> Result<Self> {
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(TokenError::Configuration(format!(
                "table prefix {prefix:?} may only contain letters, digits and underscores"
            )));
        }
        Ok(Self {
            access: format!("{prefix}oauth_access_token"),
            refresh: format!("{prefix}oauth_refresh_token"),
            code: format!("{prefix}oauth_code"),
        })
    }

    fn all(&self) -> [&str; 3] {
        [&self.access, &self.refresh, &self.code]
    }
}

/// Unix seconds of an expiry, `0` for never.
/// Unix seconds, rounded up so a row is never swept before it expires.
/// `0` means never.
fn expiration(at: Option<DateTime<Utc>>) -> i64 {
    at.map_or(0, |at| {
        if at.timestamp_subsec_nanos() > 0 {
            at.timestamp() + 1
        } else {
            at.timestamp()
        }
    })
}

#[derive(Clone)]
pub struct DatabaseTokenStore {
    pool: SqlitePool,
    tables: Arc<Tables>,
    clock: Arc<dyn Clock>,
    sweeper: Option<Arc<Sweeper>>,
}

impl DatabaseTokenStore {
    /// Connects, creates the tables if needed and starts the sweeper.
    pub async fn connect(config: &DatabaseStoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.url)
            .await?;
        let mut store = Self::with_pool(pool, &config.table_prefix, clock).await?;
        if config.sweep_interval_secs > 0 {
            store.start_sweeper(Duration::from_secs(config.sweep_interval_secs));
        }
        Ok(store)
    }

    /// Uses an existing pool. No sweeper is started.
    pub async fn with_pool(
        pool: SqlitePool,
        table_prefix: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = Self {
            pool,
            tables: Arc::new(Tables::new(table_prefix)?),
            clock,
            sweeper: None,
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn start_sweeper(&mut self, interval: Duration) {
        self.sweeper = Some(Arc::new(Sweeper::start(
            self.pool.clone(),
            self.tables.clone(),
            self.clock.clone(),
            interval,
        )));
    }

    async fn migrate(&self) -> Result<()> {
        let Tables {
            access,
            refresh,
            code,
        } = self.tables.as_ref();
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {access} (
                    access_token_hash TEXT PRIMARY KEY,
                    token_json TEXT NOT NULL,
                    authentication_fingerprint TEXT NOT NULL,
                    client_id TEXT NOT NULL,
                    user_name TEXT NOT NULL,
                    refresh_token_hash TEXT NOT NULL DEFAULT '',
                    expiration INTEGER NOT NULL DEFAULT 0
                )"
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {access}_fingerprint
                    ON {access} (authentication_fingerprint)"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {access}_refresh
                    ON {access} (refresh_token_hash)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {refresh} (
                    refresh_token_hash TEXT PRIMARY KEY,
                    token_json TEXT NOT NULL,
                    authentication_json TEXT NOT NULL,
                    expiration INTEGER NOT NULL DEFAULT 0
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {code} (
                    code_hash TEXT PRIMARY KEY,
                    authentication_json TEXT NOT NULL,
                    expiration INTEGER NOT NULL DEFAULT 0
                )"
            ),
        ];
        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Deletes every row whose expiration has passed and returns how many
    /// were removed. A failing table is logged and skipped.
    pub async fn sweep_expired(&self) -> Result<u64> {
        sweep(&self.pool, &self.tables, self.clock.now()).await
    }

    async fn fetch_json(&self, sql: &str, key: &str) -> Result<TokenRecord> {
        let row = sqlx::query(sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let json: String = row.try_get(0)?;
                Ok(serde_json::from_str(&json)?)
            }
            None => Err(TokenError::NotFound),
        }
    }

    async fn insert_code(&self, record: TokenRecord) -> Result<TokenRecord> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {} (code_hash, authentication_json, expiration)
             VALUES (?, ?, ?)",
            self.tables.code
        ))
        .bind(token_key(&record.code))
        .bind(serde_json::to_string(&record)?)
        .bind(expiration(record.code_expires_at()))
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    /// Writes the access row (conditional insert, then update by
    /// fingerprint) and the refresh row of `record`.
    async fn upsert_grant(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record: &TokenRecord,
    ) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let fingerprint = record.fingerprint();
        let access_hash = token_key(&record.access);
        let refresh_hash = if record.refresh.is_empty() {
            String::new()
        } else {
            token_key(&record.refresh)
        };
        let grant_expiration = expiration(record.grant_expires_at());

        let inserted = sqlx::query(&format!(
            "INSERT INTO {access} (access_token_hash, token_json, authentication_fingerprint,
                                   client_id, user_name, refresh_token_hash, expiration)
             SELECT ?, ?, ?, ?, ?, ?, ?
             WHERE NOT EXISTS (SELECT 1 FROM {access} WHERE authentication_fingerprint = ?)",
            access = self.tables.access
        ))
        .bind(&access_hash)
        .bind(&json)
        .bind(fingerprint.as_str())
        .bind(&record.client_id)
        .bind(&record.user_id)
        .bind(&refresh_hash)
        .bind(grant_expiration)
        .bind(fingerprint.as_str())
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            debug!("Updating access row of grant {} in place", short(fingerprint.as_str()));
            sqlx::query(&format!(
                "UPDATE {} SET access_token_hash = ?, token_json = ?, client_id = ?,
                               user_name = ?, refresh_token_hash = ?, expiration = ?
                 WHERE authentication_fingerprint = ?",
                self.tables.access
            ))
            .bind(&access_hash)
            .bind(&json)
            .bind(&record.client_id)
            .bind(&record.user_id)
            .bind(&refresh_hash)
            .bind(grant_expiration)
            .bind(fingerprint.as_str())
            .execute(&mut **tx)
            .await?;
        }

        if !record.refresh.is_empty() {
            sqlx::query(&format!(
                "INSERT OR REPLACE INTO {} (refresh_token_hash, token_json, authentication_json, expiration)
                 VALUES (?, ?, ?, ?)",
                self.tables.refresh
            ))
            .bind(&refresh_hash)
            .bind(&json)
            .bind(serde_json::to_string(&record.authentication())?)
            .bind(expiration(record.refresh_expires_at()))
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn delete_grant(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record: &TokenRecord,
    ) -> Result<u64> {
        let mut deleted = 0;
        if !record.access.is_empty() {
            deleted += sqlx::query(&format!(
                "DELETE FROM {} WHERE access_token_hash = ?",
                self.tables.access
            ))
            .bind(token_key(&record.access))
            .execute(&mut **tx)
            .await?
            .rows_affected();
        }
        if !record.refresh.is_empty() {
            deleted += sqlx::query(&format!(
                "DELETE FROM {} WHERE refresh_token_hash = ?",
                self.tables.refresh
            ))
            .bind(token_key(&record.refresh))
            .execute(&mut **tx)
            .await?
            .rows_affected();
        }
        Ok(deleted)
    }
}

#[async_trait]
impl TokenStore for DatabaseTokenStore {
    async fn create(&self, mut record: TokenRecord) -> Result<TokenRecord> {
        record.validate()?;
        if !record.code.is_empty() {
            return self.insert_code(record).await;
        }

        let fingerprint = record.fingerprint();
        let existing = match self.get_by_fingerprint(&fingerprint).await {
            Ok(existing) => Some(existing),
            Err(TokenError::NotFound) => None,
            Err(err) => return Err(err),
        };

        let plan = plan_create(existing.as_ref(), &mut record, self.clock.now());
        if plan == CreatePlan::Reuse {
            debug!("Reusing live grant {}", short(fingerprint.as_str()));
            return Ok(record);
        }

        let mut tx = self.pool.begin().await?;
        match plan {
            CreatePlan::Reuse => {}
            CreatePlan::Insert | CreatePlan::Rotate { .. } => {
                self.upsert_grant(&mut tx, &record).await?;
            }
            CreatePlan::Replace { stale } => {
                debug!("Replacing stale grant {}", short(fingerprint.as_str()));
                self.delete_grant(&mut tx, &stale).await?;
                self.upsert_grant(&mut tx, &record).await?;
            }
        }
        tx.commit().await?;
        Ok(record)
    }

    async fn get_by_access(&self, access: &str) -> Result<TokenRecord> {
        self.fetch_json(
            &format!(
                "SELECT token_json FROM {} WHERE access_token_hash = ?",
                self.tables.access
            ),
            &token_key(access),
        )
        .await
    }

    async fn get_by_refresh(&self, refresh: &str) -> Result<TokenRecord> {
        self.fetch_json(
            &format!(
                "SELECT token_json FROM {} WHERE refresh_token_hash = ?",
                self.tables.refresh
            ),
            &token_key(refresh),
        )
        .await
    }

    async fn get_by_code(&self, code: &str) -> Result<TokenRecord> {
        self.fetch_json(
            &format!(
                "SELECT authentication_json FROM {} WHERE code_hash = ?",
                self.tables.code
            ),
            &token_key(code),
        )
        .await
    }

    async fn get_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<TokenRecord> {
        self.fetch_json(
            &format!(
                "SELECT token_json FROM {} WHERE authentication_fingerprint = ?",
                self.tables.access
            ),
            fingerprint.as_str(),
        )
        .await
    }

    async fn remove_by_access(&self, access: &str) -> Result<()> {
        let deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE access_token_hash = ?",
            self.tables.access
        ))
        .bind(token_key(access))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if deleted == 0 {
            return Err(TokenError::NotFound);
        }
        Ok(())
    }

    async fn remove_by_refresh(&self, refresh: &str) -> Result<()> {
        let refresh_hash = token_key(refresh);
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for table in [&self.tables.refresh, &self.tables.access] {
            deleted += sqlx::query(&format!(
                "DELETE FROM {table} WHERE refresh_token_hash = ?"
            ))
            .bind(&refresh_hash)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        if deleted == 0 {
            return Err(TokenError::NotFound);
        }
        Ok(())
    }

    async fn remove_by_code(&self, code: &str) -> Result<()> {
        let record = self.get_by_code(code).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "DELETE FROM {} WHERE code_hash = ?",
            self.tables.code
        ))
        .bind(token_key(code))
        .execute(&mut *tx)
        .await?;
        self.delete_grant(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn health_check(&self) -> std::result::Result<(), String> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(err) => Err(format!("Database health check failed: {}", err)),
        }
    }
}

async fn sweep(pool: &SqlitePool, tables: &Tables, now: DateTime<Utc>) -> Result<u64> {
    let now = now.timestamp();
    let mut total = 0;
    let mut last_error = None;
    let mut failed = 0;
    for table in tables.all() {
        let result = sqlx::query(&format!(
            "DELETE FROM {table} WHERE expiration > 0 AND expiration <= ?"
        ))
        .bind(now)
        .execute(pool)
        .await;
        match result {
            Ok(done) => total += done.rows_affected(),
            Err(err) => {
                error!("Failed to sweep expired rows from {}: {}", table, err);
                failed += 1;
                last_error = Some(err);
            }
        }
    }
    match last_error {
        Some(err) if failed == tables.all().len() => Err(err.into()),
        _ => Ok(total),
    }
}

/// Background task deleting expired rows at a fixed interval.
///
/// The task stops when the handle is dropped.
#[derive(Debug)]
pub struct Sweeper {
    shutdown_token: CancellationToken,
}

impl Sweeper {
    fn start(
        pool: SqlitePool,
        tables: Arc<Tables>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        let shutdown_token = CancellationToken::new();
        let token = shutdown_token.clone();
        info!("Starting token sweeper (interval: {}s)", interval.as_secs_f64());

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Token sweeper received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        match sweep(&pool, &tables, clock.now()).await {
                            Ok(0) => {}
                            Ok(count) => debug!("Swept {} expired token rows", count),
                            Err(err) => error!("Token sweep failed: {}", err),
                        }
                    }
                }
            }
        });

        Self { shutdown_token }
    }

    pub fn stop(&self) {
        self.shutdown_token.cancel();
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
