use super::kv::{KeyValue, KvOp, KvTokenStore, WriteBatch};
use crate::error::{Result, TokenError};
use crate::model::TokenRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, warn};
use redis::{aio::ConnectionManager, AsyncCommands, Client, IntoConnectionInfo};
use std::time::Duration;

// TODO derive Debug once ConnectionManager implements it
#[derive(Clone)]
pub struct RedisKv {
    _client: Client,
    conn_manager: ConnectionManager,
    atomic_writes: bool,
}

impl RedisKv {
    /// Connects to `redis_url`, selecting the logical `database`.
    pub async fn new(redis_url: &str, database: i64, atomic_writes: bool) -> Result<Self> {
        if redis_url.is_empty() {
            return Err(TokenError::Configuration(
                "redis backend selected without a url".to_string(),
            ));
        }
        let mut info = redis_url
            .into_connection_info()
            .map_err(|err| TokenError::Configuration(format!("invalid redis url: {}", err)))?;
        info.redis.db = database;

        let client = Client::open(info)
            .map_err(|err| TokenError::Configuration(format!("invalid redis url: {}", err)))?;
        let conn_manager = ConnectionManager::new(client.clone()).await?;

        // Test the connection to ensure it's working
        let mut conn = conn_manager.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;

        Ok(Self {
            _client: client,
            conn_manager,
            atomic_writes,
        })
    }

    /// Members of a sorted index, soonest to expire first.
    pub async fn index_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let members: Vec<String> = conn.zrange(key, 0, -1).await?;
        Ok(members)
    }
}

/// Expiry given to index keys that hold a grant that never expires
/// (9999-12-31T23:59:59Z). Index keys always carry a TTL so `PEXPIREAT ... GT`
/// can only ever raise it.
const NEVER_EXPIRES_MS: i64 = 253_402_300_799_000;

fn millis(ttl: Duration) -> u64 {
    // Redis rejects a zero expiry; round sub-millisecond lifetimes up.
    (ttl.as_millis().max(1)).try_into().unwrap_or(u64::MAX)
}

/// Unix milliseconds, rounded up.
fn unix_millis(at: DateTime<Utc>) -> i64 {
    if at.timestamp_subsec_nanos() % 1_000_000 > 0 {
        at.timestamp_millis() + 1
    } else {
        at.timestamp_millis()
    }
}

#[async_trait]
impl KeyValue for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn_manager.clone();
        match conn.get(key).await {
            Ok(value) => Ok(value),
            Err(err) => {
                error!("Redis error while getting key {}: {}", key, err);
                Err(err.into())
            }
        }
    }

    /// Sends the batch as one pipeline, wrapped in MULTI/EXEC when atomic
    /// writes are enabled.
    async fn write(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        if self.atomic_writes {
            pipe.atomic();
        }
        for op in batch.into_ops() {
            match op {
                KvOp::Put {
                    key,
                    value,
                    ttl: Some(ttl),
                } => {
                    pipe.pset_ex(key, value, millis(ttl)).ignore();
                }
                KvOp::Put {
                    key,
                    value,
                    ttl: None,
                } => {
                    pipe.set(key, value).ignore();
                }
                KvOp::Delete { key } => {
                    pipe.del(key).ignore();
                }
                KvOp::IndexAdd {
                    key,
                    member,
                    expires_at,
                    prune_until,
                } => {
                    let (score, key_expires_ms) = match expires_at {
                        Some(at) => (unix_millis(at).to_string(), unix_millis(at)),
                        None => ("+inf".to_string(), NEVER_EXPIRES_MS),
                    };
                    pipe.zadd(&key, member, score).ignore();
                    pipe.zrembyscore(&key, "-inf", prune_until.timestamp_millis())
                        .ignore();
                    // NX covers a fresh key, GT extends an existing one.
                    for condition in ["NX", "GT"] {
                        pipe.cmd("PEXPIREAT")
                            .arg(&key)
                            .arg(key_expires_ms)
                            .arg(condition)
                            .ignore();
                    }
                }
                KvOp::IndexRemove { key, member } => {
                    pipe.zrem(key, member).ignore();
                }
            }
        }

        let mut conn = self.conn_manager.clone();
        if let Err(err) = pipe.query_async::<()>(&mut conn).await {
            error!("Redis error while writing token keys: {}", err);
            return Err(err.into());
        }
        Ok(())
    }

    async fn health_check(&self) -> std::result::Result<(), String> {
        let mut conn = self.conn_manager.clone();
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(_) => Ok(()),
            Err(err) => Err(format!("Redis health check failed: {}", err)),
        }
    }
}

impl KvTokenStore<RedisKv> {
    /// Live records issued to `client_id`, oldest first.
    pub async fn tokens_for_client(&self, client_id: &str) -> Result<Vec<TokenRecord>> {
        self.indexed_records(&self.key("client_id_to_access", client_id))
            .await
    }

    /// Live records issued to `user_id`, oldest first.
    pub async fn tokens_for_user(&self, user_id: &str) -> Result<Vec<TokenRecord>> {
        self.indexed_records(&self.key("uname_to_access", user_id))
            .await
    }

    async fn indexed_records(&self, index_key: &str) -> Result<Vec<TokenRecord>> {
        let mut records = Vec::new();
        for access_key in self.kv.index_members(index_key).await? {
            // Index members outlive the access key they point at.
            match self.read_record(&self.key("access", &access_key)).await {
                Ok(record) => records.push(record),
                Err(TokenError::NotFound) => {
                    warn!("Skipping stale index entry in {}", index_key);
                }
                Err(err) => return Err(err),
            }
        }
        records.sort_by_key(|record| record.access_created_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::TokenStore;
    use chrono::Utc;
    use redis_test::server::RedisServer;
    use std::sync::Arc;

    fn get_redis_url(server: &RedisServer) -> String {
        match &server.addr {
            redis::ConnectionAddr::Tcp(host, port) => {
                format!("redis://{}:{}/", host, port)
            }
            _ => "redis://127.0.0.1:6379/".to_string(),
        }
    }

    async fn store(server: &RedisServer) -> KvTokenStore<RedisKv> {
        let kv = RedisKv::new(&get_redis_url(server), 0, true).await.unwrap();
        KvTokenStore::new(kv, "test:", Arc::new(SystemClock))
    }

    fn grant(access: &str, refresh: &str) -> TokenRecord {
        TokenRecord::new("c1", "u1", "app")
            .with_access(access, Utc::now(), Duration::from_secs(60))
            .with_refresh(refresh, Utc::now(), Duration::from_secs(600))
    }

    #[test]
    fn test_millis_rounds_up() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }

    #[tokio::test]
    async fn test_empty_url_is_configuration_error() {
        assert!(matches!(
            RedisKv::new("", 0, true).await,
            Err(TokenError::Configuration(_))
        ));
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_round_trip_and_cascade() {
        let server = RedisServer::new();
        let store = store(&server).await;

        let created = store.create(grant("a1", "r1")).await.unwrap();
        assert_eq!(store.get_by_access("a1").await.unwrap(), created);
        assert_eq!(store.get_by_refresh("r1").await.unwrap(), created);

        store.remove_by_refresh("r1").await.unwrap();
        assert!(matches!(
            store.get_by_access("a1").await,
            Err(TokenError::NotFound)
        ));
        assert!(matches!(
            store.get_by_refresh("r1").await,
            Err(TokenError::NotFound)
        ));
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_indices() {
        let server = RedisServer::new();
        let store = store(&server).await;

        store.create(grant("a1", "r1")).await.unwrap();
        let other = TokenRecord::new("c1", "u2", "app").with_access(
            "a2",
            Utc::now(),
            Duration::from_secs(60),
        );
        store.create(other).await.unwrap();

        assert_eq!(store.tokens_for_client("c1").await.unwrap().len(), 2);
        assert_eq!(store.tokens_for_user("u1").await.unwrap().len(), 1);

        store.remove_by_access("a2").await.unwrap();
        assert_eq!(store.tokens_for_client("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_keys_carry_ttl() {
        let server = RedisServer::new();
        let store = store(&server).await;
        store.create(grant("a1", "r1")).await.unwrap();

        let mut conn = store.engine().conn_manager.clone();
        let ttl: i64 = conn
            .pttl(format!("test:access:{}", crate::fingerprint::token_key("a1")))
            .await
            .unwrap();
        assert!(ttl > 590_000 && ttl <= 600_000, "unexpected ttl {ttl}");
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_short_grant_keeps_index_ttl() {
        let server = RedisServer::new();
        let store = store(&server).await;

        store.create(grant("a1", "r1")).await.unwrap();
        let short = TokenRecord::new("c1", "u2", "app").with_access(
            "a2",
            Utc::now(),
            Duration::from_secs(5),
        );
        store.create(short).await.unwrap();

        let mut conn = store.engine().conn_manager.clone();
        let ttl: i64 = conn.pttl("test:client_id_to_access:c1").await.unwrap();
        assert!(ttl > 590_000 && ttl <= 600_000, "unexpected ttl {ttl}");

        let records = store.tokens_for_client("c1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].access, "a1");
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_index_prunes_expired_members() {
        let server = RedisServer::new();
        let store = store(&server).await;

        let brief = TokenRecord::new("c1", "u1", "app").with_access(
            "a1",
            Utc::now(),
            Duration::from_secs(1),
        );
        store.create(brief).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        store.create(grant("a2", "r2")).await.unwrap();

        let members = store
            .engine()
            .index_members("test:client_id_to_access:c1")
            .await
            .unwrap();
        assert_eq!(members, vec![crate::fingerprint::token_key("a2")]);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_health_check() {
        let server = RedisServer::new();
        let store = store(&server).await;
        assert!(store.health_check().await.is_ok());
    }
}
