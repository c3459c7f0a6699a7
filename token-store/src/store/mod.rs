use crate::clock::Clock;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::model::TokenRecord;
use async_trait::async_trait;
use log::info;
use std::sync::Arc;

pub mod database;
pub mod file;
pub mod kv;
pub mod memory;
pub mod redis;
pub mod reuse;

/// Contract every token backend fulfils.
///
/// `create` is idempotent per Authentication Fingerprint: re-creating a live
/// grant reuses it, a live refresh token with a new access token rotates the
/// access token in place, and anything else replaces the grant. It returns
/// the record as persisted, with reused timestamps carried over.
///
/// Lookups never filter on expiry; deciding whether a returned record is
/// still usable is left to the caller. Removals return
/// [`TokenError::NotFound`](crate::TokenError::NotFound) when nothing matched.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn create(&self, record: TokenRecord) -> Result<TokenRecord>;

    async fn get_by_access(&self, access: &str) -> Result<TokenRecord>;

    async fn get_by_refresh(&self, refresh: &str) -> Result<TokenRecord>;

    async fn get_by_code(&self, code: &str) -> Result<TokenRecord>;

    async fn get_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<TokenRecord>;

    /// Removes the access token. The refresh token that minted it stays
    /// usable.
    async fn remove_by_access(&self, access: &str) -> Result<()>;

    /// Removes the refresh token and the access token linked to it.
    async fn remove_by_refresh(&self, refresh: &str) -> Result<()>;

    /// Removes the code and any tokens recorded alongside it.
    async fn remove_by_code(&self, code: &str) -> Result<()>;

    /// Returns Ok(()) if the backend is reachable, or Err with a descriptive
    /// message.
    async fn health_check(&self) -> std::result::Result<(), String>;
}

/// Store selected by configuration at startup.
#[derive(Clone)]
pub enum Store {
    /// Process-local Moka cache
    Memory(kv::KvTokenStore<memory::MemoryKv>),
    /// Single redb file
    File(kv::KvTokenStore<file::FileKv>),
    /// SQLite tables with a background sweeper
    Database(database::DatabaseTokenStore),
    /// Redis keys with native expiry
    Redis(kv::KvTokenStore<redis::RedisKv>),
}

impl Store {
    pub fn backend(&self) -> StoreBackend {
        match self {
            Self::Memory(_) => StoreBackend::Memory,
            Self::File(_) => StoreBackend::File,
            Self::Database(_) => StoreBackend::Database,
            Self::Redis(_) => StoreBackend::Redis,
        }
    }
}

#[async_trait]
impl TokenStore for Store {
    async fn create(&self, record: TokenRecord) -> Result<TokenRecord> {
        match self {
            Self::Memory(store) => store.create(record).await,
            Self::File(store) => store.create(record).await,
            Self::Database(store) => store.create(record).await,
            Self::Redis(store) => store.create(record).await,
        }
    }

    async fn get_by_access(&self, access: &str) -> Result<TokenRecord> {
        match self {
            Self::Memory(store) => store.get_by_access(access).await,
            Self::File(store) => store.get_by_access(access).await,
            Self::Database(store) => store.get_by_access(access).await,
            Self::Redis(store) => store.get_by_access(access).await,
        }
    }

    async fn get_by_refresh(&self, refresh: &str) -> Result<TokenRecord> {
        match self {
            Self::Memory(store) => store.get_by_refresh(refresh).await,
            Self::File(store) => store.get_by_refresh(refresh).await,
            Self::Database(store) => store.get_by_refresh(refresh).await,
            Self::Redis(store) => store.get_by_refresh(refresh).await,
        }
    }

    async fn get_by_code(&self, code: &str) -> Result<TokenRecord> {
        match self {
            Self::Memory(store) => store.get_by_code(code).await,
            Self::File(store) => store.get_by_code(code).await,
            Self::Database(store) => store.get_by_code(code).await,
            Self::Redis(store) => store.get_by_code(code).await,
        }
    }

    async fn get_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<TokenRecord> {
        match self {
            Self::Memory(store) => store.get_by_fingerprint(fingerprint).await,
            Self::File(store) => store.get_by_fingerprint(fingerprint).await,
            Self::Database(store) => store.get_by_fingerprint(fingerprint).await,
            Self::Redis(store) => store.get_by_fingerprint(fingerprint).await,
        }
    }

    async fn remove_by_access(&self, access: &str) -> Result<()> {
        match self {
            Self::Memory(store) => store.remove_by_access(access).await,
            Self::File(store) => store.remove_by_access(access).await,
            Self::Database(store) => store.remove_by_access(access).await,
            Self::Redis(store) => store.remove_by_access(access).await,
        }
    }

    async fn remove_by_refresh(&self, refresh: &str) -> Result<()> {
        match self {
            Self::Memory(store) => store.remove_by_refresh(refresh).await,
            Self::File(store) => store.remove_by_refresh(refresh).await,
            Self::Database(store) => store.remove_by_refresh(refresh).await,
            Self::Redis(store) => store.remove_by_refresh(refresh).await,
        }
    }

    async fn remove_by_code(&self, code: &str) -> Result<()> {
        match self {
            Self::Memory(store) => store.remove_by_code(code).await,
            Self::File(store) => store.remove_by_code(code).await,
            Self::Database(store) => store.remove_by_code(code).await,
            Self::Redis(store) => store.remove_by_code(code).await,
        }
    }

    async fn health_check(&self) -> std::result::Result<(), String> {
        match self {
            Self::Memory(store) => store.health_check().await,
            Self::File(store) => store.health_check().await,
            Self::Database(store) => store.health_check().await,
            Self::Redis(store) => store.health_check().await,
        }
    }
}

/// Creates the store selected by `config.backend`.
///
/// Connection failures and invalid settings are returned rather than
/// retried; callers treat them as fatal at startup.
pub async fn create_store(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Store> {
    match config.backend {
        StoreBackend::Memory => {
            info!(
                "Using in-memory token store (capacity: {} MiB)",
                config.memory.capacity_mib
            );
            let kv = memory::MemoryKv::new(config.memory.capacity_mib)?;
            Ok(Store::Memory(kv::KvTokenStore::new(kv, "", clock)))
        }
        StoreBackend::File => {
            info!("Using file token store at {}", config.file.path.display());
            let kv = file::FileKv::open(&config.file.path, clock.clone()).await?;
            Ok(Store::File(kv::KvTokenStore::new(kv, "", clock)))
        }
        StoreBackend::Database => {
            info!("Using database token store");
            let store = database::DatabaseTokenStore::connect(&config.database, clock).await?;
            Ok(Store::Database(store))
        }
        StoreBackend::Redis => {
            info!(
                "Using Redis token store (namespace: {:?}, database: {})",
                config.redis.namespace, config.redis.database
            );
            let kv = redis::RedisKv::new(
                &config.redis.url,
                config.redis.database,
                config.redis.atomic_writes,
            )
            .await?;
            Ok(Store::Redis(kv::KvTokenStore::new(
                kv,
                config.redis.namespace.clone(),
                clock,
            )))
        }
    }
}
