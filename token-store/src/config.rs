use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Token strategy. Selects the generator and the resolver together, so a
/// process can never mint tokens its resolver cannot read back.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TokenStrategy {
    /// Signed JWT access tokens, verified without a store lookup
    Signed,
    /// Random opaque identifiers, valid only while present in the store
    #[default]
    Opaque,
}

/// Which store backend holds token records
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
    Database,
    Redis,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::Database => "database",
            Self::Redis => "redis",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryStoreConfig {
    /// Maximum capacity in MiB (default: 128)
    #[serde(default = "default_memory_capacity")]
    pub capacity_mib: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            capacity_mib: default_memory_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FileStoreConfig {
    /// Path of the database file (created if missing)
    #[serde(default = "default_file_path")]
    pub path: PathBuf,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            path: default_file_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseStoreConfig {
    /// SQLite connection string, e.g. `sqlite://tokens.db?mode=rwc`
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Prefix prepended to the three token table names
    #[serde(default)]
    pub table_prefix: String,

    /// Seconds between two sweeps of expired rows
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseStoreConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            table_prefix: String::new(),
            sweep_interval_secs: default_sweep_interval(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection string
    #[serde(default)]
    pub url: String,

    /// Prefix prepended to every key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Logical database index
    #[serde(default)]
    pub database: i64,

    /// Write each record's keys in one MULTI/EXEC pipeline
    #[serde(default = "default_true")]
    pub atomic_writes: bool,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            namespace: default_namespace(),
            database: 0,
            atomic_writes: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default)]
    pub memory: MemoryStoreConfig,

    #[serde(default)]
    pub file: FileStoreConfig,

    #[serde(default)]
    pub database: DatabaseStoreConfig,

    #[serde(default)]
    pub redis: RedisStoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SigningConfig {
    /// JWS algorithm name: HS256, HS384, HS512, RS256, RS384 or RS512
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Shared secret for the HS* algorithms
    #[serde(default)]
    pub secret: String,

    /// PEM private key for the RS* algorithms
    #[serde(default)]
    pub private_key_pem: String,

    /// PEM public key for the RS* algorithms
    #[serde(default)]
    pub public_key_pem: String,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            secret: String::new(),
            private_key_pem: String::new(),
            public_key_pem: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenConfig {
    #[serde(default)]
    pub strategy: TokenStrategy,

    /// Access token lifetime in seconds (default: 2 hours)
    #[serde(default = "default_access_expire")]
    pub access_token_expire_secs: u64,

    /// Refresh token lifetime in seconds (default: 3 days)
    #[serde(default = "default_refresh_expire")]
    pub refresh_token_expire_secs: u64,

    /// Authorization code lifetime in seconds (default: 10 minutes)
    #[serde(default = "default_code_expire")]
    pub code_expire_secs: u64,

    /// Hand out the live access token again on re-authorization
    #[serde(default = "default_true")]
    pub reuse_access_token: bool,

    /// Hand out the live refresh token again on re-authorization
    #[serde(default = "default_true")]
    pub reuse_refresh_token: bool,

    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            strategy: TokenStrategy::default(),
            access_token_expire_secs: default_access_expire(),
            refresh_token_expire_secs: default_refresh_expire(),
            code_expire_secs: default_code_expire(),
            reuse_access_token: true,
            reuse_refresh_token: true,
            signing: SigningConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl TokenConfig {
    pub fn access_expires_in(&self) -> Duration {
        Duration::from_secs(self.access_token_expire_secs)
    }

    pub fn refresh_expires_in(&self) -> Duration {
        Duration::from_secs(self.refresh_token_expire_secs)
    }

    pub fn code_expires_in(&self) -> Duration {
        Duration::from_secs(self.code_expire_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_access_expire() -> u64 {
    2 * 3600
}

fn default_refresh_expire() -> u64 {
    3 * 24 * 3600
}

fn default_code_expire() -> u64 {
    600
}

fn default_memory_capacity() -> usize {
    128
}

fn default_file_path() -> PathBuf {
    PathBuf::from("tokens.redb")
}

fn default_database_url() -> String {
    "sqlite://tokens.db?mode=rwc".to_string()
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_max_connections() -> u32 {
    5
}

fn default_namespace() -> String {
    "oauth2:".to_string()
}

fn default_algorithm() -> String {
    "HS512".to_string()
}
