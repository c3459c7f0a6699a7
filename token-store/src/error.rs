use thiserror::Error;

/// Errors returned by the token store, generator and resolver.
///
/// `NotFound`, `Expired` and `InvalidToken` are the "unauthorized" family:
/// callers facing a client must collapse them into one outcome so the
/// response never reveals which of them occurred.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Token not found")]
    NotFound,
    #[error("Token expired")]
    Expired,
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("Token backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid token record: {0}")]
    InvalidRecord(String),
    #[error("Failed to (de)serialize token record: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TokenError {
    /// Whether the error should surface as a plain "unauthorized" to a client.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            TokenError::NotFound | TokenError::Expired | TokenError::InvalidToken(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TokenError::NotFound)
    }
}

impl From<redis::RedisError> for TokenError {
    fn from(err: redis::RedisError) -> Self {
        TokenError::BackendUnavailable(format!("redis: {err}"))
    }
}

impl From<sqlx::Error> for TokenError {
    fn from(err: sqlx::Error) -> Self {
        TokenError::BackendUnavailable(format!("database: {err}"))
    }
}

impl From<redb::Error> for TokenError {
    fn from(err: redb::Error) -> Self {
        TokenError::BackendUnavailable(format!("file store: {err}"))
    }
}

impl From<tokio::task::JoinError> for TokenError {
    fn from(err: tokio::task::JoinError) -> Self {
        TokenError::BackendUnavailable(format!("blocking task failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, TokenError>;
