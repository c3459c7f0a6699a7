//! Access and refresh token values for a newly authorized request.
//!
//! Generators only compute strings. Persisting the result is up to the
//! caller, through [`TokenStore::create`](crate::store::TokenStore::create).

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod opaque;
pub mod signed;

/// What the generator needs to know about the authorized request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateBasic {
    pub client_id: String,
    pub user_id: String,
    pub scope: String,
    pub redirect_uri: String,
    pub created_at: DateTime<Utc>,
}

impl GenerateBasic {
    pub fn new(
        client_id: impl Into<String>,
        user_id: impl Into<String>,
        scope: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            user_id: user_id.into(),
            scope: scope.into(),
            redirect_uri: String::new(),
            created_at,
        }
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = redirect_uri.into();
        self
    }
}

#[async_trait]
pub trait TokenGenerator: Send + Sync {
    /// Returns `(access, refresh)`. `refresh` is empty unless `want_refresh`.
    async fn generate(&self, basic: &GenerateBasic, want_refresh: bool) -> Result<(String, String)>;
}

#[derive(Clone)]
pub enum Generator {
    Signed(signed::SignedGenerator),
    Opaque(opaque::OpaqueGenerator),
}

#[async_trait]
impl TokenGenerator for Generator {
    async fn generate(&self, basic: &GenerateBasic, want_refresh: bool) -> Result<(String, String)> {
        match self {
            Self::Signed(generator) => generator.generate(basic, want_refresh).await,
            Self::Opaque(generator) => generator.generate(basic, want_refresh).await,
        }
    }
}
