//! Turns a presented bearer token back into its record. Read-only.
//!
//! The resolver must be paired with the generator of the same strategy;
//! [`TokenService`](crate::TokenService) builds both from one setting.

use crate::clock::Clock;
use crate::error::{Result, TokenError};
use crate::generator::opaque::is_opaque_token;
use crate::generator::signed::{Claims, SigningKeys};
use crate::model::TokenRecord;
use crate::store::{Store, TokenStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait TokenResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<TokenRecord>;
}

/// Verifies signed tokens without touching any store.
#[derive(Clone)]
pub struct SignedResolver {
    keys: Arc<SigningKeys>,
    clock: Arc<dyn Clock>,
}

impl SignedResolver {
    pub fn new(keys: Arc<SigningKeys>, clock: Arc<dyn Clock>) -> Self {
        Self { keys, clock }
    }
}

#[async_trait]
impl TokenResolver for SignedResolver {
    async fn resolve(&self, token: &str) -> Result<TokenRecord> {
        let data = jsonwebtoken::decode::<Claims>(
            token,
            self.keys.decoding_key(),
            &self.keys.validation(),
        )
        .map_err(|err| TokenError::InvalidToken(err.to_string()))?;
        let claims = data.claims;

        let issued_at = DateTime::<Utc>::from_timestamp(claims.iat, 0)
            .ok_or_else(|| TokenError::InvalidToken("iat out of range".to_string()))?;
        let expires_in = match claims.exp {
            Some(exp) => {
                if self.clock.now().timestamp() >= exp {
                    return Err(TokenError::Expired);
                }
                let secs = exp
                    .checked_sub(claims.iat)
                    .and_then(|secs| u64::try_from(secs).ok())
                    .ok_or_else(|| TokenError::InvalidToken("exp before iat".to_string()))?;
                Duration::from_secs(secs)
            }
            None => Duration::ZERO,
        };

        Ok(TokenRecord::new(claims.aud, claims.sub, claims.scope)
            .with_redirect_uri(claims.redirect_uri)
            .with_access(token, issued_at, expires_in))
    }
}

/// Looks opaque tokens up in the store.
#[derive(Clone)]
pub struct StoreResolver {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl StoreResolver {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl TokenResolver for StoreResolver {
    async fn resolve(&self, token: &str) -> Result<TokenRecord> {
        if !is_opaque_token(token) {
            return Err(TokenError::InvalidToken("not an opaque token".to_string()));
        }
        let record = self.store.get_by_access(token).await?;
        // Rows past expiry stay readable until swept.
        if record.is_access_expired(self.clock.now()) {
            debug!("Rejecting expired access token of client {}", record.client_id);
            return Err(TokenError::Expired);
        }
        Ok(record)
    }
}

#[derive(Clone)]
pub enum Resolver {
    Signed(SignedResolver),
    Store(StoreResolver),
}

#[async_trait]
impl TokenResolver for Resolver {
    async fn resolve(&self, token: &str) -> Result<TokenRecord> {
        match self {
            Self::Signed(resolver) => resolver.resolve(token).await,
            Self::Store(resolver) => resolver.resolve(token).await,
        }
    }
}
