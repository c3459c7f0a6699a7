use super::{GenerateBasic, TokenGenerator};
use crate::clock::Clock;
use crate::error::{Result, TokenError};
use crate::fingerprint::Fingerprint;
use crate::model::TokenRecord;
use crate::store::{Store, TokenStore};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use log::debug;
use rand::Rng;
use std::sync::Arc;

/// Length of a value produced by [`random_token`].
pub const OPAQUE_TOKEN_LEN: usize = 43;

/// 32 random bytes (256 bits), base64url without padding.
pub fn random_token() -> String {
    let mut rng = rand::thread_rng();
    let token_bytes: [u8; 32] = rng.gen();
    URL_SAFE_NO_PAD.encode(token_bytes)
}

/// Whether `value` has the shape of a [`random_token`].
pub fn is_opaque_token(value: &str) -> bool {
    value.len() == OPAQUE_TOKEN_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Random identifiers that only mean something while the store holds them.
///
/// Before minting, the live grant under the same fingerprint is consulted so
/// that re-authorizing hands back the same values when reuse is enabled.
#[derive(Clone)]
pub struct OpaqueGenerator {
    store: Store,
    clock: Arc<dyn Clock>,
    reuse_access: bool,
    reuse_refresh: bool,
}

impl OpaqueGenerator {
    pub fn new(store: Store, clock: Arc<dyn Clock>, reuse_access: bool, reuse_refresh: bool) -> Self {
        Self {
            store,
            clock,
            reuse_access,
            reuse_refresh,
        }
    }

    async fn live_grant(&self, basic: &GenerateBasic) -> Result<Option<TokenRecord>> {
        if !self.reuse_access && !self.reuse_refresh {
            return Ok(None);
        }
        let fingerprint = Fingerprint::of(&basic.user_id, &basic.client_id, &basic.scope);
        match self.store.get_by_fingerprint(&fingerprint).await {
            Ok(record) => Ok(Some(record)),
            Err(TokenError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl TokenGenerator for OpaqueGenerator {
    async fn generate(&self, basic: &GenerateBasic, want_refresh: bool) -> Result<(String, String)> {
        let now = self.clock.now();
        let existing = self.live_grant(basic).await?;

        let reused_refresh = existing.as_ref().filter(|record| {
            want_refresh
                && self.reuse_refresh
                && !record.refresh.is_empty()
                && !record.is_refresh_expired(now)
        });
        let refresh = match (want_refresh, reused_refresh) {
            (false, _) => String::new(),
            (true, Some(record)) => record.refresh.clone(),
            (true, None) => random_token(),
        };

        // Only a grant whose refresh side is kept can keep its access token.
        let reused_access = existing.as_ref().filter(|record| {
            let same_refresh_side = if want_refresh {
                reused_refresh.is_some()
            } else {
                record.refresh.is_empty()
            };
            self.reuse_access
                && same_refresh_side
                && !record.access.is_empty()
                && !record.is_access_expired(now)
        });
        let access = match reused_access {
            Some(record) => {
                debug!("Reusing live access token for client {}", basic.client_id);
                record.access.clone()
            }
            None => random_token(),
        };

        Ok((access, refresh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::kv::KvTokenStore;
    use crate::store::memory::MemoryKv;
    use chrono::Utc;
    use std::time::Duration;

    fn memory_store(clock: &ManualClock) -> Store {
        Store::Memory(KvTokenStore::new(
            MemoryKv::new(16).unwrap(),
            "",
            Arc::new(clock.clone()),
        ))
    }

    async fn persist(store: &Store, basic: &GenerateBasic, access: &str, refresh: &str) {
        let mut record = TokenRecord::new(&basic.client_id, &basic.user_id, &basic.scope)
            .with_access(access, basic.created_at, Duration::from_secs(60));
        if !refresh.is_empty() {
            record = record.with_refresh(refresh, basic.created_at, Duration::from_secs(600));
        }
        store.create(record).await.unwrap();
    }

    #[test]
    fn test_random_token_shape() {
        let token = random_token();
        assert!(is_opaque_token(&token));
        assert_ne!(token, random_token());
        assert!(!is_opaque_token("a.b.c"));
        assert!(!is_opaque_token(&"x".repeat(44)));
    }

    #[tokio::test]
    async fn test_reuses_live_grant() {
        let clock = ManualClock::new(Utc::now());
        let store = memory_store(&clock);
        let generator = OpaqueGenerator::new(store.clone(), Arc::new(clock.clone()), true, true);
        let basic = GenerateBasic::new("c1", "u1", "app", clock.now());

        let (access, refresh) = generator.generate(&basic, true).await.unwrap();
        persist(&store, &basic, &access, &refresh).await;

        let again = generator.generate(&basic, true).await.unwrap();
        assert_eq!(again, (access.clone(), refresh.clone()));

        // access expired, refresh still alive
        clock.advance(Duration::from_secs(61));
        let (rotated, kept) = generator.generate(&basic, true).await.unwrap();
        assert_ne!(rotated, access);
        assert_eq!(kept, refresh);
    }

    #[tokio::test]
    async fn test_reuse_disabled_always_mints() {
        let clock = ManualClock::new(Utc::now());
        let store = memory_store(&clock);
        let generator = OpaqueGenerator::new(store.clone(), Arc::new(clock.clone()), false, false);
        let basic = GenerateBasic::new("c1", "u1", "app", clock.now());

        let (access, refresh) = generator.generate(&basic, true).await.unwrap();
        persist(&store, &basic, &access, &refresh).await;

        let (access2, refresh2) = generator.generate(&basic, true).await.unwrap();
        assert_ne!(access, access2);
        assert_ne!(refresh, refresh2);
    }

    #[tokio::test]
    async fn test_refresh_reuse_only() {
        let clock = ManualClock::new(Utc::now());
        let store = memory_store(&clock);
        let generator = OpaqueGenerator::new(store.clone(), Arc::new(clock.clone()), false, true);
        let basic = GenerateBasic::new("c1", "u1", "app", clock.now());

        let (access, refresh) = generator.generate(&basic, true).await.unwrap();
        persist(&store, &basic, &access, &refresh).await;

        let (access2, refresh2) = generator.generate(&basic, true).await.unwrap();
        assert_ne!(access, access2);
        assert_eq!(refresh, refresh2);
    }

    #[tokio::test]
    async fn test_without_refresh() {
        let clock = ManualClock::new(Utc::now());
        let store = memory_store(&clock);
        let generator = OpaqueGenerator::new(store.clone(), Arc::new(clock.clone()), true, true);
        let basic = GenerateBasic::new("c1", "u1", "app", clock.now());

        let (access, refresh) = generator.generate(&basic, false).await.unwrap();
        assert!(refresh.is_empty());
        persist(&store, &basic, &access, "").await;

        let (again, _) = generator.generate(&basic, false).await.unwrap();
        assert_eq!(again, access);
    }
}
