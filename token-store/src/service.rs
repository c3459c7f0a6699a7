use crate::clock::{Clock, SystemClock};
use crate::config::{TokenConfig, TokenStrategy};
use crate::error::{Result, TokenError};
use crate::generator::opaque::{random_token, OpaqueGenerator};
use crate::generator::signed::{SignedGenerator, SigningKeys};
use crate::generator::{GenerateBasic, Generator, TokenGenerator};
use crate::model::{remaining, TokenRecord};
use crate::resolver::{Resolver, SignedResolver, StoreResolver, TokenResolver};
use crate::store::{create_store, Store, TokenStore};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

/// The token subsystem of one process: store, generator and resolver built
/// once from a [`TokenConfig`] and shared by reference.
///
/// The generator and resolver always come from the same
/// [`TokenStrategy`], so every issued token can be resolved.
#[derive(Clone)]
pub struct TokenService {
    config: Arc<TokenConfig>,
    clock: Arc<dyn Clock>,
    store: Store,
    generator: Generator,
    resolver: Resolver,
}

impl TokenService {
    pub async fn from_config(config: TokenConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(config: TokenConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = create_store(&config.store, clock.clone()).await?;
        Self::with_store(config, store, clock)
    }

    /// Builds the service around an already constructed store.
    pub fn with_store(config: TokenConfig, store: Store, clock: Arc<dyn Clock>) -> Result<Self> {
        check_lifetimes(&config)?;

        let (generator, resolver) = match config.strategy {
            TokenStrategy::Signed => {
                let keys = Arc::new(SigningKeys::from_config(&config.signing)?);
                info!("Issuing signed tokens ({:?})", keys.algorithm());
                (
                    Generator::Signed(SignedGenerator::new(keys.clone(), config.access_expires_in())),
                    Resolver::Signed(SignedResolver::new(keys, clock.clone())),
                )
            }
            TokenStrategy::Opaque => {
                info!("Issuing opaque tokens");
                (
                    Generator::Opaque(OpaqueGenerator::new(
                        store.clone(),
                        clock.clone(),
                        config.reuse_access_token,
                        config.reuse_refresh_token,
                    )),
                    Resolver::Store(StoreResolver::new(store.clone(), clock.clone())),
                )
            }
        };

        Ok(Self {
            config: Arc::new(config),
            clock,
            store,
            generator,
            resolver,
        })
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    pub fn strategy(&self) -> TokenStrategy {
        self.config.strategy
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Generates tokens for an authorized request and persists them.
    pub async fn issue(&self, basic: &GenerateBasic, want_refresh: bool) -> Result<TokenRecord> {
        let (access, refresh) = self.generator.generate(basic, want_refresh).await?;
        let mut record = TokenRecord::new(&basic.client_id, &basic.user_id, &basic.scope)
            .with_redirect_uri(&basic.redirect_uri)
            .with_access(access, basic.created_at, self.config.access_expires_in());
        if !refresh.is_empty() {
            record = record.with_refresh(refresh, basic.created_at, self.config.refresh_expires_in());
        }
        self.store.create(record).await
    }

    /// Mints and stores a single-use authorization code.
    pub async fn issue_code(&self, basic: &GenerateBasic) -> Result<TokenRecord> {
        let record = TokenRecord::new(&basic.client_id, &basic.user_id, &basic.scope)
            .with_redirect_uri(&basic.redirect_uri)
            .with_code(random_token(), basic.created_at, self.config.code_expires_in());
        self.store.create(record).await
    }

    /// Exchanges a code for an access/refresh pair. The code is deleted
    /// before the pair is issued, or on a redirect mismatch, so a second
    /// exchange fails with [`TokenError::NotFound`].
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenRecord> {
        let record = self.store.get_by_code(code).await?;
        let now = self.clock.now();
        if record.is_code_expired(now) {
            self.store.remove_by_code(code).await?;
            return Err(TokenError::Expired);
        }
        if record.redirect_uri != redirect_uri {
            // a misused code is spent
            self.store.remove_by_code(code).await?;
            return Err(TokenError::InvalidToken("redirect uri mismatch".to_string()));
        }
        self.store.remove_by_code(code).await?;

        let basic = GenerateBasic::new(record.client_id, record.user_id, record.scope, now)
            .with_redirect_uri(record.redirect_uri);
        self.issue(&basic, true).await
    }

    /// Renews the access token of the grant holding `refresh`.
    ///
    /// With refresh reuse on, the refresh token keeps its original lifetime
    /// and only the access token is re-dated. Otherwise a new refresh token
    /// is minted and the presented one revoked.
    pub async fn refresh(&self, refresh: &str) -> Result<TokenRecord> {
        let current = self.store.get_by_refresh(refresh).await?;
        let now = self.clock.now();
        if current.is_refresh_expired(now) {
            return Err(TokenError::Expired);
        }

        let basic = GenerateBasic::new(
            &current.client_id,
            &current.user_id,
            &current.scope,
            now,
        )
        .with_redirect_uri(&current.redirect_uri);

        let record = TokenRecord::new(&basic.client_id, &basic.user_id, &basic.scope)
            .with_redirect_uri(&basic.redirect_uri);
        let record = if self.config.reuse_refresh_token {
            let mut access_expires_in = self.config.access_expires_in();
            if let Some(left) = remaining(current.refresh_expires_at(), now) {
                if access_expires_in.is_zero() || access_expires_in > left {
                    access_expires_in = left;
                }
            }
            let access = self.fresh_access(&basic, access_expires_in).await?;
            record.with_access(access, now, access_expires_in).with_refresh(
                refresh,
                current.refresh_created_at,
                current.refresh_expires_in,
            )
        } else {
            let (access, minted) = self.generator.generate(&basic, true).await?;
            record
                .with_access(access, now, self.config.access_expires_in())
                .with_refresh(minted, now, self.config.refresh_expires_in())
        };

        let created = self.store.create(record).await?;
        if created.refresh != refresh {
            debug!("Revoking superseded refresh token of client {}", created.client_id);
            ignore_not_found(self.store.remove_by_refresh(refresh).await)?;
        }
        Ok(created)
    }

    /// Resolves a bearer token. Callers facing a client must collapse every
    /// [`TokenError::is_unauthorized`] error into one response.
    pub async fn resolve(&self, token: &str) -> Result<TokenRecord> {
        self.resolver.resolve(token).await
    }

    pub async fn revoke_access(&self, access: &str) -> Result<()> {
        self.store.remove_by_access(access).await
    }

    pub async fn revoke_refresh(&self, refresh: &str) -> Result<()> {
        self.store.remove_by_refresh(refresh).await
    }

    /// Revokes `token` whether it is an access or a refresh token.
    pub async fn revoke(&self, token: &str) -> Result<()> {
        match self.store.remove_by_access(token).await {
            Err(TokenError::NotFound) => self.store.remove_by_refresh(token).await,
            other => other,
        }
    }

    /// A new access value that never reuses the live one. Signed tokens
    /// carry `expires_in` in their `exp` claim.
    async fn fresh_access(&self, basic: &GenerateBasic, expires_in: Duration) -> Result<String> {
        match &self.generator {
            Generator::Opaque(_) => Ok(random_token()),
            Generator::Signed(generator) => generator.sign_access(basic, expires_in),
        }
    }
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(TokenError::NotFound) => Ok(()),
        other => other,
    }
}

/// A refresh token must be able to outlive the access tokens it renews.
fn check_lifetimes(config: &TokenConfig) -> Result<()> {
    let access = config.access_token_expire_secs;
    let refresh = config.refresh_token_expire_secs;
    let refresh_outlives = refresh == 0 || (access != 0 && refresh >= access);
    if !refresh_outlives {
        return Err(TokenError::Configuration(format!(
            "refresh token lifetime ({refresh}s) is shorter than the access token lifetime ({access}s)"
        )));
    }
    Ok(())
}
