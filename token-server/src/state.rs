use crate::config::Settings;
use std::sync::Arc;
use token_store::{TokenService, TokenStore};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub tokens: Arc<TokenService>,
}

impl AppState {
    /// Builds the one token service of this process from the settings
    pub async fn new(settings: Settings) -> token_store::Result<Self> {
        let tokens = TokenService::from_config(settings.token.clone()).await?;
        Ok(Self::with_service(settings, tokens))
    }

    pub fn with_service(settings: Settings, tokens: TokenService) -> Self {
        Self {
            settings: Arc::new(settings),
            tokens: Arc::new(tokens),
        }
    }

    /// Check if the token store is reachable
    pub async fn health_check(&self) -> Result<(), String> {
        self.tokens.store().health_check().await
    }
}
