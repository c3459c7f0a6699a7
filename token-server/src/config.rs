use config::{Config as ConfigCrate, ConfigError};
use serde::Deserialize;
use token_store::TokenConfig;

/// Main configuration structure for the token server
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// The port the server will listen to (default: 7780)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Token lifecycle configuration (strategy, lifetimes, signing, store)
    #[serde(default)]
    pub token: TokenConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: default_port(),
            token: TokenConfig::default(),
        }
    }
}

fn default_port() -> u16 {
    7780
}

impl Settings {
    /// Loads settings from `TOKEN_*` environment variables. Nested keys use
    /// `__`, e.g. `TOKEN_TOKEN__STORE__BACKEND=redis`.
    pub fn new() -> Result<Self, String> {
        ConfigCrate::builder()
            .add_source(
                config::Environment::with_prefix("TOKEN")
                    .prefix_separator("_")
                    .separator("__")
                    .convert_case(config::Case::Snake),
            )
            .build()
            .map_err(|e: ConfigError| e.to_string())?
            .try_deserialize()
            .map_err(|e| e.to_string())
    }
}
