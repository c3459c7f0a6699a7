//! Self-contained JWT access tokens.

use super::{GenerateBasic, TokenGenerator};
use crate::config::SigningConfig;
use crate::error::{Result, TokenError};
use crate::model::add_duration;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Claim set carried by a signed access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub scope: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub redirect_uri: String,
    /// Client id
    pub aud: String,
    /// User id
    pub sub: String,
    pub iat: i64,
    /// Absent when the access token never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// Key pair for one JWS algorithm.
#[derive(Clone)]
pub struct SigningKeys {
    algorithm: Algorithm,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SigningKeys {
    /// Parses the configured algorithm and key material.
    ///
    /// Any problem here is a [`TokenError::Configuration`]; the process is
    /// expected to refuse to start.
    pub fn from_config(config: &SigningConfig) -> Result<Self> {
        let algorithm = Algorithm::from_str(&config.algorithm).map_err(|_| {
            TokenError::Configuration(format!("unknown signing algorithm {:?}", config.algorithm))
        })?;

        let (encoding, decoding) = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                if config.secret.is_empty() {
                    return Err(TokenError::Configuration(format!(
                        "{:?} requires a signing secret",
                        algorithm
                    )));
                }
                (
                    EncodingKey::from_secret(config.secret.as_bytes()),
                    DecodingKey::from_secret(config.secret.as_bytes()),
                )
            }
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
                let encoding = EncodingKey::from_rsa_pem(config.private_key_pem.as_bytes())
                    .map_err(|err| {
                        TokenError::Configuration(format!("invalid RSA private key: {}", err))
                    })?;
                let decoding = DecodingKey::from_rsa_pem(config.public_key_pem.as_bytes())
                    .map_err(|err| {
                        TokenError::Configuration(format!("invalid RSA public key: {}", err))
                    })?;
                (encoding, decoding)
            }
            other => {
                return Err(TokenError::Configuration(format!(
                    "unsupported signing algorithm {:?}",
                    other
                )))
            }
        };

        Ok(Self {
            algorithm,
            encoding,
            decoding,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }

    /// Signature and structure checks only; `exp` is checked by the caller
    /// against its own clock.
    pub(crate) fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.required_spec_claims.clear();
        validation
    }
}

#[derive(Clone)]
pub struct SignedGenerator {
    keys: Arc<SigningKeys>,
    access_expires_in: Duration,
}

impl SignedGenerator {
    pub fn new(keys: Arc<SigningKeys>, access_expires_in: Duration) -> Self {
        Self {
            keys,
            access_expires_in,
        }
    }

    fn claims(basic: &GenerateBasic, expires_in: Duration) -> Claims {
        let exp = if expires_in.is_zero() {
            None
        } else {
            Some(add_duration(basic.created_at, expires_in).timestamp())
        };
        Claims {
            scope: basic.scope.clone(),
            redirect_uri: basic.redirect_uri.clone(),
            aud: basic.client_id.clone(),
            sub: basic.user_id.clone(),
            iat: basic.created_at.timestamp(),
            exp,
        }
    }

    /// Signs an access token whose `exp` is `expires_in` after
    /// `basic.created_at` instead of the configured lifetime. Zero means
    /// no `exp` claim.
    pub fn sign_access(&self, basic: &GenerateBasic, expires_in: Duration) -> Result<String> {
        let header = Header::new(self.keys.algorithm);
        encode(&header, &Self::claims(basic, expires_in), &self.keys.encoding)
            .map_err(|err| TokenError::Configuration(format!("failed to sign token: {}", err)))
    }
}

/// Refresh value for a signed access token: HMAC-SHA256 of the token under
/// a fresh random key. It carries no claims and is only valid through the
/// store.
fn refresh_for(access: &str) -> Result<String> {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&key)
        .map_err(|err| TokenError::Configuration(format!("refresh key: {}", err)))?;
    mac.update(access.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl TokenGenerator for SignedGenerator {
    async fn generate(&self, basic: &GenerateBasic, want_refresh: bool) -> Result<(String, String)> {
        let access = self.sign_access(basic, self.access_expires_in)?;
        let refresh = if want_refresh {
            refresh_for(&access)?
        } else {
            String::new()
        };
        Ok((access, refresh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn hs_config(secret: &str) -> SigningConfig {
        SigningConfig {
            algorithm: "HS256".to_string(),
            secret: secret.to_string(),
            ..Default::default()
        }
    }

    fn basic() -> GenerateBasic {
        GenerateBasic::new("c1", "u1", "app", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .with_redirect_uri("https://client.example/cb")
    }

    #[test]
    fn test_missing_secret_is_configuration_error() {
        assert!(matches!(
            SigningKeys::from_config(&hs_config("")),
            Err(TokenError::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_algorithm_is_configuration_error() {
        let config = SigningConfig {
            algorithm: "XS999".to_string(),
            ..hs_config("s3cret")
        };
        assert!(matches!(
            SigningKeys::from_config(&config),
            Err(TokenError::Configuration(_))
        ));
    }

    #[test]
    fn test_bad_rsa_pem_is_configuration_error() {
        let config = SigningConfig {
            algorithm: "RS256".to_string(),
            private_key_pem: "not a key".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            SigningKeys::from_config(&config),
            Err(TokenError::Configuration(_))
        ));
    }

    #[test]
    fn test_claims_layout() {
        let claims = SignedGenerator::claims(&basic(), Duration::from_secs(3600));

        assert_eq!(claims.aud, "c1");
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.exp, Some(claims.iat + 3600));
        assert_eq!(SignedGenerator::claims(&basic(), Duration::ZERO).exp, None);
    }

    #[test]
    fn test_sign_access_uses_given_lifetime() {
        let keys = Arc::new(SigningKeys::from_config(&hs_config("s3cret")).unwrap());
        let generator = SignedGenerator::new(keys.clone(), Duration::from_secs(3600));

        let access = generator
            .sign_access(&basic(), Duration::from_secs(10))
            .unwrap();
        let claims = jsonwebtoken::decode::<Claims>(&access, keys.decoding_key(), &keys.validation())
            .unwrap()
            .claims;
        assert_eq!(claims.exp, Some(claims.iat + 10));
    }

    #[tokio::test]
    async fn test_generate_access_and_refresh() {
        let keys = Arc::new(SigningKeys::from_config(&hs_config("s3cret")).unwrap());
        let generator = SignedGenerator::new(keys, Duration::from_secs(3600));

        let (access, refresh) = generator.generate(&basic(), true).await.unwrap();
        assert_eq!(access.split('.').count(), 3);
        assert_eq!(refresh.len(), 43);

        let (_, again) = generator.generate(&basic(), true).await.unwrap();
        assert_ne!(refresh, again);

        let (_, none) = generator.generate(&basic(), false).await.unwrap();
        assert!(none.is_empty());
    }
}
