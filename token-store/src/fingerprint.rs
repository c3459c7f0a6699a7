//! Fixed-width digests used as lookup keys.
//!
//! Keys are hex SHA-256 digests, so raw token values never appear in key
//! names or log lines.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Idempotency key of one logical grant: `sha256(user_id + client_id + scope)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(user_id: &str, client_id: &str, scope: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(client_id.as_bytes());
        hasher.update(scope.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wraps an already computed fingerprint, e.g. one read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lookup key for a raw access, refresh or code value.
pub fn token_key(raw: &str) -> String {
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}

/// Shortened key for log lines.
pub(crate) fn short(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_hash_of_concatenation() {
        let fingerprint = Fingerprint::of("u1", "c1", "app");
        assert_eq!(fingerprint.as_str(), token_key("u1c1app"));
        assert_eq!(fingerprint.as_str().len(), 64);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(Fingerprint::of("u", "c", "s"), Fingerprint::of("u", "c", "s"));
        assert_ne!(Fingerprint::of("u", "c", "s"), Fingerprint::of("u", "c", "t"));
    }

    #[test]
    fn token_key_is_fixed_width() {
        assert_eq!(token_key("").len(), 64);
        assert_eq!(token_key(&"x".repeat(4096)).len(), 64);
        assert_ne!(token_key("a"), token_key("b"));
    }
}
