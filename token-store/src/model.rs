//! The token record shared by every backend, the generator and the resolver.

use crate::error::{Result, TokenError};
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One issued authorization grant.
///
/// Serialized with the field names used on the wire and inside the database
/// and cache payloads. Lifetimes are whole seconds; a zero lifetime means the
/// value does not expire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenRecord {
    #[serde(rename = "clientID", default)]
    pub client_id: String,
    #[serde(rename = "userID", default)]
    pub user_id: String,
    #[serde(default)]
    pub scope: String,
    #[serde(
        rename = "redirectURI",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub redirect_uri: String,

    #[serde(default)]
    pub code: String,
    #[serde(rename = "codeCreateAt", default)]
    pub code_created_at: DateTime<Utc>,
    #[serde(rename = "codeExpiresIn", with = "duration_secs", default)]
    pub code_expires_in: Duration,

    #[serde(default)]
    pub access: String,
    #[serde(rename = "accessCreateAt", default)]
    pub access_created_at: DateTime<Utc>,
    #[serde(rename = "accessExpiresIn", with = "duration_secs", default)]
    pub access_expires_in: Duration,

    #[serde(default)]
    pub refresh: String,
    #[serde(rename = "refreshCreateAt", default)]
    pub refresh_created_at: DateTime<Utc>,
    #[serde(rename = "refreshExpiresIn", with = "duration_secs", default)]
    pub refresh_expires_in: Duration,
}

impl TokenRecord {
    pub fn new(
        client_id: impl Into<String>,
        user_id: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            user_id: user_id.into(),
            scope: scope.into(),
            ..Default::default()
        }
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = redirect_uri.into();
        self
    }

    pub fn with_access(
        mut self,
        access: impl Into<String>,
        created_at: DateTime<Utc>,
        expires_in: Duration,
    ) -> Self {
        self.access = access.into();
        self.access_created_at = created_at;
        self.access_expires_in = expires_in;
        self
    }

    pub fn with_refresh(
        mut self,
        refresh: impl Into<String>,
        created_at: DateTime<Utc>,
        expires_in: Duration,
    ) -> Self {
        self.refresh = refresh.into();
        self.refresh_created_at = created_at;
        self.refresh_expires_in = expires_in;
        self
    }

    pub fn with_code(
        mut self,
        code: impl Into<String>,
        created_at: DateTime<Utc>,
        expires_in: Duration,
    ) -> Self {
        self.code = code.into();
        self.code_created_at = created_at;
        self.code_expires_in = expires_in;
        self
    }

    /// Who the grant was issued to, without any token values.
    pub fn authentication(&self) -> Authentication {
        Authentication {
            client_id: self.client_id.clone(),
            user_id: self.user_id.clone(),
            scope: self.scope.clone(),
            redirect_uri: self.redirect_uri.clone(),
        }
    }

    /// The Authentication Fingerprint of this grant's (user, client, scope).
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.user_id, &self.client_id, &self.scope)
    }

    pub fn access_expires_at(&self) -> Option<DateTime<Utc>> {
        expires_at(&self.access, self.access_created_at, self.access_expires_in)
    }

    pub fn refresh_expires_at(&self) -> Option<DateTime<Utc>> {
        expires_at(&self.refresh, self.refresh_created_at, self.refresh_expires_in)
    }

    pub fn code_expires_at(&self) -> Option<DateTime<Utc>> {
        expires_at(&self.code, self.code_created_at, self.code_expires_in)
    }

    pub fn is_access_expired(&self, now: DateTime<Utc>) -> bool {
        self.access_expires_at().is_some_and(|at| now >= at)
    }

    pub fn is_refresh_expired(&self, now: DateTime<Utc>) -> bool {
        self.refresh_expires_at().is_some_and(|at| now >= at)
    }

    pub fn is_code_expired(&self, now: DateTime<Utc>) -> bool {
        self.code_expires_at().is_some_and(|at| now >= at)
    }

    /// When the whole grant stops being usable: the later of the access and
    /// refresh expiries. `None` if either side never expires.
    pub fn grant_expires_at(&self) -> Option<DateTime<Utc>> {
        let access = self.access_expires_at();
        if self.refresh.is_empty() {
            return access;
        }
        let refresh = self.refresh_expires_at();
        match (access, refresh) {
            (Some(a), Some(r)) => Some(a.max(r)),
            _ => None,
        }
    }

    /// Checks the record before it is written to a store.
    pub fn validate(&self) -> Result<()> {
        if self.access.is_empty() && self.code.is_empty() {
            return Err(TokenError::InvalidRecord(
                "record carries neither an access token nor a code".to_string(),
            ));
        }
        if self.access.is_empty() && !self.refresh.is_empty() {
            return Err(TokenError::InvalidRecord(
                "refresh token without an access token".to_string(),
            ));
        }
        if !self.refresh.is_empty() {
            let outlives = match (self.access_expires_at(), self.refresh_expires_at()) {
                (_, None) => true,
                (None, Some(_)) => false,
                (Some(access), Some(refresh)) => refresh >= access,
            };
            if !outlives {
                return Err(TokenError::InvalidRecord(
                    "refresh token expires before the access token it renews".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// The principal side of a grant, stored next to token entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    pub scope: String,
    #[serde(rename = "redirectURI", default)]
    pub redirect_uri: String,
}

fn expires_at(value: &str, created_at: DateTime<Utc>, expires_in: Duration) -> Option<DateTime<Utc>> {
    if value.is_empty() || expires_in.is_zero() {
        return None;
    }
    Some(add_duration(created_at, expires_in))
}

/// Saturating `DateTime + Duration`.
pub(crate) fn add_duration(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Lifetime left until `expires_at`. `None` means no expiry; an instant in
/// the past yields zero.
pub(crate) fn remaining(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
    expires_at.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
