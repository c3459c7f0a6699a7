use crate::errors::ApiError;
use crate::openapi::TOKEN_TAG;
use crate::state::AppState;
use axum::{
    extract::{Form, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use token_store::{TokenError, TokenRecord, TokenStore};
use utoipa::ToSchema;

/// Form body of the introspection and revocation endpoints
#[derive(Debug, Deserialize, ToSchema)]
pub struct TokenForm {
    /// The token to introspect or revoke
    #[serde(default)]
    pub token: String,
    /// `access_token` or `refresh_token`; only used as a lookup order hint
    #[serde(default)]
    pub token_type_hint: Option<String>,
}

/// RFC 7662 introspection response
#[derive(Debug, Default, Serialize, ToSchema)]
pub struct IntrospectionResponse {
    /// Whether the token is active
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// The user the token was issued to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Issued at (Unix time)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Expiration (Unix time), absent for tokens that never expire
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl IntrospectionResponse {
    fn inactive() -> Self {
        Self::default()
    }

    fn active(
        token_type: &str,
        record: &TokenRecord,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            active: true,
            token_type: Some(token_type.to_string()),
            client_id: Some(record.client_id.clone()),
            sub: Some(record.user_id.clone()),
            scope: Some(record.scope.clone()),
            iat: Some(created_at.timestamp()),
            exp: expires_at.map(|at| at.timestamp()),
        }
    }
}

/// The record behind the bearer token of the request
#[derive(Debug, Serialize, ToSchema)]
pub struct TokenInfo {
    pub client_id: String,
    pub user_id: String,
    pub scope: String,
    /// Seconds left before the access token expires, absent if it never does
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}

/// OAuth 2.0 Token Introspection endpoint (RFC 7662)
#[utoipa::path(
    post,
    path = "/introspect",
    tag = TOKEN_TAG,
    request_body(content = TokenForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Token state", body = IntrospectionResponse),
        (status = 400, description = "Missing token parameter"),
        (status = 503, description = "Token store unavailable")
    )
)]
pub(crate) async fn introspect(
    State(state): State<AppState>,
    Form(form): Form<TokenForm>,
) -> Result<Json<IntrospectionResponse>, ApiError> {
    if form.token.is_empty() {
        return Err(ApiError::bad_request("token parameter is required"));
    }

    let refresh_first = form.token_type_hint.as_deref() == Some("refresh_token");
    let response = if refresh_first {
        match introspect_refresh(&state, &form.token).await? {
            Some(response) => response,
            None => introspect_access(&state, &form.token).await?,
        }
    } else {
        let response = introspect_access(&state, &form.token).await?;
        if response.active {
            response
        } else {
            introspect_refresh(&state, &form.token)
                .await?
                .unwrap_or_else(IntrospectionResponse::inactive)
        }
    };
    Ok(Json(response))
}

async fn introspect_access(
    state: &AppState,
    token: &str,
) -> Result<IntrospectionResponse, ApiError> {
    match state.tokens.resolve(token).await {
        Ok(record) => Ok(IntrospectionResponse::active(
            "access_token",
            &record,
            record.access_created_at,
            record.access_expires_at(),
        )),
        Err(err) if err.is_unauthorized() => {
            debug!("Introspected access token is not active");
            Ok(IntrospectionResponse::inactive())
        }
        Err(err) => Err(err.into()),
    }
}

async fn introspect_refresh(
    state: &AppState,
    token: &str,
) -> Result<Option<IntrospectionResponse>, ApiError> {
    match state.tokens.store().get_by_refresh(token).await {
        Ok(record) if !record.is_refresh_expired(state.tokens.clock().now()) => {
            Ok(Some(IntrospectionResponse::active(
                "refresh_token",
                &record,
                record.refresh_created_at,
                record.refresh_expires_at(),
            )))
        }
        Ok(_) => Ok(None),
        Err(err) if err.is_unauthorized() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// OAuth 2.0 Token Revocation endpoint (RFC 7009)
#[utoipa::path(
    post,
    path = "/revoke",
    tag = TOKEN_TAG,
    request_body(content = TokenForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Token revoked, or it was not known"),
        (status = 400, description = "Missing token parameter"),
        (status = 503, description = "Token store unavailable")
    )
)]
pub(crate) async fn revoke(
    State(state): State<AppState>,
    Form(form): Form<TokenForm>,
) -> Result<StatusCode, ApiError> {
    if form.token.is_empty() {
        return Err(ApiError::bad_request("token parameter is required"));
    }

    let result = if form.token_type_hint.as_deref() == Some("refresh_token") {
        match state.tokens.revoke_refresh(&form.token).await {
            Err(TokenError::NotFound) => state.tokens.revoke_access(&form.token).await,
            other => other,
        }
    } else {
        state.tokens.revoke(&form.token).await
    };

    match result {
        Ok(()) => Ok(StatusCode::OK),
        // unknown tokens are not an error for the client
        Err(err) if err.is_unauthorized() => Ok(StatusCode::OK),
        Err(err) => Err(err.into()),
    }
}

/// Describes the bearer token of the request
#[utoipa::path(
    get,
    path = "/tokeninfo",
    tag = TOKEN_TAG,
    responses(
        (status = 200, description = "Token details", body = TokenInfo),
        (status = 401, description = "Missing, unknown, expired or invalid token")
    )
)]
pub(crate) async fn token_info(
    State(state): State<AppState>,
    Extension(record): Extension<TokenRecord>,
) -> Json<TokenInfo> {
    let now = state.tokens.clock().now();
    let expires_in = record
        .access_expires_at()
        .map(|at| (at - now).num_seconds().max(0));
    Json(TokenInfo {
        client_id: record.client_id,
        user_id: record.user_id,
        scope: record.scope,
        expires_in,
    })
}
