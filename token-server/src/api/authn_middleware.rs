use crate::errors::ApiError;
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use log::debug;

/// Resolves the `Authorization: Bearer` token and stores the record in the
/// request extensions. Every failure answers the same 401.
pub(super) async fn bearer_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let token = match bearer_token(&request) {
        Some(token) => token,
        None => {
            debug!("Missing or malformed bearer Authorization header");
            return ApiError::unauthorized().into_response();
        }
    };

    match state.tokens.resolve(&token).await {
        Ok(record) => {
            request.extensions_mut().insert(record);
            next.run(request).await
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}

fn bearer_token(request: &Request<Body>) -> Option<String> {
    let header = request.headers().get(http::header::AUTHORIZATION)?;
    let value = header.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    Some(token.to_string())
}
