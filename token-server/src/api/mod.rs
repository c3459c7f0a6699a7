mod authn_middleware;
pub(crate) mod health;
pub(crate) mod token;

use crate::api::authn_middleware::bearer_middleware;
use crate::state::AppState;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};

/// Combines all API routes into a single router
pub(super) fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .route("/introspect", post(token::introspect))
        .route("/revoke", post(token::revoke))
        .merge(protected_routes(state))
}

/// Routes that require a valid bearer access token
fn protected_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/tokeninfo", get(token::token_info))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            bearer_middleware,
        ))
}
