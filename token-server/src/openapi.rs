use crate::state::AppState;
use axum::{routing::get, Json, Router};
use utoipa::OpenApi;

pub(crate) const HEALTH_TAG: &str = "Health API";
pub(crate) const TOKEN_TAG: &str = "Token API";

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::health::health_check,
        crate::api::token::introspect,
        crate::api::token::revoke,
        crate::api::token::token_info,
    ),
    components(schemas(
        crate::api::health::Health,
        crate::api::token::TokenForm,
        crate::api::token::IntrospectionResponse,
        crate::api::token::TokenInfo,
    )),
    tags(
        (name = HEALTH_TAG, description = "Health check endpoints"),
        (name = TOKEN_TAG, description = "Token introspection and revocation endpoints"),
    ),
    info(
        title = "Token Server API",
        description = "OAuth2 access token introspection and revocation",
        version = "0.1.0"
    )
)]
pub(crate) struct ApiDoc;

/// Serves the generated OpenAPI document
async fn openapi_json_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Creates a router for OpenAPI documentation routes
pub(crate) fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(openapi_json_handler))
}
