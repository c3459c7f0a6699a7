use crate::openapi::HEALTH_TAG;
use crate::state::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::warn;
use serde::Serialize;
use utoipa::ToSchema;

/// Store health report
#[derive(Debug, Serialize, ToSchema)]
pub struct Health {
    status: String,
    backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip)]
    status_code: StatusCode,
}

impl IntoResponse for Health {
    fn into_response(self) -> Response {
        (self.status_code, Json(self)).into_response()
    }
}

/// Health check handler, probes the configured token store
#[utoipa::path(
    get,
    path = "/health",
    tag = HEALTH_TAG,
    responses(
        (status = 200, description = "Token store is reachable", body = Health),
        (status = 503, description = "Token store is unreachable", body = Health)
    )
)]
pub(crate) async fn health_check(State(state): State<AppState>) -> Health {
    let backend = state.tokens.store().backend().as_str().to_string();
    match state.health_check().await {
        Ok(()) => Health {
            status: "ok".to_string(),
            backend,
            error: None,
            status_code: StatusCode::OK,
        },
        Err(err) => {
            warn!("Token store {} failed its health check: {}", backend, err);
            Health {
                status: "error".to_string(),
                backend,
                error: Some(err),
                status_code: StatusCode::SERVICE_UNAVAILABLE,
            }
        }
    }
}

pub(super) fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

#[cfg(test)]
mod tests {
    use crate::state::tests::create_test_state;
    use crate::test_utils::{get_request, send};
    use chrono::Utc;
    use http::StatusCode;
    use token_store::ManualClock;

    #[tokio::test]
    async fn test_health_reports_backend() {
        let state = create_test_state(&ManualClock::new(Utc::now())).await;
        let (status, body) = send(state, get_request("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["backend"], "memory");
        assert!(body.get("error").is_none());
    }
}
