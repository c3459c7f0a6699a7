use axum::response::IntoResponse;
use axum::Json;
use http::StatusCode;
use log::{debug, error};
use serde_json::json;
use token_store::TokenError;

/// Body detail shared by every unauthorized outcome
pub const UNAUTHORIZED_DETAIL: &str = "unauthorized";

#[derive(Debug, Clone)]
pub struct ApiError {
    pub detail: String,
    pub status_code: StatusCode,
}

impl ApiError {
    /// Create a new ApiError with a detail message and status code
    pub fn new<S: ToString>(detail: S, status_code: StatusCode) -> Self {
        Self {
            detail: detail.to_string(),
            status_code,
        }
    }

    /// Create new Internal Server Error (500) with a detail message
    pub fn internal<S: ToString>(detail: S) -> Self {
        Self::new(detail, StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Create new Bad Request Error (400) with a detail message
    pub fn bad_request<S: ToString>(detail: S) -> Self {
        Self::new(detail, StatusCode::BAD_REQUEST)
    }

    /// Create new Unauthorized (401). The detail never varies.
    pub fn unauthorized() -> Self {
        Self::new(UNAUTHORIZED_DETAIL, StatusCode::UNAUTHORIZED)
    }

    /// Create new Service Unavailable (503) with a detail message
    pub fn unavailable<S: ToString>(detail: S) -> Self {
        Self::new(detail, StatusCode::SERVICE_UNAVAILABLE)
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        if err.is_unauthorized() {
            debug!("Rejecting token: {}", err);
            return Self::unauthorized();
        }
        error!("Token operation failed: {}", err);
        match err {
            TokenError::BackendUnavailable(_) => Self::unavailable("token store unavailable"),
            _ => Self::internal("internal error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status_code = self.status_code;
        let body = json!({
            "detail": self.detail,
        });
        (status_code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_kinds_share_one_response() {
        let errors = [
            TokenError::NotFound,
            TokenError::Expired,
            TokenError::InvalidToken("bad signature".to_string()),
        ];
        for err in errors {
            let api_error = ApiError::from(err);
            assert_eq!(api_error.status_code, StatusCode::UNAUTHORIZED);
            assert_eq!(api_error.detail, UNAUTHORIZED_DETAIL);
        }
    }

    #[test]
    fn test_backend_errors_map_to_503() {
        let api_error = ApiError::from(TokenError::BackendUnavailable("redis: down".to_string()));
        assert_eq!(api_error.status_code, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!api_error.detail.contains("redis"));
    }

    #[test]
    fn test_other_errors_map_to_500() {
        let api_error = ApiError::from(TokenError::Configuration("no key".to_string()));
        assert_eq!(api_error.status_code, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
