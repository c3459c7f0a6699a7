use crate::create_app;
use crate::state::AppState;
use axum::body::Body;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

/// Sends `request` through a fresh app over `state`, returning the status
/// and the body parsed as JSON (`{}` when empty or not JSON).
pub(crate) async fn send(state: AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = create_app(state)
        .oneshot(request)
        .await
        .expect("Failed to send request");

    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read response body")
        .to_bytes();

    let json = if !body.is_empty() {
        serde_json::from_slice(&body).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };
    (status, json)
}

/// A form-encoded POST
pub(crate) fn form_request(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .expect("Failed to build request")
}

/// A GET with an optional raw `Authorization` header
pub(crate) fn get_request(uri: &str, authorization: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(value) = authorization {
        builder = builder.header(AUTHORIZATION, value);
    }
    builder.body(Body::empty()).expect("Failed to build request")
}
