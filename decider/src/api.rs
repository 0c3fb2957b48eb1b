//! HTTP API.
//!
//! One machine-facing endpoint, `POST /v1/authorize`, plus a health
//! check. Errors use the envelope
//! `{"error":{"code":3,"status":"INVALID_ARGUMENT","message":…,"details":…}}`
//! with HTTP 400 (malformed identity), 403 (permanent denial) or 503
//! (transient upstream failure).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use autopolicy_common::Identity;

use crate::Decider;

/// Build the API router.
pub fn build_router(decider: Arc<Decider>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/authorize", post(authorize))
        .with_state(decider)
}

fn error_response(status: StatusCode, message: &str, details: Value) -> Response {
    let body = json!({
        "error": {
            "code": 3,
            "status": "INVALID_ARGUMENT",
            "message": message,
            "details": details,
        }
    });
    (status, Json(body)).into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn authorize(State(decider): State<Arc<Decider>>, body: Bytes) -> Response {
    let input: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "JSON parse error",
                Value::from(err.to_string()),
            )
        }
    };

    if !input.is_object() {
        return error_response(StatusCode::BAD_REQUEST, "invalid input", Value::Null);
    }

    let id = match Identity::from_value(&input).and_then(|id| {
        id.check_required()?;
        Ok(id)
    }) {
        Ok(id) => id,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid identity",
                Value::from(err.to_string()),
            )
        }
    };

    // verify it's not a downgrade attack; denial here is permanent
    let id = match decider.db.verify(id) {
        Ok(id) => id,
        Err(err) => return error_response(StatusCode::FORBIDDEN, &err.to_string(), Value::Null),
    };

    // fetch the traffic profile; failure here is worth a retry
    match decider.resolver.resolve(&id).await {
        Ok(profile) => Json(profile).into_response(),
        Err(err) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string(), Value::Null)
        }
    }
}
