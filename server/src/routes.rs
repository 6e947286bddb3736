//! Code execution endpoint
//!
//! Accepts a snippet of Python code, runs it through the execution
//! supervisor, and returns the normalized outcome. Every way the child
//! process can end (clean exit, non-zero exit, timeout kill, failed
//! launch) is a successful request/response cycle; the only client error
//! is submitting no code at all.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use executor::DEFAULT_TIMEOUT;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

/// Request body for POST /execute
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    /// Python source to run. A missing field is treated the same as an
    /// empty one: rejected before the supervisor is invoked.
    #[serde(default)]
    pub code: String,
}

/// Error response format
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

/// POST /execute
///
/// Body: `{"code": "<python source>"}`
///
/// Returns 200 with `{"stdout", "stderr", "exit_code", "timed_out"}` for
/// every execution that was attempted, including timeouts and launch
/// failures, or 400 when `code` is absent or blank.
pub async fn execute(Json(request): Json<ExecuteRequest>) -> Response {
    if request.code.trim().is_empty() {
        warn!("Rejected execute request with empty code");
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Code must not be empty".to_string(),
                code: "EMPTY_CODE".to_string(),
            }),
        )
            .into_response();
    }

    debug!("Executing {}-byte snippet", request.code.len());

    let outcome = executor::execute(&request.code, DEFAULT_TIMEOUT).await;

    info!(
        exit_code = outcome.exit_code,
        timed_out = outcome.timed_out,
        "Execution finished"
    );

    (StatusCode::OK, Json(outcome)).into_response()
}

/// GET /
///
/// Static informational payload; not part of the execution contract.
pub async fn service_info() -> Response {
    Json(json!({
        "service": "sandbox-execution-server",
        "message": "POST {\"code\": \"...\"} to /execute"
    }))
    .into_response()
}
