//! Scheduler RPC endpoint.
//!
//! Each scheduler operation is exposed as `POST /v1/rpc/:method` with the
//! operation's parameters as the JSON body. Clients that retry should send
//! an `x-request-id` header; a repeated id with the same body is answered
//! from the scheduler's recent responses instead of running again.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::Value;

use lustre_manager_scheduler::SchedulerRpc;

use crate::error::ApiError;
use crate::state::GatewayState;

/// Header carrying the caller's idempotency key.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Invoke a scheduler operation.
///
/// # Example
///
/// ```text
/// POST /v1/rpc/set_state
/// x-request-id: 6f1c...
///
/// {"requests": [{"class_tag": "lnet_configuration", "id": 3, "state": "lnet_down"}],
///  "message": "Stop LNet"}
///
/// Response: 200 OK
/// {"id": 12, "message": "Stop LNet", "jobs": [40], ...}
/// ```
pub async fn call<S>(
    State(state): State<Arc<GatewayState<S>>>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError>
where
    S: SchedulerRpc + 'static,
{
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .map(|v| {
            v.to_str()
                .map_err(|_| ApiError::BadRequest(format!("{REQUEST_ID_HEADER} is not valid text")))
        })
        .transpose()?;

    let params = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))?
    };

    tracing::debug!(method = %method, request_id = ?request_id, "Scheduler call");
    let response = state.scheduler.call(&method, request_id, params).await?;
    Ok(Json(response))
}
