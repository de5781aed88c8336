//! Upload endpoint handler.
//!
//! Accepts `{sessionId, clientId?, projectId?, payload: [...]}` with query
//! parameters merged over the body. The merged request is persisted as-is,
//! folded into the session table and published to watchers.

use axum::{extract::State, Json};
use engine_core::{Attribute, Error, UploadReceipt};
use serde_json::Value;
use std::time::Instant;
use telemetry::{health, metrics};
use tracing::{debug, error, info};

use crate::extractors::RequestParams;
use crate::response::ApiError;
use crate::state::AppState;

/// Session used when an upload names none.
pub const DEFAULT_SESSION_ID: &str = "defSession";

/// POST /upload
pub async fn upload_handler(
    State(state): State<AppState>,
    mut params: RequestParams,
) -> Result<Json<UploadReceipt>, ApiError> {
    let start = Instant::now();
    metrics().upload_requests.inc();

    let blob = params.to_value();

    let payload = match params.take("payload") {
        Some(Value::Array(items)) => items,
        _ => return Err(Error::no_payload("upload requires a payload array").into()),
    };
    let session_id = params
        .take_str(&["sessionId"])
        .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string());
    let client_id = params.take_str(&["clientId"]);

    let offered = payload.len();
    let attributes: Vec<Attribute> = payload
        .into_iter()
        .filter_map(|item| Attribute::from_value(item).ok())
        .map(|attribute| attribute.with_session_id(&session_id))
        .collect();

    if attributes.len() < offered {
        debug!(
            session_id = %session_id,
            skipped = offered - attributes.len(),
            "Skipped non-object payload items"
        );
    }

    let store_start = Instant::now();
    if let Err(e) = state.store.put(&session_id, &blob).await {
        metrics().store_errors.inc();
        health().store.set_unhealthy(e.to_string());
        error!(session_id = %session_id, error = %e, "Failed to store upload");
        let e = match e {
            Error::Storage(_) => e,
            other => Error::storage(other.to_string()),
        };
        return Err(e.into());
    }
    health().store.set_healthy();
    metrics()
        .store_latency_ms
        .observe(store_start.elapsed().as_millis() as u64);

    let attr_count = state
        .sessions
        .apply(&session_id, client_id.as_deref(), &attributes)
        .await;

    let count = attributes.len();
    metrics().attributes_received.inc_by(count as u64);
    state.fanout.publish_all(attributes);

    info!(
        session_id = %session_id,
        count = count,
        attr_count = attr_count,
        latency_ms = start.elapsed().as_millis() as u64,
        "Received upload"
    );

    Ok(Json(UploadReceipt {
        ok: true,
        count,
        attr_count,
    }))
}
