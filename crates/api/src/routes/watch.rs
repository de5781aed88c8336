//! Long-poll watch handler.

use axum::{extract::State, Json};
use engine_core::WatchResponse;
use tracing::debug;

use crate::extractors::RequestParams;
use crate::state::AppState;

/// Watch id used when a request names none.
pub const DEFAULT_WATCH_ID: &str = "defId";

/// GET|POST /watch
///
/// Holds the request until something is published for the watcher or the
/// configured wait elapses. `session-id` is accepted but does not filter.
pub async fn watch_handler(
    State(state): State<AppState>,
    mut params: RequestParams,
) -> Json<WatchResponse> {
    let watch_id = params
        .take_str(&["watch-id", "id"])
        .unwrap_or_else(|| DEFAULT_WATCH_ID.to_string());
    let session_id = params.take_str(&["session-id"]);

    debug!(watch_id = %watch_id, session_id = ?session_id, "Watch request");

    let items = state
        .fanout
        .poll(&watch_id, state.config.watch_max_wait())
        .await;

    Json(WatchResponse::new(items))
}
