//! Session read endpoint.

use axum::{
    extract::{Path, State},
    Json,
};
use engine_core::{Error, Session};

use crate::response::ApiError;
use crate::state::AppState;

/// GET /sessions/:session_id - accumulated attribute table.
pub async fn session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .sessions
        .get(&session_id)
        .await
        .map(Json)
        .ok_or_else(|| Error::SessionNotFound(session_id).into())
}
