//! API routes.

pub mod health;
pub mod sessions;
pub mod upload;
pub mod watch;

use axum::{
    http::Uri,
    routing::{get, post},
    Router,
};
use engine_core::Error;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::response::ApiError;
use crate::state::AppState;

/// Collector routes, served at the root and under the configured mount.
fn collector_routes() -> Router<AppState> {
    Router::new()
        .route("/upload", post(upload::upload_handler))
        .route("/watch", get(watch::watch_handler).post(watch::watch_handler))
        .route("/sessions/:session_id", get(sessions::session_handler))
}

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/health", get(health::health_handler))
        .route("/health/ready", get(health::ready_handler))
        .route("/health/live", get(health::live_handler))
        .route("/metrics", get(health::metrics_handler))
        .merge(collector_routes());

    if let Some(mount) = state.config.mount_path() {
        app = app.nest(&mount, collector_routes());
    }

    app.fallback(not_found)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn not_found(uri: Uri) -> ApiError {
    Error::RouteNotFound(uri.path().to_string()).into()
}
