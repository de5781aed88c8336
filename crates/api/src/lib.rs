//! HTTP collector for attrstream.
//!
//! Receives uploaded batches, accumulates them per session, persists the raw
//! requests and serves newly arrived attributes to long-poll watchers.

pub mod extractors;
pub mod response;
pub mod routes;
pub mod state;
pub mod store;

pub use routes::router;
pub use state::{ApiConfig, AppState, SessionTable};
pub use store::{BlobStore, FsBlobStore, MemoryBlobStore};
