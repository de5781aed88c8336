//! UDP attribute relay.
//!
//! Decodes datagrams, groups attributes into per-session batches and uploads
//! them to the collector once a batch is full or has waited long enough.

pub mod batch;
pub mod config;
pub mod listener;
pub mod registry;
pub mod uploader;
pub mod upstream;

pub use batch::{BatchConfig, EnqueueOutcome, FlushTrigger, SessionBatcher, SessionStats};
pub use config::RelayConfig;
pub use listener::UdpRelay;
pub use registry::{endpoint_key, resolve_client_id, Resolution, SessionRegistry};
pub use uploader::{upload_url, HttpUploader, Uploader};
pub use upstream::{
    Handshaker, HttpSessionStarter, SessionStarter, StaticSessionStarter, StartupInfo, UnconfiguredStarter,
    Upstream,
};
