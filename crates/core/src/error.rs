//! Unified error types for attrstream.
//!
//! Error codes:
//! - PKT_001: Malformed datagram
//! - NO_PAYLOAD: Nothing to send / upload without a payload array
//! - UPSTREAM_001-002: Upstream unknown / transport failure
//! - ROUTE_404, SESSION_404: Lookups at the HTTP boundary
//! - STORE_001: Blob store failures

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Upstream error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorCode {
    /// UPSTREAM_001: Session-start handshake incomplete or no endpoint known
    Unknown,
    /// UPSTREAM_002: Collector unreachable or rejected the upload
    Transport,
}

impl UpstreamErrorCode {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unknown => "UPSTREAM_001",
            Self::Transport => "UPSTREAM_002",
        }
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unknown => 503,
            Self::Transport => 502,
        }
    }
}

/// Unified error type for attrstream.
#[derive(Debug, Error)]
pub enum Error {
    /// Datagram did not match `<tag> <json-object>`.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Flush or upload attempted with nothing to send.
    #[error("no payload: {0}")]
    NoPayload(String),

    /// No upstream endpoint is usable for the session yet. Callers retry.
    #[error("no upstream configured yet: {0}")]
    UpstreamUnknown(String),

    /// Upload rejected or collector unreachable. Not retried.
    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("route not found: {0}")]
    RouteNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPacket(msg.into())
    }

    pub fn no_payload(msg: impl Into<String>) -> Self {
        Self::NoPayload(msg.into())
    }

    pub fn upstream_unknown(msg: impl Into<String>) -> Self {
        Self::UpstreamUnknown(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the failed operation should be retried with the same data.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnknown(_))
    }

    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedPacket(_) => "PKT_001",
            Self::NoPayload(_) => "NO_PAYLOAD",
            Self::UpstreamUnknown(_) => UpstreamErrorCode::Unknown.code(),
            Self::Transport(_) => UpstreamErrorCode::Transport.code(),
            Self::RouteNotFound(_) => "ROUTE_404",
            Self::SessionNotFound(_) => "SESSION_404",
            Self::Storage(_) => "STORE_001",
            Self::Validation(_) => "VALID_001",
            Self::Serialization(_) => "VALID_002",
            Self::Config(_) => "CONFIG_001",
            Self::Io(_) => "IO_001",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::MalformedPacket(_) => 400,
            Self::NoPayload(_) => 400,
            Self::UpstreamUnknown(_) => UpstreamErrorCode::Unknown.http_status(),
            Self::Transport(_) => UpstreamErrorCode::Transport.http_status(),
            Self::RouteNotFound(_) => 404,
            Self::SessionNotFound(_) => 404,
            Self::Storage(_) => 500,
            Self::Validation(_) => 400,
            Self::Serialization(_) => 400,
            Self::Config(_) => 500,
            Self::Io(_) => 500,
            Self::Internal(_) => 500,
        }
    }
}
