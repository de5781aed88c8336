//! Wire types shared by the relay uploader and the collector.

use serde::{Deserialize, Serialize};

use crate::attribute::Attribute;

/// Body of `POST <mount>/upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBatch {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub payload: Vec<Attribute>,
}

impl UploadBatch {
    pub fn new(
        session_id: impl Into<String>,
        client_id: Option<String>,
        payload: Vec<Attribute>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            client_id,
            payload,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Collector's answer to an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub ok: bool,
    /// Attributes accepted.
    #[serde(default)]
    pub count: usize,
    /// Fields written into the session table.
    #[serde(default)]
    pub attr_count: usize,
}

/// Answer to a long-poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchResponse {
    pub ok: bool,
    pub items: Vec<Attribute>,
}

impl WatchResponse {
    pub fn new(items: Vec<Attribute>) -> Self {
        Self { ok: true, items }
    }
}
