//! Server-side session accumulation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::attribute::{Attribute, FIELD_KEY, FIELD_VALUE};

/// Latest fields per `(type, id)`.
pub type AttributeTable = BTreeMap<String, BTreeMap<String, Map<String, Value>>>;

/// A logical stream of attributes sharing one session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    /// Upload calls applied to this session.
    pub upload_count: u64,
    /// Attributes applied to this session.
    pub attribute_count: u64,
    pub attributes: AttributeTable,
}

impl Session {
    pub fn new(session_id: impl Into<String>, client_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            client_id,
            created_at: now,
            last_modified_at: now,
            upload_count: 0,
            attribute_count: 0,
            attributes: BTreeMap::new(),
        }
    }

    /// Fold one attribute into the table and return the number of fields
    /// written.
    ///
    /// `key`/`value` become `table[type][id][key] = value`; every other field
    /// is copied onto the same entry. Later writes win.
    pub fn apply(&mut self, attribute: &Attribute) -> usize {
        let entry = self
            .attributes
            .entry(attribute.kind_or_unknown())
            .or_default()
            .entry(attribute.id_or_unknown())
            .or_default();

        let mut written = 0;
        if let Some(key) = attribute.key() {
            let value = attribute.value().cloned().unwrap_or(Value::Null);
            entry.insert(key.to_string(), value);
            written += 1;
        }

        for (field, value) in attribute.fields() {
            if field == FIELD_KEY || field == FIELD_VALUE {
                continue;
            }
            entry.insert(field.clone(), value.clone());
            written += 1;
        }

        self.attribute_count += 1;
        self.last_modified_at = Utc::now();
        written
    }

    /// Record one upload call.
    pub fn record_upload(&mut self, client_id: Option<&str>) {
        self.upload_count += 1;
        if self.client_id.is_none() {
            self.client_id = client_id.map(str::to_string);
        }
        self.last_modified_at = Utc::now();
    }

    /// Current value stored for `(type, id, key)`.
    pub fn lookup(&self, kind: &str, id: &str, key: &str) -> Option<&Value> {
        self.attributes.get(kind)?.get(id)?.get(key)
    }
}
