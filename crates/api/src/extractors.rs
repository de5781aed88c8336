//! Request extractors.

use axum::{
    async_trait,
    extract::{FromRequest, Query, Request},
};
use bytes::Bytes;
use engine_core::Error;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::response::ApiError;

/// JSON body fields with query parameters merged over them.
///
/// An empty body counts as `{}`. A body that is not a JSON object is
/// rejected.
#[derive(Debug, Clone, Default)]
pub struct RequestParams(pub Map<String, Value>);

impl RequestParams {
    /// Remove and return the first non-empty string found under `names`.
    pub fn take_str(&mut self, names: &[&str]) -> Option<String> {
        let mut found = None;
        for name in names {
            let value = self.0.remove(*name);
            if found.is_none() {
                found = match value {
                    Some(Value::String(s)) if !s.is_empty() => Some(s),
                    Some(Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                };
            }
        }
        found
    }

    pub fn take(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

#[async_trait]
impl<S> FromRequest<S> for RequestParams
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let query = Query::<HashMap<String, String>>::try_from_uri(req.uri())
            .map(|Query(q)| q)
            .unwrap_or_default();

        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::from(Error::validation(format!("unreadable body: {}", e))))?;

        let mut params = if body.iter().all(u8::is_ascii_whitespace) {
            Map::new()
        } else {
            match serde_json::from_slice::<Value>(&body).map_err(Error::from)? {
                Value::Object(map) => map,
                _ => return Err(Error::validation("request body must be a JSON object").into()),
            }
        };

        for (name, value) in query {
            params.insert(name, Value::String(value));
        }

        Ok(RequestParams(params))
    }
}
