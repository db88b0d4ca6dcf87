//! Request types shared by every pipeline stage.
//!
//! The hosting HTTP runtime is deliberately out of scope: stages consume
//! an [`InboundRequest`] snapshot and produce neutral responses, so the
//! pipeline can be driven by the axum surface or directly by tests.

use std::sync::Arc;

use axum::http::{HeaderMap, Method, Uri};
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::registry::OperationDefinition;

/// Immutable snapshot of the incoming HTTP request.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
        }
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// The normalized unit of work produced by admission. Read-only after
/// construction; either `query` is non-empty or `operation` is set.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub query: String,
    pub operation_name: Option<String>,
    pub variables: Option<Map<String, Value>>,
    pub headers: HeaderMap,
    pub operation: Option<Arc<OperationDefinition>>,
    pub passthrough: bool,
}

impl ParsedRequest {
    /// Byte size of the serialized variables, for the report's input
    /// accounting.
    pub fn variables_size(&self) -> usize {
        self.variables
            .as_ref()
            .map(|variables| {
                serde_json::to_string(variables)
                    .map(|serialized| serialized.len())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }
}

/// Wire shape of a client POST body in signature mode.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct GraphQLRequestBody {
    pub query: Option<String>,
    #[serde(rename = "operationName")]
    pub operation_name: Option<String>,
    #[serde(default)]
    pub variables: Option<Map<String, Value>>,
}

/// First present value among `keys` in a JSON object, as a string.
pub fn first_string_key<'a>(body: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
}

/// First present value among `keys` in a JSON object, verbatim.
pub fn first_value_key<'a>(body: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| body.get(*key).filter(|value| !value.is_null()))
}
