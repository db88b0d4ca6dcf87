//! Post-origin response shaping.
//!
//! Shaping only touches 2xx responses that claim a JSON payload. It
//! scrubs suggestion text from GraphQL errors (schema-probing replies
//! like `Did you mean "userById"` leak field names), optionally drops
//! the `extensions` key, and rewrites framing headers since the proxy
//! emits its own body.

use axum::http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderValue};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::{GateError, GateResult};
use crate::proxy::OriginResponse;

pub const DEFAULT_MASK: &str = "[Suggestion hidden]";

static SUGGESTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"Did you mean ".+""#).expect("suggestion pattern compiles"));

#[derive(Clone, Debug, Deserialize)]
pub struct ResponseRules {
    /// Replacement for suggestion matches; `null` disables masking.
    #[serde(default = "default_error_masking")]
    pub error_masking: Option<String>,
    #[serde(default)]
    pub remove_extensions: bool,
    /// Whether passthrough-admitted requests are shaped too.
    #[serde(default = "default_true")]
    pub shape_passthrough: bool,
}

impl Default for ResponseRules {
    fn default() -> Self {
        Self {
            error_masking: default_error_masking(),
            remove_extensions: false,
            shape_passthrough: true,
        }
    }
}

fn default_error_masking() -> Option<String> {
    Some(DEFAULT_MASK.to_string())
}

fn default_true() -> bool {
    true
}

/// Outcome of the decode stage. `Raw` responses leave the proxy
/// untouched: non-2xx statuses and non-JSON content types are not ours
/// to rewrite.
#[derive(Debug, Clone)]
pub enum DecodedPayload {
    Json(Value),
    Raw,
}

pub fn decode(origin: &OriginResponse) -> GateResult<DecodedPayload> {
    if !origin.status.is_success() || !claims_json(&origin.headers) {
        return Ok(DecodedPayload::Raw);
    }
    serde_json::from_slice(&origin.body)
        .map(DecodedPayload::Json)
        .map_err(|_| GateError::Shape)
}

fn claims_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|content_type| {
            content_type.starts_with("application/json")
                || content_type.starts_with("application/graphql-response+json")
        })
        .unwrap_or(false)
}

/// Applies masking and extensions stripping in place. Idempotent: a
/// masked message no longer matches the suggestion pattern.
pub fn apply(payload: &mut Value, rules: &ResponseRules) {
    if let Some(mask) = &rules.error_masking {
        mask_suggestions(payload, mask);
    }
    if rules.remove_extensions {
        if let Some(object) = payload.as_object_mut() {
            object.remove("extensions");
        }
    }
}

fn mask_suggestions(payload: &mut Value, mask: &str) {
    let Some(errors) = payload.get_mut("errors").and_then(Value::as_array_mut) else {
        return;
    };
    for error in errors {
        let Some(message) = error.get("message").and_then(Value::as_str) else {
            continue;
        };
        if SUGGESTION_RE.is_match(message) {
            let masked = SUGGESTION_RE.replace_all(message, mask).into_owned();
            error["message"] = Value::String(masked);
        }
    }
}

/// Framing headers are the proxy's own; everything else is preserved.
pub fn rewrite_headers(origin_headers: &HeaderMap) -> HeaderMap {
    let mut headers = origin_headers.clone();
    headers.remove(CONTENT_ENCODING);
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    headers
}
