//! Per-request observability.
//!
//! Stages never talk to the collector directly: they stamp a
//! [`ReportContext`] as they run, and finalization turns the context
//! plus the pipeline outcome into one [`Report`] pushed to a sink.

use std::collections::BTreeMap;
use std::time::Instant;

use axum::http::Extensions;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::GateError;
use crate::proxy::OriginResponse;
use crate::request::ParsedRequest;

/// Phase durations in milliseconds. A phase whose timestamps were never
/// stamped reports zero.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Durations {
    pub parsing: u64,
    pub proxying: u64,
    pub processing: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub input_size: usize,
    pub response_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_map: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<Value>>,
    pub durations: Durations,
}

/// Mutable per-request workspace. The pipeline owns it; stages and
/// caller hooks borrow it. `extensions` is a typed scratch area for
/// hooks (stashing a resolved definition for a cache layer, say); the
/// collector never reads it.
pub struct ReportContext {
    pub started_at: Instant,
    pub parsed_at: Option<Instant>,
    pub proxied_at: Option<Instant>,
    pub response_parsed_at: Option<Instant>,
    pub operation_name: Option<String>,
    pub query: Option<String>,
    pub input_size: usize,
    pub extensions: Extensions,
}

impl ReportContext {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            parsed_at: None,
            proxied_at: None,
            response_parsed_at: None,
            operation_name: None,
            query: None,
            input_size: 0,
            extensions: Extensions::new(),
        }
    }

    pub fn mark_parsed(&mut self, parsed: &ParsedRequest) {
        self.parsed_at = Some(Instant::now());
        self.operation_name = parsed.operation_name.clone();
        self.query = Some(parsed.query.clone());
        self.input_size = parsed.variables_size();
    }

    pub fn mark_proxied(&mut self) {
        self.proxied_at = Some(Instant::now());
    }

    pub fn mark_response_parsed(&mut self) {
        self.response_parsed_at = Some(Instant::now());
    }
}

impl Default for ReportContext {
    fn default() -> Self {
        Self::new()
    }
}

/// What the pipeline ended with, from the collector's point of view.
pub enum Outcome<'a> {
    /// The pipeline never engaged the policy engine; no report.
    Skipped,
    /// Admission rejected the request.
    Rejected(&'a GateError),
    /// The origin fetch failed at the transport level.
    Transport { message: &'a str },
    /// The caller abandoned the request.
    Cancelled,
    /// The origin answered. `payload` is the decoded body before any
    /// shaping, when the response carried decodable JSON.
    Completed {
        origin: &'a OriginResponse,
        payload: Option<&'a Value>,
    },
}

pub fn collect(ctx: &ReportContext, outcome: Outcome<'_>) -> Option<Report> {
    let completed_at = Instant::now();
    let durations = durations(ctx, completed_at);

    let report = match outcome {
        Outcome::Skipped => return None,
        Outcome::Rejected(error) => Report {
            ok: false,
            origin_status: None,
            operation_name: ctx.operation_name.clone(),
            query: ctx.query.clone(),
            input_size: ctx.input_size,
            response_size: 0,
            response_map: None,
            errors: Some(vec![json!({
                "message": format!("cannot parse: {error}"),
            })]),
            durations: Durations {
                proxying: 0,
                processing: 0,
                ..durations
            },
        },
        Outcome::Transport { message } => Report {
            ok: false,
            origin_status: None,
            operation_name: ctx.operation_name.clone(),
            query: ctx.query.clone(),
            input_size: ctx.input_size,
            response_size: 0,
            response_map: None,
            errors: Some(vec![json!({"message": message})]),
            durations,
        },
        Outcome::Cancelled => Report {
            ok: false,
            origin_status: None,
            operation_name: ctx.operation_name.clone(),
            query: ctx.query.clone(),
            input_size: ctx.input_size,
            response_size: 0,
            response_map: None,
            errors: Some(vec![json!({"message": "cancelled"})]),
            durations,
        },
        Outcome::Completed { origin, payload } => {
            let status = origin.status.as_u16();
            let data = payload.and_then(|payload| payload.get("data"));
            let data_present = data.map(|data| !data.is_null()).unwrap_or(false);
            let payload_errors = payload
                .and_then(|payload| payload.get("errors"))
                .and_then(Value::as_array)
                .filter(|errors| !errors.is_empty());

            let ok = (200..400).contains(&status) && data_present && payload_errors.is_none();

            let errors = match payload_errors {
                Some(errors) => Some(errors.clone()),
                None if status >= 400 => Some(vec![json!({
                    "message": String::from_utf8_lossy(&origin.body).into_owned(),
                    "status": status,
                })]),
                None => None,
            };

            Report {
                ok,
                origin_status: Some(status),
                operation_name: ctx.operation_name.clone(),
                query: ctx.query.clone(),
                input_size: ctx.input_size,
                response_size: response_size(origin),
                response_map: data.filter(|data| !data.is_null()).map(response_map),
                errors,
                durations,
            }
        }
    };

    Some(report)
}

fn durations(ctx: &ReportContext, completed_at: Instant) -> Durations {
    let millis = |earlier: Instant, later: Instant| {
        later.saturating_duration_since(earlier).as_millis() as u64
    };
    Durations {
        parsing: ctx
            .parsed_at
            .map(|parsed| millis(ctx.started_at, parsed))
            .unwrap_or(0),
        proxying: ctx
            .parsed_at
            .zip(ctx.proxied_at)
            .map(|(parsed, proxied)| millis(parsed, proxied))
            .unwrap_or(0),
        processing: ctx
            .proxied_at
            .map(|proxied| millis(proxied, completed_at))
            .unwrap_or(0),
        total: millis(ctx.started_at, completed_at),
    }
}

/// `content-size` is a quirk of the upstream contract; when absent or
/// unparseable the actual body length is used.
fn response_size(origin: &OriginResponse) -> usize {
    origin
        .headers
        .get("content-size")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(origin.body.len())
}

/// Depth-first fingerprint of the `data` tree: `$`-rooted dot paths to
/// occurrence counts. Arrays count their length at their own path and
/// fan their elements out under the same path, so indices never appear.
pub fn response_map(data: &Value) -> BTreeMap<String, u64> {
    let mut map = BTreeMap::new();
    if let Value::Object(fields) = data {
        for (key, value) in fields {
            walk_field(value, &format!("$.{key}"), &mut map);
        }
    }
    map
}

fn walk_field(value: &Value, path: &str, map: &mut BTreeMap<String, u64>) {
    match value {
        Value::Array(items) => {
            *map.entry(path.to_string()).or_insert(0) += items.len() as u64;
            for item in items {
                match item {
                    Value::Object(fields) => {
                        for (key, value) in fields {
                            walk_field(value, &format!("{path}.{key}"), map);
                        }
                    }
                    Value::Array(_) => walk_field(item, path, map),
                    _ => {}
                }
            }
        }
        Value::Object(fields) => {
            *map.entry(path.to_string()).or_insert(0) += 1;
            for (key, value) in fields {
                walk_field(value, &format!("{path}.{key}"), map);
            }
        }
        _ => {
            *map.entry(path.to_string()).or_insert(0) += 1;
        }
    }
}

/// Where finished reports go. Emission happens after the client response
/// is built, off the response's critical path.
pub trait ReportSink: Send + Sync {
    fn emit(&self, report: Report);
}

/// Default sink: one structured log line per request.
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn emit(&self, report: Report) {
        match serde_json::to_string(&report) {
            Ok(line) => info!(target: "gqlgate::report", report = %line, "request report"),
            Err(err) => warn!(?err, "failed to serialize request report"),
        }
    }
}

/// Collecting sink for tests and embedders that drain reports directly.
#[derive(Default)]
pub struct MemorySink {
    reports: Mutex<Vec<Report>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Report> {
        std::mem::take(&mut *self.reports.lock())
    }

    pub fn snapshot(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }
}

impl ReportSink for MemorySink {
    fn emit(&self, report: Report) {
        self.reports.lock().push(report);
    }
}
