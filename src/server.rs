//! HTTP surface binding the pipeline to axum.
//!
//! The router is deliberately thin: it snapshots the request into the
//! runtime-neutral form the pipeline consumes and converts the result
//! back. Policy lives entirely behind [`Pipeline::execute`].

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::pipeline::{ClientResponse, Pipeline};
use crate::request::InboundRequest;

/// Requests larger than this are rejected before admission runs.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct GateState {
    pipeline: Arc<Pipeline>,
}

impl GateState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn router(state: GateState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/graphql", any(graphql_handler))
        .with_state(state)
}

async fn healthz_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[instrument(skip_all, fields(method = %request.method()))]
async fn graphql_handler(State(state): State<GateState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"message": "cannot extract request"})),
            )
                .into_response();
        }
    };

    let inbound = InboundRequest::new(parts.method, parts.uri, parts.headers, bytes);
    let response = state
        .pipeline
        .execute(inbound, CancellationToken::new())
        .await;
    into_axum(response)
}

fn into_axum(response: ClientResponse) -> Response {
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out
}
