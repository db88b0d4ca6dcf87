//! Origin forwarding.
//!
//! The proxy always POSTs `{query, variables, operationName}` to the
//! configured upstream. Header preparation is a pure function so the
//! hop-header and forwarded-for policy is testable without a socket;
//! the actual fetch sits behind [`OriginFetch`] so tests and cache
//! layers can interpose.

use async_trait::async_trait;
use axum::http::header::{
    CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, ORIGIN, TRANSFER_ENCODING,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use url::Url;

use crate::errors::{GateError, GateResult};
use crate::request::ParsedRequest;

/// Response from the upstream, captured whole. GraphQL responses are
/// small; streaming is not worth the loss of a shapeable body.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Body posted upstream.
#[derive(Debug, Clone, Serialize)]
pub struct OriginRequestBody {
    pub query: String,
    pub variables: Option<Map<String, Value>>,
    #[serde(rename = "operationName")]
    pub operation_name: Option<String>,
}

impl OriginRequestBody {
    pub fn from_parsed(parsed: &ParsedRequest) -> Self {
        Self {
            query: parsed.query.clone(),
            variables: parsed.variables.clone(),
            operation_name: parsed.operation_name.clone(),
        }
    }
}

/// Narrow seam to the upstream. `fetch` carries the policy-shaped POST;
/// `fetch_raw` relays a request verbatim for surfaces the policy engine
/// does not cover.
#[async_trait]
pub trait OriginFetch: Send + Sync {
    async fn fetch(&self, headers: HeaderMap, body: OriginRequestBody)
        -> GateResult<OriginResponse>;

    async fn fetch_raw(
        &self,
        _method: Method,
        _headers: HeaderMap,
        _body: Bytes,
    ) -> GateResult<OriginResponse> {
        Err(GateError::routing("method not supported"))
    }
}

pub struct HttpOrigin {
    client: Client,
    origin: Url,
}

impl HttpOrigin {
    pub fn new(origin: Url) -> GateResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|err| GateError::Transport(err.to_string()))?;
        Ok(Self { client, origin })
    }
}

#[async_trait]
impl OriginFetch for HttpOrigin {
    async fn fetch(
        &self,
        headers: HeaderMap,
        body: OriginRequestBody,
    ) -> GateResult<OriginResponse> {
        let response = self
            .client
            .post(self.origin.clone())
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|err| GateError::Transport(err.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| GateError::Transport(err.to_string()))?;
        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }

    async fn fetch_raw(
        &self,
        method: Method,
        headers: HeaderMap,
        body: Bytes,
    ) -> GateResult<OriginResponse> {
        let response = self
            .client
            .request(method, self.origin.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| GateError::Transport(err.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| GateError::Transport(err.to_string()))?;
        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }
}

/// Hop-header and forwarded-for policy applied to every upstream call.
pub fn prepare_headers(original: &HeaderMap, origin_url: &Url) -> HeaderMap {
    let mut headers = original.clone();
    let inbound_host = headers.get(HOST).cloned();

    let origin_value = origin_url.origin().ascii_serialization();
    headers.insert(
        ORIGIN,
        HeaderValue::from_str(&origin_value).expect("url origin serializes to ascii"),
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    // The proxy emits its own framing.
    headers.remove(CONTENT_LENGTH);
    headers.remove(CONTENT_ENCODING);
    headers.remove(HOST);
    headers.remove(TRANSFER_ENCODING);

    if !headers.contains_key("x-forwarded-proto") {
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
    }
    if let Some(host) = inbound_host {
        headers.insert("x-forwarded-host", host);
    }
    let client_ip = headers
        .get("cf-connecting-ip")
        .or_else(|| headers.get("x-real-ip"))
        .cloned();
    if let Some(client_ip) = client_ip {
        // A client-supplied chain is never overwritten.
        if !headers.contains_key("x-forwarded-for") {
            headers.insert("x-forwarded-for", client_ip);
        }
    }

    headers
}
