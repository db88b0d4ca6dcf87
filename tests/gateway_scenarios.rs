//! End-to-end scenarios through the axum surface: signature-mode
//! admission, shaping, and report collection against a scripted origin.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use serde_json::{json, Value};
use tower::ServiceExt;
use url::Url;

use gqlgate::digest::{self, HashAlgorithm};
use gqlgate::pipeline::{AdmissionGate, Pipeline};
use gqlgate::proxy::{OriginFetch, OriginRequestBody, OriginResponse};
use gqlgate::report::{MemorySink, ReportSink};
use gqlgate::server::{router, GateState};
use gqlgate::shape::ResponseRules;
use gqlgate::signature::SignatureGate;
use gqlgate::{canon, GateResult};

const MAX_TOKENS: usize = 2000;

/// Origin that always answers with one scripted response.
struct ScriptedOrigin {
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
}

#[async_trait]
impl OriginFetch for ScriptedOrigin {
    async fn fetch(
        &self,
        _headers: HeaderMap,
        _body: OriginRequestBody,
    ) -> GateResult<OriginResponse> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(self.content_type).unwrap(),
        );
        Ok(OriginResponse {
            status: self.status,
            headers,
            body: Bytes::from_static(self.body.as_bytes()),
        })
    }
}

fn gateway(
    gate: SignatureGate,
    origin: Arc<dyn OriginFetch>,
    sink: Arc<MemorySink>,
) -> Router {
    let pipeline = Pipeline::new(
        AdmissionGate::Signature(gate),
        origin,
        Url::parse("https://origin.example/graphql").unwrap(),
        ResponseRules::default(),
    )
    .with_sink(sink);
    router(GateState::new(Arc::new(pipeline)))
}

fn signed_gate() -> SignatureGate {
    SignatureGate::new(
        Some(digest::sha256_hex(b"pass")),
        Some(gqlgate::SignSecret::Raw("signature".into())),
        MAX_TOKENS,
    )
}

fn sign(query: &str) -> String {
    let canonical = canon::canonical(query, MAX_TOKENS).unwrap();
    digest::hmac_hex(b"signature", canonical.as_bytes(), HashAlgorithm::Sha256)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn passthrough_token_skips_shaping_of_non_json_origins() {
    let sink = Arc::new(MemorySink::new());
    let app = gateway(
        signed_gate(),
        Arc::new(ScriptedOrigin {
            status: StatusCode::OK,
            content_type: "text/plain",
            body: "works",
        }),
        Arc::clone(&sink),
    );

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/graphql")
                .header("content-type", "application/json")
                .header("x-proxy-pass-secret", "pass")
                .body(Body::from("{\"query\":\"query me { me }\"}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"works");
}

#[tokio::test]
async fn wrong_passthrough_token_is_rejected() {
    let sink = Arc::new(MemorySink::new());
    let app = gateway(
        signed_gate(),
        Arc::new(ScriptedOrigin {
            status: StatusCode::OK,
            content_type: "text/plain",
            body: "works",
        }),
        Arc::clone(&sink),
    );

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/graphql")
                .header("content-type", "application/json")
                .header("x-proxy-pass-secret", "KABOOM")
                .body(Body::from("{\"query\":\"query me { me }\"}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["message"], "Invalid x-proxy-op-hash header");
}

#[tokio::test]
async fn signed_happy_path_returns_the_origin_payload_and_reports_ok() {
    let sink = Arc::new(MemorySink::new());
    let app = gateway(
        signed_gate(),
        Arc::new(ScriptedOrigin {
            status: StatusCode::OK,
            content_type: "application/json",
            body: "{\"data\":{\"me\":\"me\"},\"errors\":[]}",
        }),
        Arc::clone(&sink),
    );

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/graphql")
                .header("content-type", "application/json")
                .header("x-proxy-op-hash", sign("query me {me}"))
                .body(Body::from("{\"query\":\"query me {me}\"}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body, json!({"data": {"me": "me"}, "errors": []}));

    let reports = sink.take();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(report.ok);
    assert_eq!(report.origin_status, Some(200));
    let d = &report.durations;
    assert!(d.total >= d.parsing + d.proxying + d.processing);
}

#[tokio::test]
async fn suggestions_are_masked_in_the_response_but_not_the_report() {
    let sink = Arc::new(MemorySink::new());
    let app = gateway(
        signed_gate(),
        Arc::new(ScriptedOrigin {
            status: StatusCode::OK,
            content_type: "application/json",
            body: "{\"data\":null,\"errors\":[{\"message\":\"Did you mean \\\"Type ABC\\\"\"}]}",
        }),
        Arc::clone(&sink),
    );

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/graphql")
                .header("content-type", "application/json")
                .header("x-proxy-op-hash", sign("query me {me}"))
                .body(Body::from("{\"query\":\"query me {me}\"}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["message"], "[Suggestion hidden]");

    let reports = sink.take();
    let report = &reports[0];
    assert!(!report.ok);
    // The report keeps the pre-mask error text.
    assert_eq!(
        report.errors.as_ref().unwrap()[0]["message"],
        "Did you mean \"Type ABC\""
    );
}

#[tokio::test]
async fn token_overflow_is_rejected_as_unparseable() {
    let sink = Arc::new(MemorySink::new());
    let app = gateway(
        SignatureGate::new(None, None, 5),
        Arc::new(ScriptedOrigin {
            status: StatusCode::OK,
            content_type: "application/json",
            body: "{}",
        }),
        Arc::clone(&sink),
    );

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/graphql")
                .header("content-type", "application/json")
                .body(Body::from("{\"query\":\"query me {me b a c d}\"}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["message"], "cannot parse query");

    let reports = sink.take();
    assert_eq!(
        reports[0].errors.as_ref().unwrap()[0]["message"],
        "cannot parse: cannot parse query"
    );
}

#[tokio::test]
async fn extensions_are_stripped_when_configured() {
    let sink = Arc::new(MemorySink::new());
    let pipeline = Pipeline::new(
        AdmissionGate::Signature(SignatureGate::new(None, None, MAX_TOKENS)),
        Arc::new(ScriptedOrigin {
            status: StatusCode::OK,
            content_type: "application/json",
            body: "{\"data\":{\"me\":1},\"extensions\":{\"tracing\":{}}}",
        }),
        Url::parse("https://origin.example/graphql").unwrap(),
        ResponseRules {
            remove_extensions: true,
            ..ResponseRules::default()
        },
    )
    .with_sink(Arc::clone(&sink) as Arc<dyn ReportSink>);
    let app = router(GateState::new(Arc::new(pipeline)));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/graphql")
                .header("content-type", "application/json")
                .body(Body::from("{\"query\":\"{ me }\"}"))
                .unwrap(),
        )
        .await
        .unwrap();

    let body = body_json(response).await;
    assert!(body.get("extensions").is_none());
    assert_eq!(body["data"]["me"], 1);
}
