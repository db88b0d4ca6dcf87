//! Stage orchestration.
//!
//! One [`Pipeline`] instance serves many concurrent requests; each call
//! to [`Pipeline::execute`] owns its own [`ReportContext`] and runs the
//! five stages in strict order. Caller hooks observe stage outputs and
//! may stash typed values in the context, but they cannot veto the
//! pipeline's decision, and a panicking hook is contained rather than
//! failing the request.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

use crate::errors::{GateError, GateResult};
use crate::proxy::{self, OriginFetch, OriginRequestBody, OriginResponse};
use crate::registry::OperationRegistry;
use crate::report::{self, Outcome, ReportContext, ReportSink, TracingSink};
use crate::request::{InboundRequest, ParsedRequest};
use crate::shape::{self, DecodedPayload, ResponseRules};
use crate::signature::SignatureGate;

/// Observer seams invoked at fixed pipeline phases. Default methods are
/// no-ops so implementors pick the phases they care about.
pub trait Hooks: Send + Sync {
    fn on_request_parsed(&self, _parsed: &ParsedRequest, _ctx: &mut ReportContext) {}
    fn on_proxied(&self, _response: &OriginResponse, _ctx: &mut ReportContext) {}
    fn on_response_parsed(&self, _payload: &Value, _ctx: &mut ReportContext) {}
}

pub struct NoopHooks;

impl Hooks for NoopHooks {}

/// Which admission variant fronts the pipeline.
pub enum AdmissionGate {
    Signature(SignatureGate),
    Store(Arc<OperationRegistry>),
}

impl AdmissionGate {
    fn admit(&self, req: &InboundRequest) -> GateResult<ParsedRequest> {
        match self {
            AdmissionGate::Signature(gate) => gate.admit(req),
            AdmissionGate::Store(registry) => registry.admit(req),
        }
    }
}

/// Runtime-neutral response handed back to the HTTP surface.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ClientResponse {
    pub fn from_error(error: &GateError) -> Self {
        let body = json!({"message": error.client_message()}).to_string();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            status: error.status(),
            headers,
            body: Bytes::from(body),
        }
    }

    fn from_origin(origin: OriginResponse) -> Self {
        Self {
            status: origin.status,
            headers: origin.headers,
            body: origin.body,
        }
    }
}

pub struct Pipeline {
    gate: AdmissionGate,
    origin: Arc<dyn OriginFetch>,
    origin_url: Url,
    rules: ResponseRules,
    hooks: Arc<dyn Hooks>,
    sink: Arc<dyn ReportSink>,
}

impl Pipeline {
    pub fn new(
        gate: AdmissionGate,
        origin: Arc<dyn OriginFetch>,
        origin_url: Url,
        rules: ResponseRules,
    ) -> Self {
        Self {
            gate,
            origin,
            origin_url,
            rules,
            hooks: Arc::new(NoopHooks),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    pub async fn execute(&self, req: InboundRequest, cancel: CancellationToken) -> ClientResponse {
        let mut ctx = ReportContext::new();

        // Signature mode applies policy to POST only; everything else
        // relays verbatim and never engages the collector.
        if matches!(self.gate, AdmissionGate::Signature(_)) && req.method != Method::POST {
            let headers = proxy::prepare_headers(&req.headers, &self.origin_url);
            return match self
                .origin
                .fetch_raw(req.method.clone(), headers, req.body.clone())
                .await
            {
                Ok(origin) => ClientResponse::from_origin(origin),
                Err(error) => ClientResponse::from_error(&error),
            };
        }

        let parsed = match self.gate.admit(&req) {
            Ok(parsed) => parsed,
            Err(error) => {
                self.finish(&ctx, Outcome::Rejected(&error));
                return ClientResponse::from_error(&error);
            }
        };
        ctx.mark_parsed(&parsed);
        dispatch_hook("on_request_parsed", || {
            self.hooks.on_request_parsed(&parsed, &mut ctx)
        });

        let headers = proxy::prepare_headers(&parsed.headers, &self.origin_url);
        let body = OriginRequestBody::from_parsed(&parsed);
        let fetched = tokio::select! {
            result = self.origin.fetch(headers, body) => Some(result),
            _ = cancel.cancelled() => None,
        };
        let origin = match fetched {
            Some(Ok(origin)) => origin,
            Some(Err(error)) => {
                let message = error.to_string();
                self.finish(&ctx, Outcome::Transport { message: &message });
                return ClientResponse::from_error(&error);
            }
            None => {
                self.finish(&ctx, Outcome::Cancelled);
                return ClientResponse::from_error(&GateError::Cancelled);
            }
        };
        ctx.mark_proxied();
        dispatch_hook("on_proxied", || self.hooks.on_proxied(&origin, &mut ctx));

        let decoded = match shape::decode(&origin) {
            Ok(decoded) => decoded,
            Err(error) => {
                self.finish(
                    &ctx,
                    Outcome::Completed {
                        origin: &origin,
                        payload: None,
                    },
                );
                return ClientResponse::from_error(&error);
            }
        };

        match decoded {
            DecodedPayload::Raw => {
                self.finish(
                    &ctx,
                    Outcome::Completed {
                        origin: &origin,
                        payload: None,
                    },
                );
                ClientResponse::from_origin(origin)
            }
            DecodedPayload::Json(payload) => {
                ctx.mark_response_parsed();
                dispatch_hook("on_response_parsed", || {
                    self.hooks.on_response_parsed(&payload, &mut ctx)
                });

                if cancel.is_cancelled() {
                    // The shaped response would never be delivered.
                    self.finish(&ctx, Outcome::Cancelled);
                    return ClientResponse::from_error(&GateError::Cancelled);
                }

                let response = if self.rules.shape_passthrough || !parsed.passthrough {
                    let mut shaped = payload.clone();
                    shape::apply(&mut shaped, &self.rules);
                    ClientResponse {
                        status: origin.status,
                        headers: shape::rewrite_headers(&origin.headers),
                        body: Bytes::from(shaped.to_string()),
                    }
                } else {
                    ClientResponse::from_origin(origin.clone())
                };

                self.finish(
                    &ctx,
                    Outcome::Completed {
                        origin: &origin,
                        payload: Some(&payload),
                    },
                );
                response
            }
        }
    }

    fn finish(&self, ctx: &ReportContext, outcome: Outcome<'_>) {
        if let Some(report) = report::collect(ctx, outcome) {
            self.sink.emit(report);
        }
    }
}

fn dispatch_hook(name: &str, hook: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(hook)).is_err() {
        warn!(hook = name, "pipeline hook panicked; continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::MemorySink;
    use async_trait::async_trait;
    use axum::http::Uri;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticOrigin {
        status: StatusCode,
        content_type: &'static str,
        body: &'static str,
    }

    #[async_trait]
    impl OriginFetch for StaticOrigin {
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

    struct FailingOrigin;

    #[async_trait]
    impl OriginFetch for FailingOrigin {
        async fn fetch(
            &self,
            _headers: HeaderMap,
            _body: OriginRequestBody,
        ) -> GateResult<OriginResponse> {
            Err(GateError::Transport("connection refused".into()))
        }
    }

    struct PendingOrigin;

    #[async_trait]
    impl OriginFetch for PendingOrigin {
        async fn fetch(
            &self,
            _headers: HeaderMap,
            _body: OriginRequestBody,
        ) -> GateResult<OriginResponse> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn unsigned_pipeline(origin: Arc<dyn OriginFetch>, sink: Arc<MemorySink>) -> Pipeline {
        Pipeline::new(
            AdmissionGate::Signature(SignatureGate::new(None, None, 2000)),
            origin,
            Url::parse("https://origin.example/graphql").unwrap(),
            ResponseRules::default(),
        )
        .with_sink(sink)
    }

    fn post_request(body: &str) -> InboundRequest {
        InboundRequest::new(
            Method::POST,
            Uri::from_static("/graphql"),
            HeaderMap::new(),
            Bytes::from(body.to_string()),
        )
    }

    #[tokio::test]
    async fn happy_path_shapes_and_reports() {
        let sink = Arc::new(MemorySink::new());
        let pipeline = unsigned_pipeline(
            Arc::new(StaticOrigin {
                status: StatusCode::OK,
                content_type: "application/json",
                body: "{\"data\":{\"me\":\"me\"},\"errors\":[]}",
            }),
            Arc::clone(&sink),
        );

        let response = pipeline
            .execute(
                post_request("{\"query\":\"query me {me}\"}"),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            response.headers.get(CONTENT_TYPE).unwrap(),
            "application/json; charset=utf-8"
        );
        let reports = sink.take();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].ok);
        assert_eq!(reports[0].origin_status, Some(200));
        assert_eq!(reports[0].query.as_deref(), Some("query me {me}"));
    }

    #[tokio::test]
    async fn hooks_run_once_in_order_and_panics_are_contained() {
        struct CountingHooks {
            order: Mutex<Vec<&'static str>>,
            parsed: AtomicUsize,
        }
        impl Hooks for CountingHooks {
            fn on_request_parsed(&self, _parsed: &ParsedRequest, _ctx: &mut ReportContext) {
                self.parsed.fetch_add(1, Ordering::SeqCst);
                self.order.lock().push("parsed");
                panic!("hook blew up");
            }
            fn on_proxied(&self, _response: &OriginResponse, _ctx: &mut ReportContext) {
                self.order.lock().push("proxied");
            }
            fn on_response_parsed(&self, _payload: &Value, _ctx: &mut ReportContext) {
                self.order.lock().push("response_parsed");
            }
        }

        let hooks = Arc::new(CountingHooks {
            order: Mutex::new(Vec::new()),
            parsed: AtomicUsize::new(0),
        });
        let sink = Arc::new(MemorySink::new());
        let pipeline = unsigned_pipeline(
            Arc::new(StaticOrigin {
                status: StatusCode::OK,
                content_type: "application/json",
                body: "{\"data\":{}}",
            }),
            Arc::clone(&sink),
        )
        .with_hooks(Arc::clone(&hooks) as Arc<dyn Hooks>);

        let response = pipeline
            .execute(
                post_request("{\"query\":\"{ me }\"}"),
                CancellationToken::new(),
            )
            .await;

        // The panicking hook did not fail the request.
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(hooks.parsed.load(Ordering::SeqCst), 1);
        assert_eq!(
            *hooks.order.lock(),
            vec!["parsed", "proxied", "response_parsed"]
        );
        assert_eq!(sink.take().len(), 1);
    }

    #[tokio::test]
    async fn transport_failures_answer_500_with_a_fixed_message() {
        let sink = Arc::new(MemorySink::new());
        let pipeline = unsigned_pipeline(Arc::new(FailingOrigin), Arc::clone(&sink));

        let response = pipeline
            .execute(
                post_request("{\"query\":\"{ me }\"}"),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["message"], "internal error");

        let reports = sink.take();
        assert!(!reports[0].ok);
        assert_eq!(
            reports[0].errors.as_ref().unwrap()[0]["message"],
            "connection refused"
        );
    }

    #[tokio::test]
    async fn undecodable_origin_json_answers_406() {
        let sink = Arc::new(MemorySink::new());
        let pipeline = unsigned_pipeline(
            Arc::new(StaticOrigin {
                status: StatusCode::OK,
                content_type: "application/json",
                body: "{broken",
            }),
            Arc::clone(&sink),
        );

        let response = pipeline
            .execute(
                post_request("{\"query\":\"{ me }\"}"),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(response.status, StatusCode::NOT_ACCEPTABLE);
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["message"], "cannot parse response");
        assert_eq!(sink.take().len(), 1);
    }

    #[tokio::test]
    async fn rejected_requests_report_with_the_cannot_parse_prefix() {
        let sink = Arc::new(MemorySink::new());
        let pipeline = unsigned_pipeline(
            Arc::new(StaticOrigin {
                status: StatusCode::OK,
                content_type: "application/json",
                body: "{}",
            }),
            Arc::clone(&sink),
        );

        let response = pipeline
            .execute(post_request("not json"), CancellationToken::new())
            .await;

        assert_eq!(response.status, StatusCode::FORBIDDEN);
        let reports = sink.take();
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].errors.as_ref().unwrap()[0]["message"],
            "cannot parse: not valid body"
        );
        assert_eq!(reports[0].durations.proxying, 0);
    }

    #[tokio::test]
    async fn cancellation_during_fetch_reports_and_answers_499() {
        let sink = Arc::new(MemorySink::new());
        let pipeline = unsigned_pipeline(Arc::new(PendingOrigin), Arc::clone(&sink));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let response = pipeline
            .execute(post_request("{\"query\":\"{ me }\"}"), cancel)
            .await;

        assert_eq!(response.status.as_u16(), 499);
        let reports = sink.take();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].ok);
        assert_eq!(reports[0].errors.as_ref().unwrap()[0]["message"], "cancelled");
    }

    #[tokio::test]
    async fn non_post_traffic_relays_without_reports_in_signature_mode() {
        struct RawOrigin;
        #[async_trait]
        impl OriginFetch for RawOrigin {
            async fn fetch(
                &self,
                _headers: HeaderMap,
                _body: OriginRequestBody,
            ) -> GateResult<OriginResponse> {
                unreachable!("raw traffic must not take the policy path")
            }
            async fn fetch_raw(
                &self,
                method: Method,
                _headers: HeaderMap,
                _body: Bytes,
            ) -> GateResult<OriginResponse> {
                assert_eq!(method, Method::GET);
                Ok(OriginResponse {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    body: Bytes::from_static(b"raw"),
                })
            }
        }

        let sink = Arc::new(MemorySink::new());
        let pipeline = unsigned_pipeline(Arc::new(RawOrigin), Arc::clone(&sink));
        let req = InboundRequest::new(
            Method::GET,
            Uri::from_static("/graphql"),
            HeaderMap::new(),
            Bytes::new(),
        );

        let response = pipeline.execute(req, CancellationToken::new()).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"raw");
        assert!(sink.take().is_empty());
    }
}
