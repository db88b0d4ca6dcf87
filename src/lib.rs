//! gqlgate: an edge reverse proxy enforcing a security and observability
//! policy in front of a GraphQL origin.
//!
//! The crate is a five-stage pipeline — admit, proxy, decode, shape,
//! collect — over narrow seams: admission is either an HMAC signature
//! over the canonical document ([`signature`]) or a preregistered
//! operation catalog ([`registry`]); the upstream sits behind
//! [`proxy::OriginFetch`]; per-request reports flow to a
//! [`report::ReportSink`]. The axum surface in [`server`] is plumbing
//! only.

pub mod canon;
pub mod config;
pub mod digest;
pub mod errors;
pub mod pipeline;
pub mod proxy;
pub mod registry;
pub mod report;
pub mod request;
pub mod server;
pub mod shape;
pub mod signature;

pub use config::{GateConfig, GateMode, SignSecret};
pub use errors::{GateError, GateResult};
pub use pipeline::{AdmissionGate, ClientResponse, Hooks, NoopHooks, Pipeline};
pub use proxy::{HttpOrigin, OriginFetch, OriginRequestBody, OriginResponse};
pub use registry::{OperationDefinition, OperationKind, OperationRegistry, ValidationError};
pub use report::{Report, ReportContext, ReportSink};
pub use request::{InboundRequest, ParsedRequest};
pub use server::{router, GateState};
pub use signature::SignatureGate;
