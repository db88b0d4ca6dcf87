//! Signature-mode admission.
//!
//! A request is admitted either by a preshared passthrough token (its
//! SHA-256 must match the configured hash) or by an HMAC over the
//! canonical form of the posted query. Rejection branches that run while
//! a signing secret is configured burn a dummy MAC so their code length
//! matches the verifying branch.

use axum::http::Method;

use crate::canon;
use crate::config::SignSecret;
use crate::digest;
use crate::errors::{GateError, GateResult};
use crate::request::{GraphQLRequestBody, InboundRequest, ParsedRequest};

/// Carries the hex HMAC of the canonical query.
pub const OP_HASH_HEADER: &str = "x-proxy-op-hash";
/// Carries the preshared passthrough token.
pub const PASS_SECRET_HEADER: &str = "x-proxy-pass-secret";

pub struct SignatureGate {
    pass_through_hash: Option<String>,
    sign_secret: Option<SignSecret>,
    max_tokens: usize,
}

impl SignatureGate {
    pub fn new(
        pass_through_hash: Option<String>,
        sign_secret: Option<SignSecret>,
        max_tokens: usize,
    ) -> Self {
        Self {
            pass_through_hash,
            sign_secret,
            max_tokens,
        }
    }

    pub fn admit(&self, req: &InboundRequest) -> GateResult<ParsedRequest> {
        let is_passthrough = match (&self.pass_through_hash, req.header_str(PASS_SECRET_HEADER)) {
            (Some(expected), Some(token)) => {
                let token_hash = digest::sha256_hex(token.as_bytes());
                if !digest::constant_time_eq(token_hash.as_bytes(), expected.as_bytes()) {
                    return Err(self.reject("Invalid x-proxy-op-hash header"));
                }
                true
            }
            _ => false,
        };

        let header_hash = req.header_str(OP_HASH_HEADER).map(str::to_owned);
        if self.sign_secret.is_some() && !is_passthrough && header_hash.is_none() {
            return Err(self.reject("signature not defined"));
        }

        if req.method != Method::POST {
            return Err(self.reject("not valid body"));
        }
        let body: GraphQLRequestBody = match serde_json::from_slice(&req.body) {
            Ok(body) => body,
            Err(_) => return Err(self.reject("not valid body")),
        };
        let query = match body.query {
            Some(query) if !query.is_empty() => query,
            _ => return Err(self.reject("Missing query in body")),
        };

        let canonical = match canon::canonical(&query, self.max_tokens) {
            Ok(canonical) => canonical,
            Err(_) => return Err(self.reject("cannot parse query")),
        };

        if let Some(secret) = &self.sign_secret {
            if !is_passthrough {
                let expected = digest::hmac_hex(
                    secret.secret().as_bytes(),
                    canonical.as_bytes(),
                    secret.algorithm(),
                );
                let provided = header_hash.as_deref().unwrap_or("");
                if !digest::constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
                    return Err(GateError::admission("Invalid x-proxy-op-hash header"));
                }
            }
        }

        Ok(ParsedRequest {
            query,
            operation_name: body.operation_name,
            variables: body.variables,
            headers: req.headers.clone(),
            operation: None,
            passthrough: is_passthrough,
        })
    }

    /// Rejection that keeps timing comparable with the verifying branch:
    /// when a signing secret exists, a MAC is computed here too.
    fn reject(&self, message: &str) -> GateError {
        if let Some(secret) = &self.sign_secret {
            digest::hmac_hex(secret.secret().as_bytes(), b"", secret.algorithm());
        }
        GateError::admission(message)
    }
}
