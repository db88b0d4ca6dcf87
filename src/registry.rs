//! Preregistered operation catalog and store-mode admission.
//!
//! In store mode a client names a catalog entry; the proxied query is
//! always the entry's stored text, so callers cannot execute arbitrary
//! documents. The catalog is loaded once from a generated JSON manifest
//! and shared read-only across requests; validator registration is a
//! configure-then-serve step.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use axum::http::Method;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::errors::{GateError, GateResult};
use crate::request::{first_string_key, first_value_key, InboundRequest, ParsedRequest};

const POST_NAME_KEYS: [&str; 4] = ["op", "operationName", "operation", "query"];
const GET_NAME_KEYS: [&str; 3] = ["op", "operation", "query"];
const VARIABLE_KEYS: [&str; 2] = ["v", "variables"];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read operation manifest: {0}")]
    Io(String),
    #[error("invalid operation manifest: {0}")]
    Decode(String),
    #[error("unknown operation {0}")]
    UnknownOperation(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// One entry of the generated manifest
/// `[{operationName, operationType, query, behaviour}]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationDefinition {
    #[serde(rename = "operationName")]
    pub name: String,
    #[serde(rename = "operationType")]
    pub kind: OperationKind,
    pub query: String,
    /// Open key/value map. `ttl` is recognized downstream for caching;
    /// unknown keys ride along untouched.
    #[serde(default)]
    pub behaviour: Map<String, Value>,
}

impl OperationDefinition {
    pub fn ttl_seconds(&self) -> Option<u64> {
        self.behaviour.get("ttl").and_then(Value::as_u64)
    }
}

/// A validator inspects the resolved operation before it is proxied.
/// Returning an error rejects the request with status 400.
pub type Validator = Arc<
    dyn Fn(&OperationDefinition, &ParsedRequest, &InboundRequest) -> Option<ValidationError>
        + Send
        + Sync,
>;

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub struct OperationRegistry {
    operations: HashMap<String, Arc<OperationDefinition>>,
    validators: RwLock<HashMap<String, Validator>>,
}

impl OperationRegistry {
    pub fn from_manifest(definitions: Vec<OperationDefinition>) -> Self {
        let operations = definitions
            .into_iter()
            .map(|definition| (definition.name.clone(), Arc::new(definition)))
            .collect();
        Self {
            operations,
            validators: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_manifest_file(path: &Path) -> Result<Self, RegistryError> {
        let content =
            std::fs::read_to_string(path).map_err(|err| RegistryError::Io(err.to_string()))?;
        let definitions: Vec<OperationDefinition> =
            serde_json::from_str(&content).map_err(|err| RegistryError::Decode(err.to_string()))?;
        Ok(Self::from_manifest(definitions))
    }

    pub fn get(&self, name: &str) -> Option<Arc<OperationDefinition>> {
        self.operations.get(name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<OperationDefinition>> {
        self.operations.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Installs or removes the validator for `name`. Expected during
    /// initialization, before concurrent readers exist.
    pub fn set_validator(
        &self,
        name: &str,
        validator: Option<Validator>,
    ) -> Result<(), RegistryError> {
        if !self.operations.contains_key(name) {
            return Err(RegistryError::UnknownOperation(name.to_string()));
        }
        let mut validators = self.validators.write();
        match validator {
            Some(validator) => {
                validators.insert(name.to_string(), validator);
            }
            None => {
                validators.remove(name);
            }
        }
        Ok(())
    }

    /// Store-mode admission: resolve the named operation and run its
    /// validator. The admitted query is the registry's text, never the
    /// caller's.
    pub fn admit(&self, req: &InboundRequest) -> GateResult<ParsedRequest> {
        let (name, variables) = if req.method == Method::POST {
            extract_from_body(req)?
        } else if req.method == Method::GET {
            extract_from_query_string(req)?
        } else {
            return Err(GateError::routing("method not supported"));
        };

        let name = name.ok_or_else(|| GateError::routing("no operation defined"))?;
        let definition = self
            .get(&name)
            .ok_or_else(|| GateError::routing(format!("operation {name} not found")))?;

        let parsed = ParsedRequest {
            query: definition.query.clone(),
            operation_name: Some(definition.name.clone()),
            variables,
            headers: req.headers.clone(),
            operation: Some(Arc::clone(&definition)),
            passthrough: false,
        };

        let validator = self.validators.read().get(&definition.name).cloned();
        if let Some(validator) = validator {
            match catch_unwind(AssertUnwindSafe(|| validator(&definition, &parsed, req))) {
                Ok(None) => {}
                Ok(Some(error)) => return Err(GateError::validation(error.message)),
                Err(_) => {
                    warn!(operation = %definition.name, "validator panicked");
                    return Err(GateError::validation("input validation"));
                }
            }
        }

        Ok(parsed)
    }
}

fn extract_from_body(
    req: &InboundRequest,
) -> GateResult<(Option<String>, Option<Map<String, Value>>)> {
    let body: Value = serde_json::from_slice(&req.body)
        .map_err(|err| GateError::routing(err.to_string()))?;
    let name = first_string_key(&body, &POST_NAME_KEYS).map(str::to_owned);
    let variables = match first_value_key(&body, &VARIABLE_KEYS) {
        None => None,
        Some(Value::Object(map)) => Some(map.clone()),
        Some(Value::String(raw)) => Some(decode_variables(raw)?),
        Some(_) => return Err(GateError::routing("cannot extract request")),
    };
    Ok((name, variables))
}

fn extract_from_query_string(
    req: &InboundRequest,
) -> GateResult<(Option<String>, Option<Map<String, Value>>)> {
    let query_string = req.uri.query().unwrap_or("");
    let params: HashMap<String, String> = url::form_urlencoded::parse(query_string.as_bytes())
        .into_owned()
        .collect();

    let name = GET_NAME_KEYS
        .iter()
        .find_map(|key| params.get(*key))
        .cloned();
    let variables = match VARIABLE_KEYS.iter().find_map(|key| params.get(*key)) {
        None => None,
        Some(raw) => Some(decode_variables(raw)?),
    };
    Ok((name, variables))
}

fn decode_variables(raw: &str) -> GateResult<Map<String, Value>> {
    serde_json::from_str(raw).map_err(|_| GateError::routing("cannot extract request"))
}
