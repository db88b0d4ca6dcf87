//! Typed configuration for the gate, loaded from a JSON file with
//! `GATE_`-prefixed environment overrides layered on top.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::digest::HashAlgorithm;
use crate::shape::ResponseRules;

const ENV_ORIGIN_URL: &str = "GATE_ORIGIN_URL";
const ENV_MODE: &str = "GATE_MODE";
const ENV_PASS_THROUGH_HASH: &str = "GATE_PASS_THROUGH_HASH";
const ENV_SIGN_SECRET: &str = "GATE_SIGN_SECRET";
const ENV_MAX_TOKENS: &str = "GATE_MAX_TOKENS";
const ENV_LISTEN: &str = "GATE_LISTEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which admission gate fronts the pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateMode {
    #[default]
    Signature,
    Store,
}

/// HMAC signing secret, either a bare string (SHA-256) or an explicit
/// `{secret, algorithm}` pair.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum SignSecret {
    Raw(String),
    WithAlgorithm {
        secret: String,
        #[serde(default)]
        algorithm: HashAlgorithm,
    },
}

impl SignSecret {
    pub fn secret(&self) -> &str {
        match self {
            SignSecret::Raw(secret) => secret,
            SignSecret::WithAlgorithm { secret, .. } => secret,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            SignSecret::Raw(_) => HashAlgorithm::default(),
            SignSecret::WithAlgorithm { algorithm, .. } => *algorithm,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GateConfig {
    /// Upstream GraphQL server.
    pub origin_url: Url,
    #[serde(default)]
    pub mode: GateMode,
    /// Hex SHA-256 of the passthrough token.
    #[serde(default)]
    pub pass_through_hash: Option<String>,
    #[serde(default)]
    pub sign_secret: Option<SignSecret>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub response_rules: ResponseRules,
    /// Path of the operation manifest; required in store mode.
    #[serde(default)]
    pub operations: Option<PathBuf>,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

fn default_max_tokens() -> usize {
    2000
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

impl GateConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        let mut config: GateConfig =
            serde_json::from_str(&content).map_err(|err| ConfigError::Invalid(err.to_string()))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw) = std::env::var(ENV_ORIGIN_URL) {
            self.origin_url = raw
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{ENV_ORIGIN_URL} is not a URL")))?;
        }
        if let Ok(raw) = std::env::var(ENV_MODE) {
            self.mode = match raw.to_ascii_lowercase().as_str() {
                "signature" => GateMode::Signature,
                "store" => GateMode::Store,
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "{ENV_MODE} must be signature or store"
                    )))
                }
            };
        }
        if let Ok(raw) = std::env::var(ENV_PASS_THROUGH_HASH) {
            self.pass_through_hash = Some(raw);
        }
        if let Ok(raw) = std::env::var(ENV_SIGN_SECRET) {
            self.sign_secret = Some(SignSecret::Raw(raw));
        }
        if let Ok(raw) = std::env::var(ENV_MAX_TOKENS) {
            self.max_tokens = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{ENV_MAX_TOKENS} is not an integer")))?;
        }
        if let Ok(raw) = std::env::var(ENV_LISTEN) {
            self.listen = raw.parse().map_err(|_| {
                ConfigError::Invalid(format!("{ENV_LISTEN} is not a socket address"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    fn minimal() -> serde_json::Value {
        json!({"origin_url": "https://origin.example/graphql"})
    }

    #[test]
    fn defaults_apply_to_a_minimal_config() {
        let config: GateConfig = serde_json::from_value(minimal()).unwrap();
        assert_eq!(config.mode, GateMode::Signature);
        assert_eq!(config.max_tokens, 2000);
        assert!(config.pass_through_hash.is_none());
        assert!(config.sign_secret.is_none());
        assert_eq!(config.listen, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(
            config.response_rules.error_masking.as_deref(),
            Some("[Suggestion hidden]")
        );
        assert!(!config.response_rules.remove_extensions);
        assert!(config.response_rules.shape_passthrough);
    }

    #[test]
    fn sign_secret_accepts_both_shapes() {
        let config: GateConfig = serde_json::from_value(json!({
            "origin_url": "https://origin.example/graphql",
            "sign_secret": "signature"
        }))
        .unwrap();
        let secret = config.sign_secret.unwrap();
        assert_eq!(secret.secret(), "signature");
        assert_eq!(secret.algorithm(), HashAlgorithm::Sha256);

        let config: GateConfig = serde_json::from_value(json!({
            "origin_url": "https://origin.example/graphql",
            "sign_secret": {"secret": "signature", "algorithm": "SHA-384"}
        }))
        .unwrap();
        let secret = config.sign_secret.unwrap();
        assert_eq!(secret.algorithm(), HashAlgorithm::Sha384);
    }

    #[test]
    fn masking_can_be_disabled_with_null() {
        let config: GateConfig = serde_json::from_value(json!({
            "origin_url": "https://origin.example/graphql",
            "response_rules": {"error_masking": null, "remove_extensions": true}
        }))
        .unwrap();
        assert!(config.response_rules.error_masking.is_none());
        assert!(config.response_rules.remove_extensions);
    }

    #[test]
    #[serial]
    fn environment_overrides_take_precedence() {
        let mut config: GateConfig = serde_json::from_value(minimal()).unwrap();
        std::env::set_var(ENV_MODE, "store");
        std::env::set_var(ENV_MAX_TOKENS, "5000");
        let result = config.apply_env_overrides();
        std::env::remove_var(ENV_MODE);
        std::env::remove_var(ENV_MAX_TOKENS);
        result.unwrap();
        assert_eq!(config.mode, GateMode::Store);
        assert_eq!(config.max_tokens, 5000);
    }

    #[test]
    #[serial]
    fn invalid_environment_values_are_reported() {
        let mut config: GateConfig = serde_json::from_value(minimal()).unwrap();
        std::env::set_var(ENV_MAX_TOKENS, "many");
        let result = config.apply_env_overrides();
        std::env::remove_var(ENV_MAX_TOKENS);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
