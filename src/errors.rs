use axum::http::StatusCode;
use thiserror::Error;

/// Failure taxonomy for the policy engine. Every stage reports faults
/// in-band through this type; nothing escapes a stage as a panic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GateError {
    /// Method not accepted or operation not registered.
    #[error("{0}")]
    Routing(String),
    /// Missing or invalid signature, undecodable body, unparseable query.
    #[error("{0}")]
    Admission(String),
    /// A per-operation validator rejected the request.
    #[error("{0}")]
    Validation(String),
    /// The origin fetch failed at the transport level. The inner text is
    /// for reports only; clients always see the fixed message.
    #[error("{0}")]
    Transport(String),
    /// The origin answered with a JSON content type but an undecodable body.
    #[error("cannot parse response")]
    Shape,
    /// The caller abandoned the request mid-pipeline.
    #[error("cancelled")]
    Cancelled,
}

/// Client-closed-request status, the nginx convention for abandoned work.
pub const STATUS_CLIENT_CLOSED: u16 = 499;

impl GateError {
    pub fn routing(message: impl Into<String>) -> Self {
        GateError::Routing(message.into())
    }

    pub fn admission(message: impl Into<String>) -> Self {
        GateError::Admission(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        GateError::Validation(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GateError::Routing(_) => StatusCode::NOT_FOUND,
            GateError::Admission(_) => StatusCode::FORBIDDEN,
            GateError::Validation(_) => StatusCode::BAD_REQUEST,
            GateError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GateError::Shape => StatusCode::NOT_ACCEPTABLE,
            GateError::Cancelled => {
                StatusCode::from_u16(STATUS_CLIENT_CLOSED).expect("499 is a valid status code")
            }
        }
    }

    /// The message placed in the client-visible `{"message": ...}` body.
    /// Transport details never reach the client.
    pub fn client_message(&self) -> String {
        match self {
            GateError::Transport(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

pub type GateResult<T> = Result<T, GateError>;
