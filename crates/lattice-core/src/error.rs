use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors produced by the lattice runtime itself.
///
/// Request-scoped failures (policy rejections, schema issues, remote errors)
/// are *values* — see [`ErrorPayload`] — and never surface as this type.
#[derive(Debug, Error)]
pub enum LatticeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("peer not registered: {0}")]
    PeerNotFound(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for LatticeError {
    fn from(e: serde_json::Error) -> Self {
        LatticeError::Codec(e.to_string())
    }
}

pub type LatticeResult<T> = Result<T, LatticeError>;

/// The structured error shape every caller sees, regardless of transport.
///
/// JSON/form callers get it as a status-coded body, WebSocket callers as the
/// body of an `error` event, and peers as the rejection payload of a
/// forwarded call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub result: String,
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    /// Any additional fields a handler attached when rejecting.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ErrorPayload {
    /// Build an error payload for an HTTP-style status with its canonical message.
    pub fn status(status: u16) -> Self {
        let message = match status {
            400 => "Bad request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            500 => "Internal server error",
            504 => "Gateway Timeout",
            _ => "Unknown error",
        };
        Self {
            result: "error".to_string(),
            status,
            message: message.to_string(),
            info: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_info(mut self, info: impl Into<Value>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// The synthetic error used when a remote owner is unreachable or a
    /// pending call exceeds its deadline.
    pub fn gateway_timeout(detail: impl Into<String>) -> Self {
        ErrorPayload::status(504).with_info(Value::String(detail.into()))
    }

    /// Merge arbitrary thrown fields over a default status shape.
    ///
    /// Policy failures report whatever the policy threw, layered over
    /// `{status: 401}`; fields present in `thrown` win.
    pub fn merge_over(status: u16, thrown: Value) -> Self {
        let mut base = ErrorPayload::status(status);
        if let Value::Object(map) = thrown {
            for (key, value) in map {
                match key.as_str() {
                    "status" => {
                        if let Some(s) = value.as_u64() {
                            base.status = s as u16;
                        }
                    }
                    "message" => {
                        if let Some(m) = value.as_str() {
                            base.message = m.to_string();
                        }
                    }
                    "result" => {
                        if let Some(r) = value.as_str() {
                            base.result = r.to_string();
                        }
                    }
                    "info" => base.info = Some(value),
                    _ => {
                        base.extra.insert(key, value);
                    }
                }
            }
        } else if !thrown.is_null() {
            base.info = Some(thrown);
        }
        base
    }
}
