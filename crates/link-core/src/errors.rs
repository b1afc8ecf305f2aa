//! JSON-RPC error codes and the error type returned by method handlers.
//!
//! Handlers fail with an [`RpcError`]; the session turns it into the wire
//! [`ErrorObject`] carried by an error Response. Codes follow JSON-RPC 2.0,
//! plus `-32500` for domain failures and a few server-defined codes in the
//! reserved `-32000..=-32099` range.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Error code constants ────────────────────────────────────────────

/// Malformed JSON, or a message that is neither a Request nor a Response.
pub const PARSE_ERROR: i64 = -32700;
/// Structurally invalid envelope, or an operation invalid in the current state.
pub const INVALID_REQUEST: i64 = -32600;
/// No handler registered for the method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Missing or malformed parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Unexpected failure inside a handler.
pub const INTERNAL_ERROR: i64 = -32603;
/// Domain failure: adapter unavailable, pairing failed, write failed, ...
pub const APPLICATION_ERROR: i64 = -32500;
/// Adapter state never settled within the configured bound.
pub const TIMEOUT: i64 = -32000;
/// Inbound frame exceeded the configured size limit.
pub const MESSAGE_TOO_LARGE: i64 = -32001;
/// The session closed before the request could complete.
pub const SESSION_CLOSED: i64 = -32002;

/// Lowest code of the server-defined range.
pub const SERVER_ERROR_MIN: i64 = -32099;
/// Highest code of the server-defined range.
pub const SERVER_ERROR_MAX: i64 = -32000;

/// Whether `code` lies in the reserved server-defined range.
pub fn is_server_error(code: i64) -> bool {
    (SERVER_ERROR_MIN..=SERVER_ERROR_MAX).contains(&code)
}

/// Wire-format error object (`{code, message, data?}`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional opaque details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// RPC error type returned by handlers.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// The raw message could not be parsed.
    #[error("{message}")]
    Parse {
        /// Description of the parse failure.
        message: String,
    },

    /// The envelope is invalid, or the call is not valid in the current state.
    #[error("{message}")]
    InvalidRequest {
        /// Description.
        message: String,
    },

    /// No handler is registered under `method`.
    #[error("Method not found: {method}")]
    MethodNotFound {
        /// The requested method name.
        method: String,
    },

    /// Required parameter missing or of the wrong shape.
    #[error("{message}")]
    InvalidParams {
        /// Description of what is wrong.
        message: String,
    },

    /// Unexpected failure inside a handler.
    #[error("{message}")]
    Internal {
        /// Description safe to show to the client.
        message: String,
        /// Optional opaque details.
        data: Option<Value>,
    },

    /// Domain-level failure.
    #[error("{message}")]
    Application {
        /// Description.
        message: String,
        /// Optional structured details.
        data: Option<Value>,
    },

    /// Server-defined or otherwise unclassified code.
    #[error("{message}")]
    Custom {
        /// Numeric code.
        code: i64,
        /// Description.
        message: String,
        /// Optional structured details.
        data: Option<Value>,
    },
}

impl RpcError {
    /// Shorthand for [`RpcError::InvalidRequest`].
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Shorthand for [`RpcError::InvalidParams`].
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Shorthand for [`RpcError::Application`] without details.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
            data: None,
        }
    }

    /// The generic internal error sent in place of unexpected failures.
    pub fn internal() -> Self {
        Self::Internal {
            message: "Internal error".into(),
            data: None,
        }
    }

    /// The adapter (or another bounded wait) did not settle in time.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Custom {
            code: TIMEOUT,
            message: message.into(),
            data: None,
        }
    }

    /// Inbound frame rejected for size.
    pub fn message_too_large(size: usize, max: usize) -> Self {
        Self::Custom {
            code: MESSAGE_TOO_LARGE,
            message: format!("Message too large ({size} > {max} bytes)"),
            data: None,
        }
    }

    /// The session closed before the operation completed.
    pub fn session_closed() -> Self {
        Self::Custom {
            code: SESSION_CLOSED,
            message: "Session closed".into(),
            data: None,
        }
    }

    /// Numeric wire code for this error.
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse { .. } => PARSE_ERROR,
            Self::InvalidRequest { .. } => INVALID_REQUEST,
            Self::MethodNotFound { .. } => METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::Internal { .. } => INTERNAL_ERROR,
            Self::Application { .. } => APPLICATION_ERROR,
            Self::Custom { code, .. } => *code,
        }
    }

    /// Short classification string for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse_error",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::MethodNotFound { .. } => "method_not_found",
            Self::InvalidParams { .. } => "invalid_params",
            Self::Internal { .. } => "internal_error",
            Self::Application { .. } => "application_error",
            Self::Custom { code, .. } if is_server_error(*code) => "server_error",
            Self::Custom { .. } => "custom",
        }
    }

    /// Convert to the wire-format error object.
    pub fn to_error_object(&self) -> ErrorObject {
        let data = match self {
            Self::Internal { data, .. }
            | Self::Application { data, .. }
            | Self::Custom { data, .. } => data.clone(),
            _ => None,
        };
        ErrorObject {
            code: self.code(),
            message: self.to_string(),
            data,
        }
    }
}

impl From<ErrorObject> for RpcError {
    fn from(obj: ErrorObject) -> Self {
        let ErrorObject {
            code,
            message,
            data,
        } = obj;
        match code {
            PARSE_ERROR => Self::Parse { message },
            INVALID_REQUEST => Self::InvalidRequest { message },
            METHOD_NOT_FOUND => Self::MethodNotFound { method: message },
            INVALID_PARAMS => Self::InvalidParams { message },
            INTERNAL_ERROR => Self::Internal { message, data },
            APPLICATION_ERROR => Self::Application { message, data },
            _ => Self::Custom {
                code,
                message,
                data,
            },
        }
    }
}

impl From<&RpcError> for ErrorObject {
    fn from(err: &RpcError) -> Self {
        err.to_error_object()
    }
}
