//! JSON-RPC error codes and error payloads.

use serde::{Deserialize, Serialize};

/// Integer error codes defined by JSON-RPC 2.0 plus the LSP extensions.
///
/// Codes outside the known set survive a decode/encode round trip via
/// [`ErrorCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ServerNotInitialized,
    RequestCancelled,
    ContentModified,
    Other(i64),
}

impl ErrorCode {
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerNotInitialized => -32002,
            Self::RequestCancelled => -32800,
            Self::ContentModified => -32801,
            Self::Other(code) => code,
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32002 => Self::ServerNotInitialized,
            -32800 => Self::RequestCancelled,
            -32801 => Self::ContentModified,
            other => Self::Other(other),
        }
    }
}

impl From<ErrorCode> for i64 {
    fn from(code: ErrorCode) -> i64 {
        code.code()
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct ResponseError {
    pub code: ErrorCode,
    pub message: String,
}

impl ResponseError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// How a server-originated call can fail to produce a client result.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The in-flight bound was hit and this call's slot was reclaimed
    /// before the client replied.
    #[error("failed to receive a client reply for request ({0})")]
    Evicted(i64),
    /// The client replied with an error.
    #[error(transparent)]
    Rpc(#[from] ResponseError),
    /// The endpoint shut down before the client replied.
    #[error("connection closed before the client replied")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_round_trip() {
        for code in [-32700, -32600, -32601, -32602, -32603, -32002, -32800, -32801] {
            let parsed = ErrorCode::from(code);
            assert!(!matches!(parsed, ErrorCode::Other(_)), "{code} should be known");
            assert_eq!(parsed.code(), code);
        }
    }

    #[test]
    fn unknown_code_preserved() {
        let parsed = ErrorCode::from(-32099);
        assert_eq!(parsed, ErrorCode::Other(-32099));
        assert_eq!(parsed.code(), -32099);
    }

    #[test]
    fn response_error_serializes_as_wire_object() {
        let error = ResponseError::new(ErrorCode::MethodNotFound, "method not found");
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json, serde_json::json!({"code": -32601, "message": "method not found"}));
    }

    #[test]
    fn response_error_ignores_extra_members() {
        let json = serde_json::json!({"code": -32602, "message": "bad params", "data": {"hint": 1}});
        let error: ResponseError = serde_json::from_value(json).unwrap();
        assert_eq!(error.code, ErrorCode::InvalidParams);
        assert_eq!(error.message, "bad params");
    }

    #[test]
    fn eviction_error_names_the_request() {
        let error = CallError::Evicted(42);
        assert_eq!(
            error.to_string(),
            "failed to receive a client reply for request (42)"
        );
    }
}
