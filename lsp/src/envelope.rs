//! The decoded forms of inbound and outbound JSON-RPC frames.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ResponseError;

/// A request id as the client sent it. JSON-RPC allows integers and strings;
/// both are preserved bit-identically so the reply correlates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    #[must_use]
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(_) => None,
        }
    }

    /// JSON serialization of the id. Used as a map key where ids of both
    /// shapes must coexist: `5` and `"5"` stay distinct.
    #[must_use]
    pub fn registry_key(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::String(s) => Value::String(s.clone()).to_string(),
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// One inbound message, classified by shape.
#[derive(Debug)]
pub(crate) enum Envelope {
    Notification {
        method: String,
        params: Value,
    },
    Call {
        id: RequestId,
        method: String,
        params: Value,
    },
    Reply {
        id: RequestId,
        result: Result<Value, ResponseError>,
    },
}

impl Envelope {
    /// Classify a raw frame. Returns `None` for frames that are not valid
    /// JSON-RPC traffic (no method and no id, unusable id, ...); the caller
    /// logs and drops those.
    pub(crate) fn from_frame(frame: &Value) -> Option<Envelope> {
        let object = frame.as_object()?;
        let id = match object.get("id") {
            Some(raw) => Some(serde_json::from_value::<RequestId>(raw.clone()).ok()?),
            None => None,
        };
        let method = object.get("method").and_then(Value::as_str);
        let has_outcome = object.contains_key("result") || object.contains_key("error");
        let params = || object.get("params").cloned().unwrap_or(Value::Null);

        match (id, method, has_outcome) {
            (Some(id), Some(method), _) => Some(Envelope::Call {
                id,
                method: method.to_owned(),
                params: params(),
            }),
            (None, Some(method), _) => Some(Envelope::Notification {
                method: method.to_owned(),
                params: params(),
            }),
            (Some(id), None, true) => {
                let result = match object.get("result") {
                    Some(value) => Ok(value.clone()),
                    None => Err(object
                        .get("error")
                        .cloned()
                        .and_then(|raw| serde_json::from_value::<ResponseError>(raw).ok())
                        .unwrap_or_else(|| {
                            ResponseError::new(
                                crate::error::ErrorCode::InternalError,
                                "malformed error in reply",
                            )
                        })),
                };
                Some(Envelope::Reply { id, result })
            }
            _ => None,
        }
    }
}

/// One outbound message, serialized by the writer task.
#[derive(Debug)]
pub(crate) enum OutgoingFrame {
    Notification {
        method: String,
        params: Value,
    },
    Call {
        id: i64,
        method: String,
        params: Value,
    },
    Reply {
        id: RequestId,
        result: Result<Value, ResponseError>,
    },
}

impl OutgoingFrame {
    pub(crate) fn to_value(&self) -> Value {
        match self {
            Self::Notification { method, params } => json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
            }),
            Self::Call { id, method, params } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }),
            Self::Reply { id, result: Ok(result) } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            }),
            Self::Reply { id, result: Err(error) } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": error,
            }),
        }
    }
}
