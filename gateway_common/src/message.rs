//! JSON-RPC message codec.
//!
//! A frame decodes into exactly one [`Message`]:
//!
//! - `Request` when both `method` and `id` are present,
//! - `Notification` when `method` is present without `id`,
//! - `Response` otherwise (it must carry `result` or `error`).
//!
//! Decoding never panics and never aborts a stream: a bad frame becomes a
//! [`CodecError`] holding the offending text, and the caller logs and moves on.
//! Encoding always emits `"jsonrpc":"2.0"` first, followed by `id`.

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// Caller-chosen request identifier. Equality is by raw value, so `7` and
/// `"7"` are different ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(serde_json::Number),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value.into())
    }
}

impl From<i32> for RequestId {
    fn from(value: i32) -> Self {
        RequestId::Number(value.into())
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        RequestId::Number(value.into())
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Matches the MCP SDKs' request-timeout code.
    pub const REQUEST_TIMEOUT: i64 = -32001;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn request_timed_out(timeout: Duration) -> Self {
        Self::new(Self::REQUEST_TIMEOUT, "Request timed out").with_data(serde_json::json!({
            "timeoutMs": timeout.as_millis() as u64
        }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(ErrorObject),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// `None` only for error responses the peer could not attribute.
    pub id: Option<RequestId>,
    pub payload: ResponsePayload,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            payload: ResponsePayload::Result(result),
        }
    }

    pub fn failure(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    /// Same payload, re-tagged with `id`.
    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Result(value) => Some(value),
            ResponsePayload::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorObject> {
        match &self.payload {
            ResponsePayload::Error(error) => Some(error),
            ResponsePayload::Result(_) => None,
        }
    }
}

/// One protocol message. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// A frame that could not be decoded. Carries the raw frame for logging.
#[derive(Error, Debug, Clone)]
#[error("invalid JSON-RPC frame ({reason}): {frame}")]
pub struct CodecError {
    pub frame: String,
    pub reason: String,
}

impl CodecError {
    fn new(frame: &str, reason: impl Into<String>) -> Self {
        Self {
            frame: frame.to_string(),
            reason: reason.into(),
        }
    }
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    /// Decode one frame.
    pub fn decode(frame: &str) -> Result<Self, CodecError> {
        let value: Value =
            serde_json::from_str(frame).map_err(|e| CodecError::new(frame, e.to_string()))?;
        Self::from_value(value).map_err(|reason| CodecError::new(frame, reason))
    }

    /// Encode to a single line of JSON (no trailing newline).
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Classify an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut map) = value else {
            return Err("message is not a JSON object".to_string());
        };

        let id = match map.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<RequestId>(raw)
                    .map_err(|_| "id must be a string or a number".to_string())?,
            ),
        };
        let params = map.remove("params");

        match map.remove("method") {
            Some(Value::String(method)) => Ok(match id {
                Some(id) => Message::Request(Request { id, method, params }),
                None => Message::Notification(Notification { method, params }),
            }),
            Some(_) => Err("method must be a string".to_string()),
            None => Self::response_from_map(id, map).map(Message::Response),
        }
    }

    fn response_from_map(id: Option<RequestId>, mut map: Map<String, Value>) -> Result<Response, String> {
        if let Some(error) = map.remove("error")
            && !error.is_null()
        {
            let error: ErrorObject = serde_json::from_value(error)
                .map_err(|e| format!("malformed error object: {}", e))?;
            return Ok(Response::failure(id, error));
        }
        match map.remove("result") {
            Some(result) => Ok(Response {
                id,
                payload: ResponsePayload::Result(result),
            }),
            None => Err("response carries neither result nor error".to_string()),
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(r) => Some(&r.id),
            Message::Response(r) => r.id.as_ref(),
            Message::Notification(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Notification(_) => "notification",
        }
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Message::Request(value)
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Message::Response(value)
    }
}

impl From<Notification> for Message {
    fn from(value: Notification) -> Self {
        Message::Notification(value)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        match self {
            Message::Request(request) => {
                map.serialize_entry("id", &request.id)?;
                map.serialize_entry("method", &request.method)?;
                if let Some(params) = &request.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Message::Notification(notification) => {
                map.serialize_entry("method", &notification.method)?;
                if let Some(params) = &notification.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Message::Response(response) => {
                map.serialize_entry("id", &response.id)?;
                match &response.payload {
                    ResponsePayload::Result(result) => map.serialize_entry("result", result)?,
                    ResponsePayload::Error(error) => map.serialize_entry("error", error)?,
                }
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::from_value(value).map_err(D::Error::custom)
    }
}
