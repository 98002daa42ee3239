//! Inbound message handling for the SSE transport.
//!
//! Clients POST one JSON-RPC message per request to the endpoint announced on
//! their SSE stream. The message is queued for the backing process and the
//! POST is acknowledged with `202 Accepted`; any reply arrives on the stream.

use crate::error::BridgeError;
use crate::fanout::FanoutBridge;
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use gateway_common::{ErrorObject, Message};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Session header, accepted as an alternative to the `sessionId` query parameter.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// Query string of the message endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Create a JSON response with the provided status.
fn json_response_with_status(status: StatusCode, value: Value) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&value).unwrap_or_default()))
        .unwrap_or_else(|_| (status, "Failed to create response").into_response())
}

/// Build a JSON-RPC error object.
fn json_rpc_error_value(code: i64, message: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": {
            "code": code,
            "message": message
        }
    })
}

/// Create an error response with the provided status and JSON-RPC code.
pub(crate) fn error_response_with_status(status: StatusCode, code: i64, message: &str) -> Response {
    json_response_with_status(status, json_rpc_error_value(code, message))
}

/// Attach MCP session header when available.
pub(crate) fn with_session_header(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(MCP_SESSION_ID_HEADER, value);
    }
    response
}

/// Session id from the query string, falling back to the session header.
fn resolve_session_id(query: &SessionQuery, headers: &HeaderMap) -> Option<String> {
    query
        .session_id
        .clone()
        .filter(|id| !id.is_empty())
        .or_else(|| {
            headers
                .get(MCP_SESSION_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
}

/// Handle one POSTed message for an SSE session.
pub async fn handle_message_post(
    bridge: &FanoutBridge,
    query: SessionQuery,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let Some(session_id) = resolve_session_id(&query, headers) else {
        return error_response_with_status(
            StatusCode::BAD_REQUEST,
            ErrorObject::INVALID_REQUEST,
            "Missing sessionId query parameter or Mcp-Session-Id header",
        );
    };

    if !bridge.session_exists(&session_id) {
        warn!(session_id = %session_id, "POST for unknown session");
        return error_response_with_status(
            StatusCode::NOT_FOUND,
            ErrorObject::INVALID_REQUEST,
            "Session not found or expired",
        );
    }

    let text = String::from_utf8_lossy(&body);
    let message = match Message::decode(&text) {
        Ok(message) => message,
        Err(e) => {
            warn!(session_id = %session_id, "Rejecting undecodable message: {}", e.reason);
            return with_session_header(
                error_response_with_status(
                    StatusCode::BAD_REQUEST,
                    ErrorObject::PARSE_ERROR,
                    &format!("Parse error: {}", e.reason),
                ),
                &session_id,
            );
        }
    };

    debug!(session_id = %session_id, kind = message.kind(), "Accepted message");
    let response = match bridge.submit(&session_id, message).await {
        Ok(()) => (StatusCode::ACCEPTED, "Accepted").into_response(),
        Err(BridgeError::UnknownSession(_)) => error_response_with_status(
            StatusCode::NOT_FOUND,
            ErrorObject::INVALID_REQUEST,
            "Session not found or expired",
        ),
        Err(e) => error_response_with_status(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorObject::INTERNAL_ERROR,
            &e.to_string(),
        ),
    };
    with_session_header(response, &session_id)
}
