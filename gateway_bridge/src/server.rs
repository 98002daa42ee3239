//! HTTP surface of the fan-out bridge.
//!
//! Two downstream transports are supported, selected by
//! [`OutputTransport`]:
//!
//! - **SSE**: `GET <sse_path>` opens a session. The first event is
//!   `event: endpoint` with `data: <message_path>?sessionId=<id>`; every
//!   broadcast follows as `event: message`. Clients POST messages to the
//!   announced endpoint.
//! - **WebSocket**: `GET <message_path>` upgrades; each text frame in either
//!   direction is one JSON-RPC message.
//!
//! Health endpoints answer `200 ok`. Configured extra headers are attached to
//! every response.

use crate::config::{BridgeConfig, CorsPolicy, OutputTransport};
use crate::error::{BridgeError, Result};
use crate::fanout::FanoutBridge;
use crate::request_handler::{
    MCP_SESSION_ID_HEADER, SessionQuery, error_response_with_status, handle_message_post,
    with_session_header,
};
use crate::sink::{ChannelSink, OutboundFrame, SinkReceiver};
use axum::{
    Router,
    body::Bytes,
    extract::{
        Query, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::{SinkExt, StreamExt, stream};
use gateway_common::{ErrorObject, Message};
use std::{convert::Infallible, future::IntoFuture, sync::Arc};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

/// Frames buffered per session before the write deadline starts to bite.
const SINK_QUEUE_CAPACITY: usize = 64;

/// Shared state for the bridge
struct ServerState {
    bridge: Arc<FanoutBridge>,
    message_path: String,
}

/// Deregisters the session when the connection's stream or task is dropped.
struct SessionGuard {
    bridge: Arc<FanoutBridge>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.bridge.close_session(&self.session_id) {
            debug!(session_id = %self.session_id, "Downstream connection closed");
        }
    }
}

/// Build a CORS layer for the configured policy. `None` means no CORS headers.
fn build_cors_layer(policy: &CorsPolicy) -> Option<CorsLayer> {
    let methods = AllowMethods::list([Method::GET, Method::POST, Method::OPTIONS]);
    let headers = AllowHeaders::list([
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::AUTHORIZATION,
        HeaderName::from_static(MCP_SESSION_ID_HEADER),
        HeaderName::from_static("last-event-id"),
    ]);
    let expose = ExposeHeaders::list([HeaderName::from_static(MCP_SESSION_ID_HEADER)]);

    let origin = match policy {
        CorsPolicy::Disabled => return None,
        CorsPolicy::AnyOrigin => AllowOrigin::any(),
        CorsPolicy::Origins(origins) => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|o| match HeaderValue::from_str(o) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!(origin = %o, "Ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            AllowOrigin::list(origins)
        }
    };

    Some(
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(methods)
            .allow_headers(headers)
            .expose_headers(expose),
    )
}

/// Assemble the router for `config` around a running bridge.
pub fn build_router(bridge: Arc<FanoutBridge>, config: &BridgeConfig) -> Result<Router> {
    let state = Arc::new(ServerState {
        bridge,
        message_path: config.message_path.clone(),
    });

    let mut app = Router::new();
    for path in &config.health_endpoints {
        app = app.route(path, get(health_check));
    }
    app = match config.output_transport {
        OutputTransport::Sse => app
            .route(&config.sse_path, get(handle_sse_stream))
            .route(&config.message_path, post(handle_message)),
        OutputTransport::Ws => app.route(&config.message_path, get(handle_ws_upgrade)),
    };

    let extra_headers = Arc::new(config.header_map()?);
    let mut app = app
        .with_state(state)
        .layer(middleware::map_response(move |mut response: Response| {
            let extra_headers = extra_headers.clone();
            async move {
                for (name, value) in extra_headers.iter() {
                    response.headers_mut().append(name.clone(), value.clone());
                }
                response
            }
        }));
    if let Some(cors) = build_cors_layer(&config.cors) {
        app = app.layer(cors);
    }
    Ok(app.layer(TraceLayer::new_for_http()))
}

/// Start the process and serve until it exits. Returns its exit code.
///
/// # Port Binding
///
/// If `config.bind_addr` specifies port 0, the OS will assign a random available port.
/// The actual bound port is printed to stderr as `STDIO_GATEWAY_BOUND_PORT=<port>`.
pub async fn start_bridge(config: BridgeConfig) -> Result<i32> {
    config.validate()?;

    // Spawn first: a bad command fails before anything listens
    let bridge = FanoutBridge::start(&config)?;

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| BridgeError::HttpServer(format!("Failed to bind: {}", e)))?;

    serve_bridge(listener, bridge, &config).await
}

/// Serve `bridge` on an already bound listener until the process exits.
pub async fn serve_bridge(listener: TcpListener, bridge: Arc<FanoutBridge>, config: &BridgeConfig) -> Result<i32> {
    let local_addr = listener
        .local_addr()
        .map_err(|e| BridgeError::HttpServer(format!("Failed to get local addr: {}", e)))?;

    if !local_addr.ip().is_loopback() {
        warn!(
            "Bridge bound to non-loopback address {}. Sessions are not authenticated.",
            local_addr
        );
    }

    let app = build_router(bridge.clone(), config)?;

    info!("Stdio gateway listening on http://{}", local_addr);
    match config.output_transport {
        OutputTransport::Sse => {
            info!("SSE endpoint (GET): http://{}{}", local_addr, config.sse_path);
            info!("Message endpoint (POST): http://{}{}", local_addr, config.message_path);
        }
        OutputTransport::Ws => {
            info!("WebSocket endpoint: ws://{}{}", local_addr, config.message_path);
        }
    }

    // Machine-readable bound port for test infrastructure
    eprintln!("STDIO_GATEWAY_BOUND_PORT={}", local_addr.port());

    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            result.map_err(|e| BridgeError::HttpServer(format!("Server error: {}", e)))?;
            // The server only returns on error; still report the process outcome
            bridge.shutdown();
            Ok(bridge.run_until_exit().await)
        }
        code = bridge.run_until_exit() => Ok(code),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received");
            bridge.shutdown();
            Ok(bridge.run_until_exit().await)
        }
    }
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn open_channel_session(bridge: &Arc<FanoutBridge>) -> Result<(SessionGuard, SinkReceiver)> {
    let (sink, receiver) = ChannelSink::new(SINK_QUEUE_CAPACITY);
    let session_id = bridge.open_session(Arc::new(sink))?;
    Ok((
        SessionGuard {
            bridge: bridge.clone(),
            session_id,
        },
        receiver,
    ))
}

fn shutting_down_response() -> Response {
    error_response_with_status(
        StatusCode::SERVICE_UNAVAILABLE,
        ErrorObject::INTERNAL_ERROR,
        "Bridge is shutting down",
    )
}

/// Open an SSE session.
async fn handle_sse_stream(State(state): State<Arc<ServerState>>) -> Response {
    let (guard, receiver) = match open_channel_session(&state.bridge) {
        Ok(session) => session,
        Err(e) => {
            warn!("Refusing SSE connection: {}", e);
            return shutting_down_response();
        }
    };
    let session_id = guard.session_id.clone();
    info!(session_id = %session_id, "SSE stream opened");

    let endpoint = format!("{}?sessionId={}", state.message_path, session_id);
    let announce = stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint))
    });

    // The guard rides along with the stream, so a disconnect deregisters
    let frames = stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
        let event = match receiver.recv().await? {
            OutboundFrame::Message(json) => Event::default().event("message").data(&*json),
            OutboundFrame::Heartbeat => Event::default().comment("ping"),
        };
        Some((Ok::<_, Infallible>(event), (receiver, guard)))
    });

    with_session_header(Sse::new(announce.chain(frames)).into_response(), &session_id)
}

async fn handle_message(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_message_post(&state.bridge, query, &headers, body).await
}

/// Upgrade to a WebSocket session.
async fn handle_ws_upgrade(State(state): State<Arc<ServerState>>, ws: WebSocketUpgrade) -> Response {
    if !state.bridge.lifecycle().is_accepting() {
        return shutting_down_response();
    }
    ws.on_upgrade(move |socket| run_ws_session(socket, state.bridge.clone()))
}

async fn run_ws_session(socket: WebSocket, bridge: Arc<FanoutBridge>) {
    let (guard, mut receiver) = match open_channel_session(&bridge) {
        Ok(session) => session,
        Err(e) => {
            warn!("Refusing WebSocket session: {}", e);
            return;
        }
    };
    let session_id = guard.session_id.clone();
    info!(session_id = %session_id, "WebSocket session opened");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = receiver.recv().await {
            let message = match frame {
                OutboundFrame::Message(json) => WsMessage::Text(json.to_string().into()),
                OutboundFrame::Heartbeat => WsMessage::Ping(vec![].into()),
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(WsMessage::Close(None)).await;
    });

    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text.as_str().to_string(),
            Ok(WsMessage::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(session_id = %session_id, "WebSocket receive error: {}", e);
                break;
            }
        };

        let message = match Message::decode(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %session_id, "Discarding undecodable WebSocket frame: {}", e.reason);
                continue;
            }
        };
        if let Err(e) = bridge.submit(&session_id, message).await {
            warn!(session_id = %session_id, "Failed to forward WebSocket message: {}", e);
            break;
        }
    }

    // Deregistering closes the sink, which lets the writer send Close and exit
    drop(guard);
    let _ = writer.await;
    info!(session_id = %session_id, "WebSocket session closed");
}
