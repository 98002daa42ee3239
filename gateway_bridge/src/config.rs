//! Settings consumed by the fan-out bridge and its HTTP server.

use crate::error::{BridgeError, Result};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use std::{net::SocketAddr, time::Duration};

/// Default interval between heartbeats on each open session.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 25;

/// Default deadline for one write to a downstream sink.
pub const DEFAULT_SINK_WRITE_TIMEOUT_MS: u64 = 2_000;

/// Default path of the SSE stream endpoint.
pub const DEFAULT_SSE_PATH: &str = "/sse";

/// Default path for inbound messages (SSE POST) and WebSocket upgrades.
pub const DEFAULT_MESSAGE_PATH: &str = "/message";

/// How downstream clients connect to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputTransport {
    /// Server-sent events stream plus POST endpoint
    #[default]
    Sse,
    /// Full-duplex WebSocket per session
    Ws,
}

/// Cross-origin policy for the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CorsPolicy {
    /// No CORS headers are emitted
    #[default]
    Disabled,
    /// Any origin is allowed
    AnyOrigin,
    /// Only the listed origins are allowed
    Origins(Vec<String>),
}

/// Configuration for the stdio-to-network bridge.
///
/// # Example
///
/// ```rust
/// use gateway_bridge::{BridgeConfig, OutputTransport};
///
/// let config = BridgeConfig {
///     bind_addr: "0.0.0.0:8080".parse().unwrap(),
///     server_command: "my-mcp-server".into(),
///     server_args: vec!["--verbose".into()],
///     output_transport: OutputTransport::Ws,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address to bind the HTTP server to. Port 0 picks a free port.
    pub bind_addr: SocketAddr,

    /// Command of the stdio process to wrap. Spawned once per bridge.
    pub server_command: String,

    /// Arguments passed to `server_command`.
    pub server_args: Vec<String>,

    pub output_transport: OutputTransport,

    /// Path of the SSE stream (SSE transport only).
    pub sse_path: String,

    /// Path for inbound POSTs (SSE) or the WebSocket upgrade (WS).
    pub message_path: String,

    /// Paths answering `200 ok` without touching session or process state.
    pub health_endpoints: Vec<String>,

    /// Extra `(name, value)` headers attached to every HTTP response.
    pub headers: Vec<(String, String)>,

    pub cors: CorsPolicy,

    /// Heartbeat period per session. `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,

    /// Per-sink write deadline; on expiry the session is torn down.
    pub sink_write_timeout: Duration,

    /// Echo stdio traffic to stderr in color (debugging aid).
    pub enable_colored_output: bool,

    /// Lines longer than this from the child are discarded.
    pub max_frame_length: Option<usize>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            server_command: String::new(),
            server_args: vec![],
            output_transport: OutputTransport::default(),
            sse_path: DEFAULT_SSE_PATH.to_string(),
            message_path: DEFAULT_MESSAGE_PATH.to_string(),
            health_endpoints: vec![],
            headers: vec![],
            cors: CorsPolicy::default(),
            heartbeat_interval: Some(Duration::from_secs(DEFAULT_HEARTBEAT_SECS)),
            sink_write_timeout: Duration::from_millis(DEFAULT_SINK_WRITE_TIMEOUT_MS),
            enable_colored_output: false,
            max_frame_length: None,
        }
    }
}

impl BridgeConfig {
    /// Reject configurations the server cannot route.
    pub fn validate(&self) -> Result<()> {
        if self.server_command.trim().is_empty() {
            return Err(BridgeError::Config("server command is empty".to_string()));
        }
        for path in [&self.sse_path, &self.message_path]
            .into_iter()
            .chain(self.health_endpoints.iter())
        {
            if !path.starts_with('/') {
                return Err(BridgeError::Config(format!(
                    "path {:?} must start with '/'",
                    path
                )));
            }
        }
        if self.output_transport == OutputTransport::Sse && self.sse_path == self.message_path {
            return Err(BridgeError::Config(
                "SSE path and message path must differ".to_string(),
            ));
        }
        let mut routes = std::collections::HashSet::new();
        let transport_paths = match self.output_transport {
            OutputTransport::Sse => vec![&self.sse_path, &self.message_path],
            OutputTransport::Ws => vec![&self.message_path],
        };
        for path in transport_paths.into_iter().chain(self.health_endpoints.iter()) {
            if !routes.insert(path.as_str()) {
                return Err(BridgeError::Config(format!("path {:?} is routed twice", path)));
            }
        }
        if self.sink_write_timeout.is_zero() {
            return Err(BridgeError::Config(
                "sink write timeout must be non-zero".to_string(),
            ));
        }
        self.header_map().map(|_| ())
    }

    /// Extra headers as a typed map.
    pub fn header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| BridgeError::Config(format!("invalid header name {:?}: {}", name, e)))?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                BridgeError::Config(format!("invalid value for header {}: {}", name, e))
            })?;
            map.append(name, value);
        }
        Ok(map)
    }
}
