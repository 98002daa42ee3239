//! # Stdio Gateway Bridge
//!
//! Exposes one stdio JSON-RPC process to many network clients.
//!
//! ## Architecture
//!
//! *   **Process Supervisor** ([`supervisor`]): spawns the single backing process and
//!     ties the bridge lifetime to it.
//! *   **Fan-out Bridge** ([`fanout`]): decodes every line the process prints and
//!     broadcasts it to all sessions; queues session messages onto its stdin.
//! *   **Session Registry** ([`registry`]): the table of live sessions, with a
//!     per-sink write deadline so one slow client never stalls the rest.
//! *   **Heartbeat Scheduler** ([`heartbeat`]): periodic keep-alive per session.
//! *   **HTTP surface** ([`server`]): SSE or WebSocket transport, health
//!     endpoints, CORS and extra response headers.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gateway_bridge::{BridgeConfig, start_bridge};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig {
//!         bind_addr: "127.0.0.1:8000".parse()?,
//!         server_command: "my-mcp-server".to_string(),
//!         ..BridgeConfig::default()
//!     };
//!
//!     // Resolves with the process exit code
//!     let code = start_bridge(config).await?;
//!     std::process::exit(code);
//! }
//! ```

pub mod config;
pub mod echo;
pub mod error;
pub mod fanout;
pub mod heartbeat;
pub mod logging;
pub mod registry;
pub mod request_handler;
pub mod server;
pub mod sink;
pub mod supervisor;

pub use config::{BridgeConfig, CorsPolicy, OutputTransport};
pub use error::{BridgeError, Result};
pub use fanout::FanoutBridge;
pub use registry::{BroadcastReport, SessionRegistry};
pub use server::{build_router, serve_bridge, start_bridge};
pub use sink::{ChannelSink, DownstreamSink, OutboundFrame, SinkReceiver};
