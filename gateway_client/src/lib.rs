//! # Gateway Client
//!
//! Exposes a remote JSON-RPC server (SSE or WebSocket) as a local stdio peer.
//!
//! ## Key Features
//!
//! - **Transports**: [`sse`] (event stream plus POST endpoint) and [`ws`],
//!   both behind [`transport::RemoteTransport`].
//! - **Correlation**: [`relay`] matches responses to requests by id, enforces a
//!   per-request timeout and rejects duplicate outstanding ids.
//! - **Bootstrap**: the relay performs the `initialize` exchange itself and
//!   answers the local peer's `initialize` from the stored result.
//!
//! ## Usage
//!
//! ```no_run
//! use gateway_client::relay::{RelayConfig, run_stdio_relay};
//! use gateway_client::transport::{RemoteConfig, RemoteKind};
//! use url::Url;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("http://127.0.0.1:8000/sse")?;
//! let config = RelayConfig::new(RemoteConfig::new(url, RemoteKind::Sse));
//! run_stdio_relay(config).await?;
//! # Ok(())
//! # }
//! ```

/// Error types for upstream connections and relaying.
pub mod error;
/// Request/response correlation between the local peer and the remote.
pub mod relay;
/// SSE upstream transport.
pub mod sse;
/// Transport trait, connection setup and the in-memory transport.
pub mod transport;
/// WebSocket upstream transport.
pub mod ws;

pub use error::{ClientError, Result};
pub use relay::{CorrelatedRelay, RelayConfig, run_relay, run_stdio_relay};
pub use transport::{RemoteConfig, RemoteConnection, RemoteKind, RemoteTransport, connect_remote};
