//! Upstream transports for the correlated relay.
//!
//! A connection is split into a [`RemoteTransport`] used to send messages and
//! an inbound channel carrying every decoded message the remote produces. The
//! channel closing means the upstream connection is gone.

use crate::error::{ClientError, Result};
use crate::{sse, ws};
use async_trait::async_trait;
use gateway_common::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Default time allowed to establish the upstream connection.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default limit for delivering one outbound message.
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 30;

/// Queue depth for messages arriving from the remote.
pub(crate) const INBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    /// SSE stream for inbound messages, POST for outbound
    Sse,
    /// One full-duplex WebSocket
    Ws,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: Url,
    pub kind: RemoteKind,
    /// Extra `(name, value)` headers sent on every upstream request
    pub headers: Vec<(String, String)>,
    pub connect_timeout: Duration,
    /// Upper bound for one outbound POST in SSE mode
    pub send_timeout: Duration,
}

impl RemoteConfig {
    pub fn new(url: Url, kind: RemoteKind) -> Self {
        Self {
            url,
            kind,
            headers: vec![],
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            send_timeout: Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECS),
        }
    }
}

/// Sending half of an upstream connection.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn send(&self, message: &Message) -> Result<()>;
}

/// An established upstream connection.
pub struct RemoteConnection {
    pub transport: Arc<dyn RemoteTransport>,
    pub inbound: mpsc::Receiver<Message>,
}

/// Connect to the remote described by `config`.
pub async fn connect_remote(config: &RemoteConfig) -> Result<RemoteConnection> {
    match config.kind {
        RemoteKind::Sse => sse::connect(config).await,
        RemoteKind::Ws => ws::connect(config).await,
    }
}

/// In-process transport. Whatever the relay sends shows up on
/// [`MemoryPeer::from_relay`]; whatever is pushed into [`MemoryPeer::to_relay`]
/// reaches the relay as if the remote had sent it.
pub struct MemoryTransport {
    outbound: mpsc::Sender<Message>,
}

/// The remote end of a [`MemoryTransport`].
pub struct MemoryPeer {
    pub from_relay: mpsc::Receiver<Message>,
    pub to_relay: mpsc::Sender<Message>,
}

#[async_trait]
impl RemoteTransport for MemoryTransport {
    async fn send(&self, message: &Message) -> Result<()> {
        self.outbound
            .send(message.clone())
            .await
            .map_err(|_| ClientError::UpstreamClosed)
    }
}

/// A connected in-memory pair.
pub fn memory_connection(capacity: usize) -> (RemoteConnection, MemoryPeer) {
    let (outbound, from_relay) = mpsc::channel(capacity);
    let (to_relay, inbound) = mpsc::channel(capacity);
    (
        RemoteConnection {
            transport: Arc::new(MemoryTransport { outbound }),
            inbound,
        },
        MemoryPeer {
            from_relay,
            to_relay,
        },
    )
}
