//! Downstream sinks: the per-session write half of a network connection.
//!
//! The registry and heartbeat scheduler only see [`DownstreamSink`]; each
//! transport (SSE stream, WebSocket) drains the matching [`SinkReceiver`] and
//! renders frames in its own wire format.

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use futures::Stream;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Frames queued for one downstream client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// An encoded JSON-RPC message, shared by every recipient of one broadcast
    Message(Arc<str>),
    /// Keep-alive; rendered as an SSE comment or a WebSocket ping
    Heartbeat,
}

#[async_trait]
pub trait DownstreamSink: Send + Sync {
    /// Queue a frame for delivery. Fails once the sink is closed or its
    /// connection is gone.
    async fn push(&self, frame: OutboundFrame) -> Result<()>;

    /// Ask the transport to finish the connection after draining queued frames.
    fn close(&self);

    fn is_alive(&self) -> bool;
}

/// Sink backed by a bounded channel.
///
/// A full queue makes `push` wait, which is what the registry's write deadline
/// measures: a client that stops reading eventually times out and is dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<OutboundFrame>,
    closed: CancellationToken,
}

/// Receiving half of a [`ChannelSink`], owned by the transport task.
#[derive(Debug)]
pub struct SinkReceiver {
    rx: mpsc::Receiver<OutboundFrame>,
    closed: CancellationToken,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, SinkReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        (
            Self {
                tx,
                closed: closed.clone(),
            },
            SinkReceiver { rx, closed },
        )
    }
}

#[async_trait]
impl DownstreamSink for ChannelSink {
    async fn push(&self, frame: OutboundFrame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::SinkClosed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| BridgeError::SinkClosed)
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_alive(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }
}

impl SinkReceiver {
    /// Next frame, or `None` once the sink is closed and its queue drained.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }

    /// Next queued frame without waiting.
    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> impl Stream<Item = OutboundFrame> + Send + 'static {
        futures::stream::unfold(self, |mut receiver| async move {
            let frame = receiver.recv().await?;
            Some((frame, receiver))
        })
    }
}
