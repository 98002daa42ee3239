//! Correlated relay: a local stdio peer talking to a remote network server.
//!
//! Requests read from the local peer are recorded in a pending table keyed by
//! their id and forwarded upstream unmodified. A response from the remote
//! resolves the matching entry and is written back to the local peer. If no
//! response arrives within the request timeout, the local peer receives a
//! synthetic error instead and a late response is dropped. Exactly one of the
//! two outcomes ever reaches the local peer: whoever removes the pending
//! entry first owns the reply.
//!
//! Everything the remote sends reaches the local peer in the order it
//! arrived. Responses are written from the inbound loop itself; the
//! per-request task only enforces the deadline.
//!
//! Notifications, responses to remote-initiated requests and everything the
//! remote sends that is not a correlated response pass through unchanged.

use crate::error::{ClientError, Result};
use crate::transport::{RemoteConfig, RemoteConnection, RemoteTransport, connect_remote};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use gateway_common::{
    ErrorObject, FrameDecoder, FrameError, Message, Request, RequestId, Response, ResponsePayload,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Id used for the relay's own `initialize` exchange.
pub const BOOTSTRAP_REQUEST_ID: &str = "stdio-gateway-initialize";

/// Protocol version offered during bootstrap.
pub const BOOTSTRAP_PROTOCOL_VERSION: &str = "2024-11-05";

const LOCAL_QUEUE_CAPACITY: usize = 256;

/// How long to wait for queued local output at shutdown.
const LOCAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Get the request timeout in seconds from STDIO_GATEWAY_REQUEST_TIMEOUT_SECS env var.
/// Defaults to 30 seconds if not set or invalid.
pub fn request_timeout_secs() -> u64 {
    std::env::var("STDIO_GATEWAY_REQUEST_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS)
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub remote: RemoteConfig,
    pub request_timeout: Duration,
    /// Run the `initialize` exchange before relaying and answer the local
    /// peer's `initialize` from its result
    pub bootstrap: bool,
}

impl RelayConfig {
    pub fn new(remote: RemoteConfig) -> Self {
        Self {
            remote,
            request_timeout: Duration::from_secs(request_timeout_secs()),
            bootstrap: true,
        }
    }
}

/// One request awaiting its response.
struct PendingRequest {
    /// Distinguishes reuses of the same id over time
    token: u64,
    deadline: Instant,
    /// Stops the deadline timer once the entry leaves the table
    _timer: DropGuard,
}

/// Request/response correlation between the local peer and the remote.
pub struct CorrelatedRelay {
    remote: Arc<dyn RemoteTransport>,
    pending: Arc<DashMap<RequestId, PendingRequest>>,
    next_token: AtomicU64,
    local_tx: mpsc::Sender<Message>,
    request_timeout: Duration,
    /// Result of the bootstrap `initialize`, when bootstrap ran
    initialize_result: Option<Value>,
}

impl CorrelatedRelay {
    fn new(
        remote: Arc<dyn RemoteTransport>,
        local_tx: mpsc::Sender<Message>,
        request_timeout: Duration,
        initialize_result: Option<Value>,
    ) -> Self {
        Self {
            remote,
            pending: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(0),
            local_tx,
            request_timeout,
            initialize_result,
        }
    }

    /// Number of requests awaiting a response.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Time left before the request with `id` times out.
    pub fn time_remaining(&self, id: &RequestId) -> Option<Duration> {
        self.pending
            .get(id)
            .map(|p| p.deadline.saturating_duration_since(Instant::now()))
    }

    /// Route one message read from the local peer.
    pub async fn handle_local(&self, message: Message) {
        match message {
            Message::Request(request) => self.forward_request(request).await,
            Message::Notification(notification)
                if self.initialize_result.is_some()
                    && notification.method == "notifications/initialized" =>
            {
                debug!("Remote already initialized, not forwarding notifications/initialized");
            }
            other => {
                if let Err(e) = self.remote.send(&other).await {
                    warn!(kind = other.kind(), "Failed to forward upstream: {}", e);
                }
            }
        }
    }

    async fn forward_request(&self, request: Request) {
        if request.method == "initialize"
            && let Some(result) = &self.initialize_result
        {
            debug!(id = %request.id, "Answering initialize from bootstrap result");
            self.deliver_local(Response::success(request.id, result.clone()).into())
                .await;
            return;
        }

        let id = request.id.clone();
        let timer = CancellationToken::new();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let inserted = match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(PendingRequest {
                    token,
                    deadline: Instant::now() + self.request_timeout,
                    _timer: timer.clone().drop_guard(),
                });
                true
            }
        };
        if !inserted {
            warn!(id = %id, "Rejecting request: id is already outstanding");
            let error = ErrorObject::new(
                ErrorObject::INVALID_REQUEST,
                format!("Duplicate request id {}: a request with this id is still outstanding", id),
            );
            self.deliver_local(Response::failure(Some(id), error).into()).await;
            return;
        }

        tokio::spawn(expire_request(
            self.pending.clone(),
            self.local_tx.clone(),
            id.clone(),
            token,
            timer,
            self.request_timeout,
        ));

        debug!(id = %id, method = %request.method, "Forwarding request upstream");
        if let Err(e) = self.remote.send(&Message::Request(request)).await {
            warn!(id = %id, "Failed to forward request upstream: {}", e);
            self.resolve(
                &id,
                Response::failure(
                    Some(id.clone()),
                    ErrorObject::internal(format!("Failed to forward request upstream: {}", e)),
                ),
            )
            .await;
        }
    }

    /// Route one message received from the remote.
    pub async fn handle_remote(&self, message: Message) {
        match message {
            Message::Response(response) => match response.id.clone() {
                Some(id) => {
                    if !self.resolve(&id, response).await {
                        warn!(id = %id, "Dropping response with no outstanding request");
                    }
                }
                // An error without an id cannot be correlated; the local peer decides
                None => self.deliver_local(Message::Response(response)).await,
            },
            other => self.deliver_local(other).await,
        }
    }

    /// Complete the request for `id` with `response`. False if nothing was pending.
    async fn resolve(&self, id: &RequestId, response: Response) -> bool {
        if self.pending.remove(id).is_none() {
            return false;
        }
        self.deliver_local(Message::Response(response.with_id(id.clone())))
            .await;
        true
    }

    /// Answer every outstanding request with an internal error.
    pub async fn fail_outstanding(&self, reason: &str) -> usize {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            let response = Response::failure(Some(id.clone()), ErrorObject::internal(reason));
            if self.resolve(&id, response).await {
                failed += 1;
            }
        }
        failed
    }

    async fn deliver_local(&self, message: Message) {
        if self.local_tx.send(message).await.is_err() {
            debug!("Local output closed, dropping message");
        }
    }
}

/// Answer one request with a timeout error unless it completes first.
async fn expire_request(
    pending: Arc<DashMap<RequestId, PendingRequest>>,
    local_tx: mpsc::Sender<Message>,
    id: RequestId,
    token: u64,
    completed: CancellationToken,
    timeout: Duration,
) {
    tokio::select! {
        _ = completed.cancelled() => return,
        _ = tokio::time::sleep(timeout) => {}
    }
    // A response may have removed the entry while the timer was firing
    if pending.remove_if(&id, |_, p| p.token == token).is_none() {
        return;
    }
    warn!(id = %id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
    let response = Response::failure(Some(id), ErrorObject::request_timed_out(timeout));
    if local_tx.send(Message::Response(response)).await.is_err() {
        debug!("Local output closed, dropping response");
    }
}

/// Run the relay's own `initialize` exchange on a fresh connection.
///
/// Returns the remote's initialize result plus any other messages that
/// arrived first, in order.
pub async fn bootstrap(
    remote: &dyn RemoteTransport,
    inbound: &mut mpsc::Receiver<Message>,
    timeout: Duration,
) -> Result<(Value, Vec<Message>)> {
    let id = RequestId::from(BOOTSTRAP_REQUEST_ID);
    let request = Message::request(
        id.clone(),
        "initialize",
        Some(json!({
            "protocolVersion": BOOTSTRAP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "stdio_gateway",
                "version": env!("CARGO_PKG_VERSION"),
            }
        })),
    );
    remote.send(&request).await?;

    let mut early = Vec::new();
    let exchange = async {
        loop {
            match inbound.recv().await {
                None => return Err(ClientError::UpstreamClosed),
                Some(Message::Response(response)) if response.id.as_ref() == Some(&id) => {
                    return match response.payload {
                        ResponsePayload::Result(result) => Ok(result),
                        ResponsePayload::Error(error) => Err(ClientError::Handshake(format!(
                            "remote rejected initialize: {} ({})",
                            error.message, error.code
                        ))),
                    };
                }
                Some(other) => early.push(other),
            }
        }
    };
    let result = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ClientError::Handshake("timed out waiting for initialize response".to_string()))??;

    remote
        .send(&Message::notification("notifications/initialized", None))
        .await?;
    info!(buffered = early.len(), "Remote session initialized");
    Ok((result, early))
}

/// Relay between a local peer (`local_in`/`local_out`) and an established
/// remote connection until either side ends.
///
/// Local EOF is a clean stop. The upstream closing is an error.
pub async fn run_relay<R, W>(
    config: &RelayConfig,
    connection: RemoteConnection,
    local_in: R,
    local_out: W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let RemoteConnection {
        transport,
        mut inbound,
    } = connection;

    let (initialize_result, early) = if config.bootstrap {
        let (result, early) = bootstrap(transport.as_ref(), &mut inbound, config.request_timeout).await?;
        (Some(result), early)
    } else {
        (None, Vec::new())
    };

    let (local_tx, local_rx) = mpsc::channel(LOCAL_QUEUE_CAPACITY);
    let writer = tokio::spawn(write_local(local_rx, local_out));
    let relay = CorrelatedRelay::new(transport, local_tx, config.request_timeout, initialize_result);

    for message in early {
        relay.handle_remote(message).await;
    }

    let mut frames = FramedRead::new(local_in, FrameDecoder::new());
    let outcome = loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(frame)) => match Message::decode(&frame) {
                    Ok(message) => relay.handle_local(message).await,
                    Err(e) => warn!(frame = %e.frame, "Discarding undecodable local input: {}", e.reason),
                },
                Some(Err(FrameError::Io(e))) => {
                    error!("Failed to read local input: {}", e);
                    break Err(ClientError::Io(e));
                }
                None => {
                    info!("Local input closed");
                    break Ok(());
                }
            },
            message = inbound.recv() => match message {
                Some(message) => relay.handle_remote(message).await,
                None => {
                    error!("Upstream connection closed");
                    break Err(ClientError::UpstreamClosed);
                }
            },
        }
    };

    let failed = relay
        .fail_outstanding("Relay shutting down before a response arrived")
        .await;
    if failed > 0 {
        info!(failed, "Answered outstanding requests at shutdown");
    }
    drop(relay);
    if tokio::time::timeout(LOCAL_FLUSH_TIMEOUT, writer).await.is_err() {
        warn!("Local output not flushed before shutdown");
    }
    outcome
}

/// Connect to the configured remote and relay it over this process's stdio.
pub async fn run_stdio_relay(config: RelayConfig) -> Result<()> {
    let connection = connect_remote(&config.remote).await?;
    run_relay(&config, connection, tokio::io::stdin(), tokio::io::stdout()).await
}

async fn write_local<W>(mut rx: mpsc::Receiver<Message>, mut out: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = message.encode();
        line.push('\n');
        if let Err(e) = out.write_all(line.as_bytes()).await {
            error!("Failed to write to local output: {}", e);
            break;
        }
        if let Err(e) = out.flush().await {
            error!("Failed to flush local output: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_connection;

    fn relay_with_memory() -> (CorrelatedRelay, crate::transport::MemoryPeer, mpsc::Receiver<Message>) {
        let (connection, peer) = memory_connection(16);
        let (local_tx, local_rx) = mpsc::channel(16);
        let relay = CorrelatedRelay::new(
            connection.transport,
            local_tx,
            Duration::from_secs(30),
            None,
        );
        (relay, peer, local_rx)
    }

    #[tokio::test]
    async fn test_duplicate_outstanding_id_is_rejected() {
        let (relay, mut peer, mut local) = relay_with_memory();

        relay.handle_local(Message::request(1, "a", None)).await;
        relay.handle_local(Message::request(1, "b", None)).await;

        // Only the first is forwarded
        let forwarded = peer.from_relay.recv().await.unwrap();
        assert_eq!(forwarded.method(), Some("a"));
        assert!(peer.from_relay.try_recv().is_err());

        let Some(Message::Response(rejection)) = local.recv().await else {
            panic!("expected a rejection");
        };
        assert_eq!(rejection.id, Some(RequestId::from(1)));
        assert_eq!(
            rejection.error().map(|e| e.code),
            Some(ErrorObject::INVALID_REQUEST)
        );
        assert_eq!(relay.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_response_is_dropped() {
        let (relay, _peer, mut local) = relay_with_memory();
        relay
            .handle_remote(Response::success(RequestId::from(99), json!(null)).into())
            .await;
        assert!(local.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_notifications_pass_through() {
        let (relay, _peer, mut local) = relay_with_memory();
        let notification = Message::notification("notifications/progress", Some(json!({"p": 1})));
        relay.handle_remote(notification.clone()).await;
        assert_eq!(local.recv().await, Some(notification));
    }

    #[tokio::test]
    async fn test_fail_outstanding_answers_every_request() {
        let (relay, _peer, mut local) = relay_with_memory();
        relay.handle_local(Message::request("x", "slow", None)).await;
        relay.handle_local(Message::request("y", "slow", None)).await;
        assert!(relay.time_remaining(&RequestId::from("x")).is_some());

        assert_eq!(relay.fail_outstanding("stopping").await, 2);
        assert_eq!(relay.outstanding(), 0);

        let mut ids = Vec::new();
        for _ in 0..2 {
            let Some(Message::Response(response)) = local.recv().await else {
                panic!("expected a response");
            };
            assert_eq!(response.error().map(|e| e.code), Some(ErrorObject::INTERNAL_ERROR));
            ids.push(response.id.unwrap().to_string());
        }
        ids.sort();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response_is_dropped() {
        let (connection, mut peer) = memory_connection(16);
        let (local_tx, mut local) = mpsc::channel(16);
        let relay = CorrelatedRelay::new(
            connection.transport,
            local_tx,
            Duration::from_millis(100),
            None,
        );

        relay.handle_local(Message::request(5, "slow", None)).await;
        assert!(peer.from_relay.recv().await.is_some());

        let Some(Message::Response(timed_out)) = local.recv().await else {
            panic!("expected a timeout error");
        };
        assert_eq!(timed_out.id, Some(RequestId::from(5)));
        assert_eq!(
            timed_out.error().map(|e| e.code),
            Some(ErrorObject::REQUEST_TIMEOUT)
        );

        relay
            .handle_remote(Response::success(RequestId::from(5), json!("late")).into())
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(local.try_recv().is_err(), "late response must be dropped");
    }

    #[tokio::test]
    async fn test_response_and_notification_keep_remote_order() {
        let (relay, mut peer, mut local) = relay_with_memory();
        relay.handle_local(Message::request(1, "work", None)).await;
        assert!(peer.from_relay.recv().await.is_some());

        relay
            .handle_remote(Response::success(RequestId::from(1), json!("done")).into())
            .await;
        relay
            .handle_remote(Message::notification("notifications/tools/list_changed", None))
            .await;

        let Some(Message::Response(first)) = local.recv().await else {
            panic!("expected the response first");
        };
        assert_eq!(first.id, Some(RequestId::from(1)));
        let second = local.recv().await.expect("expected the notification");
        assert_eq!(second.method(), Some("notifications/tools/list_changed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_request_does_not_time_out() {
        let (connection, _peer) = memory_connection(16);
        let (local_tx, mut local) = mpsc::channel(16);
        let relay = CorrelatedRelay::new(
            connection.transport,
            local_tx,
            Duration::from_millis(100),
            None,
        );

        relay.handle_local(Message::request(3, "quick", None)).await;
        relay
            .handle_remote(Response::success(RequestId::from(3), json!(1)).into())
            .await;
        assert!(local.recv().await.is_some());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(local.try_recv().is_err(), "no timeout after a response");
        assert_eq!(relay.outstanding(), 0);
    }

    #[test]
    fn test_request_timeout_default() {
        // Only meaningful when the variable is not set in the test environment
        if std::env::var("STDIO_GATEWAY_REQUEST_TIMEOUT_SECS").is_err() {
            assert_eq!(request_timeout_secs(), DEFAULT_REQUEST_TIMEOUT_SECS);
        }
    }
}
