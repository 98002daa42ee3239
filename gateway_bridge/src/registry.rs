//! Session registry for the fan-out bridge.
//!
//! Every connected downstream client owns one entry: its sink, creation time
//! and heartbeat task. Broadcasts iterate a snapshot of the table, so sessions
//! can join or leave while a broadcast is in flight, and a slow or broken sink
//! only ever tears down its own session.

use crate::error::{BridgeError, Result};
use crate::heartbeat::{self, HeartbeatHandle};
use crate::sink::{DownstreamSink, OutboundFrame};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use gateway_common::{BridgeLifecycle, Message};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Deadline for a single sink write
    pub write_timeout: Duration,
    /// Heartbeat period; `None` disables heartbeats
    pub heartbeat_interval: Option<Duration>,
}

struct SessionEntry {
    sink: Arc<dyn DownstreamSink>,
    created_at: DateTime<Utc>,
    /// Dropping the handle stops the timer; it lives exactly as long as the entry
    _heartbeat: Option<HeartbeatHandle>,
}

/// Point-in-time view of one registered session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub alive: bool,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Sessions torn down because their sink failed or timed out
    pub dropped: Vec<String>,
}

pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    lifecycle: BridgeLifecycle,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(lifecycle: BridgeLifecycle, config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            lifecycle,
            config,
        })
    }

    /// Register a sink under a fresh session id and start its heartbeat.
    ///
    /// Fails with [`BridgeError::ShuttingDown`] once the bridge has left the
    /// running state.
    pub fn register(self: &Arc<Self>, sink: Arc<dyn DownstreamSink>) -> Result<String> {
        if !self.lifecycle.is_accepting() {
            return Err(BridgeError::ShuttingDown);
        }

        let mut session_id = Uuid::new_v4().to_string();
        while self.sessions.contains_key(&session_id) {
            session_id = Uuid::new_v4().to_string();
        }

        let heartbeat = self.config.heartbeat_interval.map(|period| {
            heartbeat::spawn(Arc::downgrade(self), session_id.clone(), period)
        });

        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                sink,
                created_at: Utc::now(),
                _heartbeat: heartbeat,
            },
        );

        // Shutdown may have drained the table between the check and the insert
        if !self.lifecycle.is_accepting() {
            self.deregister(&session_id);
            return Err(BridgeError::ShuttingDown);
        }

        info!(session_id = %session_id, sessions = self.sessions.len(), "Session registered");
        Ok(session_id)
    }

    /// Remove a session, stop its heartbeat and close its sink.
    ///
    /// Returns `false` if the session was already gone, which makes repeated
    /// calls harmless.
    pub fn deregister(&self, session_id: &str) -> bool {
        let Some((_, entry)) = self.sessions.remove(session_id) else {
            return false;
        };
        entry.sink.close();
        info!(session_id = %session_id, sessions = self.sessions.len(), "Session deregistered");
        true
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn sink(&self, session_id: &str) -> Option<Arc<dyn DownstreamSink>> {
        self.sessions.get(session_id).map(|e| e.sink.clone())
    }

    pub fn info(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.get(session_id).map(|e| SessionInfo {
            id: session_id.to_string(),
            created_at: e.created_at,
            alive: e.sink.is_alive(),
        })
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Get session count (for metrics/debugging)
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Deliver one message to every session registered when the call starts.
    ///
    /// The message is encoded once and the same buffer is shared by all sinks.
    /// Writes run concurrently, each under the write deadline; failed sessions
    /// are deregistered and reported.
    pub async fn broadcast(&self, message: &Message) -> BroadcastReport {
        let frame = OutboundFrame::Message(Arc::from(message.encode()));
        let targets: Vec<(String, Arc<dyn DownstreamSink>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.sink.clone()))
            .collect();

        let results = join_all(targets.into_iter().map(|(session_id, sink)| {
            let frame = frame.clone();
            async move {
                let outcome = self.deliver(sink.as_ref(), frame).await;
                (session_id, outcome)
            }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (session_id, outcome) in results {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(session_id = %session_id, "Dropping session after failed delivery: {}", e);
                    self.deregister(&session_id);
                    report.dropped.push(session_id);
                }
            }
        }
        debug!(
            kind = message.kind(),
            delivered = report.delivered,
            dropped = report.dropped.len(),
            "Broadcast complete"
        );
        report
    }

    /// Deliver one frame to a single session, tearing it down on failure.
    pub async fn send_to(&self, session_id: &str, frame: OutboundFrame) -> Result<()> {
        let sink = self
            .sink(session_id)
            .ok_or_else(|| BridgeError::UnknownSession(session_id.to_string()))?;
        let outcome = self.deliver(sink.as_ref(), frame).await;
        if let Err(e) = &outcome {
            warn!(session_id = %session_id, "Dropping session after failed delivery: {}", e);
            self.deregister(session_id);
        }
        outcome
    }

    async fn deliver(&self, sink: &dyn DownstreamSink, frame: OutboundFrame) -> Result<()> {
        let deadline = self.config.write_timeout;
        match tokio::time::timeout(deadline, sink.push(frame)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::SinkTimeout(deadline)),
        }
    }

    /// Deregister every session. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let ids = self.session_ids();
        ids.iter().filter(|id| self.deregister(id)).count()
    }
}
