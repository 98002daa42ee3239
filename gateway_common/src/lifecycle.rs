//! Bridge lifecycle state machine shared by the process supervisor, the
//! session registry and the HTTP server.
//!
//! The backing process is authoritative for the bridge: once it exits, the
//! lifecycle moves to [`BridgeState::Exited`] and every observer reacts
//! (registry stops accepting sessions, server stops serving, the binary exits
//! with the same code). Uses `tokio::sync::watch` so transitions are pushed to
//! observers without polling.
//!
//! # Example
//!
//! ```rust
//! use gateway_common::lifecycle::{BridgeLifecycle, BridgeState};
//!
//! # async fn example() {
//! let lifecycle = BridgeLifecycle::new();
//! lifecycle.mark_running();
//! assert!(lifecycle.is_accepting());
//!
//! lifecycle.mark_exited(0);
//! assert_eq!(lifecycle.wait_for_exit().await, 0);
//! assert_eq!(lifecycle.current(), BridgeState::Exited { code: 0 });
//! # }
//! ```

use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle states of one bridge instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Process spawned, I/O tasks not yet running
    Starting,

    /// Accepting sessions and forwarding traffic
    Running,

    /// Shutdown requested, no new sessions
    Stopping,

    /// Backing process (or upstream peer) is gone
    Exited { code: i32 },
}

impl BridgeState {
    /// Returns true once the bridge has exited
    pub fn is_terminal(&self) -> bool {
        matches!(self, BridgeState::Exited { .. })
    }

    /// Exit code if exited
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            BridgeState::Exited { code } => Some(*code),
            _ => None,
        }
    }
}

/// Observable lifecycle backed by a watch channel.
#[derive(Clone, Debug)]
pub struct BridgeLifecycle {
    sender: Arc<watch::Sender<BridgeState>>,
    // Keep a receiver so sends never fail for lack of subscribers
    _receiver: watch::Receiver<BridgeState>,
}

impl BridgeLifecycle {
    /// Create a lifecycle in the `Starting` state
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(BridgeState::Starting);
        Self {
            sender: Arc::new(sender),
            _receiver: receiver,
        }
    }

    /// Current state without blocking
    pub fn current(&self) -> BridgeState {
        *self.sender.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.sender.subscribe()
    }

    /// Starting -> Running. Returns true if the transition happened.
    pub fn mark_running(&self) -> bool {
        self.sender.send_if_modified(|state| {
            if matches!(state, BridgeState::Starting) {
                *state = BridgeState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Starting | Running -> Stopping. Returns true if the transition happened.
    pub fn mark_stopping(&self) -> bool {
        self.sender.send_if_modified(|state| {
            if matches!(state, BridgeState::Starting | BridgeState::Running) {
                *state = BridgeState::Stopping;
                true
            } else {
                false
            }
        })
    }

    /// Any non-terminal state -> Exited. The first recorded code wins.
    pub fn mark_exited(&self, code: i32) -> bool {
        self.sender.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = BridgeState::Exited { code };
                true
            }
        })
    }

    /// True only while Running
    pub fn is_accepting(&self) -> bool {
        matches!(self.current(), BridgeState::Running)
    }

    /// Resolves with the exit code once the bridge has exited.
    pub async fn wait_for_exit(&self) -> i32 {
        let mut rx = self.sender.subscribe();
        loop {
            if let Some(code) = rx.borrow_and_update().exit_code() {
                return code;
            }
            if rx.changed().await.is_err() {
                // Sender lives in self, so this only happens during teardown
                return 1;
            }
        }
    }
}

impl Default for BridgeLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
