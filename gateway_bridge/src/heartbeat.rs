//! Per-session heartbeat timers.
//!
//! Each registered session gets one task that pushes a heartbeat frame every
//! period. The task holds only a weak reference to the registry, and the
//! [`HeartbeatHandle`] stored in the session entry cancels it on drop, so the
//! timer never outlives its session.

use crate::registry::SessionRegistry;
use crate::sink::OutboundFrame;
use std::sync::Weak;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Owner of one heartbeat task. Cancels the task when dropped.
#[derive(Debug)]
pub struct HeartbeatHandle {
    token: CancellationToken,
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Start the heartbeat for `session_id`. The first beat fires one full period
/// after registration.
pub fn spawn(registry: Weak<SessionRegistry>, session_id: String, period: Duration) -> HeartbeatHandle {
    let token = CancellationToken::new();
    let cancelled = token.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(registry) = registry.upgrade() else {
                break;
            };
            // A failed beat deregisters the session, which cancels this task
            if let Err(e) = registry.send_to(&session_id, OutboundFrame::Heartbeat).await {
                debug!(session_id = %session_id, "Heartbeat stopped: {}", e);
                break;
            }
        }
        debug!(session_id = %session_id, "Heartbeat task finished");
    });

    HeartbeatHandle { token }
}
