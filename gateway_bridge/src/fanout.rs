//! Fan-out bridge: one stdio process shared by many network sessions.
//!
//! Every frame the process prints is decoded and broadcast to all sessions
//! registered at that moment. Messages from any session are queued onto the
//! process's stdin in arrival order, unmodified: there is no correlation in
//! this direction, so concurrent clients must use non-colliding request ids.

use crate::config::BridgeConfig;
use crate::echo::{self, Direction};
use crate::error::{BridgeError, Result};
use crate::registry::{RegistryConfig, SessionRegistry};
use crate::sink::DownstreamSink;
use crate::supervisor::{ProcessConfig, ProcessSupervisor};
use futures::StreamExt;
use gateway_common::{BridgeLifecycle, FrameDecoder, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::ChildStdout;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

/// Queue depth between sessions and the process's stdin.
const UPSTREAM_QUEUE_CAPACITY: usize = 256;

/// How long to keep broadcasting buffered output after the process exits.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct FanoutBridge {
    registry: Arc<SessionRegistry>,
    lifecycle: BridgeLifecycle,
    supervisor: ProcessSupervisor,
    upstream_tx: mpsc::Sender<Message>,
    reader: Mutex<Option<JoinHandle<()>>>,
    stopped: watch::Sender<Option<i32>>,
}

impl FanoutBridge {
    /// Spawn the backing process and start forwarding in both directions.
    pub fn start(config: &BridgeConfig) -> Result<Arc<Self>> {
        let lifecycle = BridgeLifecycle::new();
        let process = ProcessConfig {
            command: config.server_command.clone(),
            args: config.server_args.clone(),
            colored_output: config.enable_colored_output,
        };
        let (supervisor, streams) = ProcessSupervisor::spawn(&process, lifecycle.clone())?;
        let label = supervisor
            .pid()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "process".to_string());

        let registry = SessionRegistry::new(
            lifecycle.clone(),
            RegistryConfig {
                write_timeout: config.sink_write_timeout,
                heartbeat_interval: config.heartbeat_interval,
            },
        );

        let decoder = match config.max_frame_length {
            Some(max) => FrameDecoder::with_max_length(max),
            None => FrameDecoder::new(),
        };

        let (upstream_tx, upstream_rx) = mpsc::channel(UPSTREAM_QUEUE_CAPACITY);
        let echo_label = config.enable_colored_output.then(|| label.clone());
        tokio::spawn(write_upstream(upstream_rx, streams.stdin, echo_label.clone()));
        let reader = tokio::spawn(read_upstream(streams.stdout, decoder, registry.clone(), echo_label));

        let (stopped, _) = watch::channel(None);
        let bridge = Arc::new(Self {
            registry,
            lifecycle: lifecycle.clone(),
            supervisor,
            upstream_tx,
            reader: Mutex::new(Some(reader)),
            stopped,
        });

        tokio::spawn(Self::teardown_on_exit(bridge.clone()));

        lifecycle.mark_running();
        info!(process = %label, "Fan-out bridge running");
        Ok(bridge)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &BridgeLifecycle {
        &self.lifecycle
    }

    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    /// Register a downstream connection. Returns its session id.
    pub fn open_session(&self, sink: Arc<dyn DownstreamSink>) -> Result<String> {
        self.registry.register(sink)
    }

    /// Idempotent.
    pub fn close_session(&self, session_id: &str) -> bool {
        self.registry.deregister(session_id)
    }

    pub fn session_exists(&self, session_id: &str) -> bool {
        self.registry.contains(session_id)
    }

    /// Queue a message from `session_id` for the process's stdin.
    pub async fn submit(&self, session_id: &str, message: Message) -> Result<()> {
        if !self.registry.contains(session_id) {
            return Err(BridgeError::UnknownSession(session_id.to_string()));
        }
        if self.lifecycle.current().is_terminal() {
            return Err(BridgeError::ShuttingDown);
        }
        debug!(session_id = %session_id, kind = message.kind(), id = ?message.id(), "Forwarding to process");
        self.upstream_tx
            .send(message)
            .await
            .map_err(|_| BridgeError::Communication("process stdin is closed".to_string()))
    }

    /// Stop accepting sessions and kill the process.
    pub fn shutdown(&self) {
        if self.lifecycle.mark_stopping() {
            info!("Shutting down fan-out bridge");
        }
        self.supervisor.terminate();
    }

    /// Resolve with the process exit code once every session has been closed.
    pub async fn run_until_exit(&self) -> i32 {
        let mut stopped = self.stopped.subscribe();
        let stopped_code = stopped.wait_for(Option::is_some).await.map(|code| (*code).unwrap_or(1));
        match stopped_code {
            Ok(code) => code,
            // The sender lives in `self`, so this only happens mid-drop
            Err(_) => self.lifecycle.wait_for_exit().await,
        }
    }

    async fn teardown_on_exit(bridge: Arc<Self>) {
        let code = bridge.supervisor.wait().await;

        // Broadcast whatever the process printed before it exited
        if let Some(reader) = bridge.reader.lock().await.take()
            && tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, reader).await.is_err()
        {
            warn!("Process stdout not drained before shutdown");
        }

        let closed = bridge.registry.close_all();
        info!(code, closed, "Bridge stopped after process exit");
        bridge.stopped.send_replace(Some(code));
    }
}

async fn write_upstream<W>(mut rx: mpsc::Receiver<Message>, mut stdin: W, echo_label: Option<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = message.encode();
        if let Some(label) = &echo_label {
            echo::echo(Direction::Stdin, label, &line);
        }
        line.push('\n');

        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!("Failed to write to process stdin: {}", e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!("Failed to flush process stdin: {}", e);
            break;
        }
    }
    debug!("Process stdin writer finished");
}

async fn read_upstream(
    stdout: ChildStdout,
    decoder: FrameDecoder,
    registry: Arc<SessionRegistry>,
    echo_label: Option<String>,
) {
    let mut frames = FramedRead::new(stdout, decoder);
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to read process stdout: {}", e);
                break;
            }
        };
        if let Some(label) = &echo_label {
            echo::echo(Direction::Stdout, label, &frame);
        }
        match Message::decode(&frame) {
            Ok(message) => {
                registry.broadcast(&message).await;
            }
            Err(e) => {
                warn!(frame = %e.frame, "Discarding undecodable output from process: {}", e.reason);
            }
        }
    }
    info!("Process stdout closed");
}
