//! Supervision of the single backing stdio process.
//!
//! The supervisor spawns the process with piped stdio, hands the stdin and
//! stdout pipes to the caller, forwards stderr to the log and records the exit
//! code on the shared [`BridgeLifecycle`]. The process lifetime bounds the
//! bridge lifetime: observers of the lifecycle stop when it exits.

use crate::echo::{self, Direction};
use crate::error::{BridgeError, Result};
use futures::StreamExt;
use gateway_common::{BridgeLifecycle, FrameDecoder};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Echo stderr lines in color in addition to logging them
    pub colored_output: bool,
}

/// Pipes handed to the bridge's I/O tasks.
#[derive(Debug)]
pub struct ProcessStreams {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    pid: Option<u32>,
    lifecycle: BridgeLifecycle,
    kill: CancellationToken,
}

impl ProcessSupervisor {
    /// Spawn the process. A spawn failure is reported before any network
    /// listener exists.
    pub fn spawn(config: &ProcessConfig, lifecycle: BridgeLifecycle) -> Result<(Self, ProcessStreams)> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The process must not outlive the bridge, even on an early return
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BridgeError::ServerProcess(format!("Failed to spawn {}: {}", config.command, e))
            })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::ServerProcess("stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::ServerProcess("stdout was not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, process_label(pid), config.colored_output));
        }

        info!(pid = ?pid, command = %config.command, args = ?config.args, "Spawned backing process");

        let kill = CancellationToken::new();
        tokio::spawn(watch_exit(child, kill.clone(), lifecycle.clone()));

        Ok((
            Self {
                pid,
                lifecycle,
                kill,
            },
            ProcessStreams { stdin, stdout },
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn lifecycle(&self) -> &BridgeLifecycle {
        &self.lifecycle
    }

    /// Ask the process to stop. The exit is still observed through [`Self::wait`].
    pub fn terminate(&self) {
        self.kill.cancel();
    }

    /// Resolve with the exit code once the process has exited.
    pub async fn wait(&self) -> i32 {
        self.lifecycle.wait_for_exit().await
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

fn process_label(pid: Option<u32>) -> String {
    pid.map(|p| format!("pid {}", p))
        .unwrap_or_else(|| "process".to_string())
}

async fn forward_stderr(stderr: ChildStderr, label: String, colored_output: bool) {
    let mut lines = FramedRead::new(stderr, FrameDecoder::new());
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                info!(target: "child_stderr", process = %label, "{}", line);
                if colored_output {
                    echo::echo(Direction::Stderr, &label, &line);
                }
            }
            Err(e) => {
                warn!(process = %label, "Failed to read stderr: {}", e);
                break;
            }
        }
    }
}

async fn watch_exit(mut child: Child, kill: CancellationToken, lifecycle: BridgeLifecycle) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            info!(pid = ?child.id(), "Terminating backing process");
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill backing process: {}", e);
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            error!("Failed to wait for backing process: {}", e);
            1
        }
    };
    info!(code, "Backing process exited");
    lifecycle.mark_exited(code);
}

/// Exit code as a shell would report it: signals map to `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
