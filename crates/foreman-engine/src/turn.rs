//! Assistant subprocess turn runner.
//!
//! Every turn is a fresh invocation of the external assistant CLI:
//!
//! ```text
//! <agent-bin> -p "<prompt>" --output-format stream-json --verbose [--resume <token>]
//! ```
//!
//! stdout is decoded incrementally from raw bytes into protocol messages;
//! stderr is drained for diagnostics only. The turn task owns the child:
//! cancellation is a `Notify` observed between reads, and the exit status is
//! reported through the returned join handle so the supervisor can attach
//! its end-of-turn continuation instead of racing a callback.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use foreman_core::ndjson::{LineDecoder, Message, parse_line};

use crate::error::{EngineError, EngineResult};
use crate::workspace::usable_working_dir;

/// Configuration for one subprocess turn.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Path to the assistant CLI binary.
    pub agent_bin: PathBuf,
    /// Prompt for this turn.
    pub prompt: String,
    /// Resume token from a prior turn, if any.
    pub resume_token: Option<String>,
    /// Working directory for the subprocess.
    pub working_directory: PathBuf,
    /// Grace period between SIGTERM and SIGKILL on cancellation.
    pub terminate_timeout: Duration,
}

/// How a turn's subprocess finished.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Clean zero exit, not cancelled.
    pub exit_ok: bool,
    /// The turn was cancelled via its `Notify`.
    pub cancelled: bool,
    /// Failure description for abnormal exits.
    pub error: Option<String>,
}

/// Spawn a subprocess turn.
///
/// Decoded protocol messages flow through `message_tx` in arrival order;
/// the join handle resolves to the [`TurnOutcome`] once the process exits.
pub fn spawn_turn(
    config: TurnConfig,
    message_tx: mpsc::Sender<Message>,
    cancel: Arc<Notify>,
) -> EngineResult<JoinHandle<TurnOutcome>> {
    let mut cmd = Command::from(build_command(&config));
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    info!(
        agent_bin = %config.agent_bin.display(),
        working_dir = %config.working_directory.display(),
        resuming = config.resume_token.is_some(),
        "Spawning assistant subprocess"
    );

    let mut child = cmd
        .spawn()
        .map_err(|e| EngineError::Subprocess(format!("failed to spawn subprocess: {e}")))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::Subprocess("failed to capture stdout".to_string()))?;

    // Drain stderr for diagnostics; it is never parsed as protocol.
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("stderr: {}", line);
            }
        });
    }

    let terminate_timeout = config.terminate_timeout;
    let handle = tokio::spawn(async move {
        let mut decoder = LineDecoder::new();
        let mut buf = [0u8; 4096];
        let mut cancelled = false;

        loop {
            tokio::select! {
                read = stdout.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in decoder.push(&buf[..n]) {
                            forward_line(&line, &message_tx).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "stdout read failed");
                        break;
                    }
                },
                () = cancel.notified() => {
                    cancelled = true;
                    terminate_process(&mut child, terminate_timeout).await;
                    break;
                }
            }
        }

        if let Some(line) = decoder.finish() {
            forward_line(&line, &message_tx).await;
        }

        if cancelled {
            info!("Turn cancelled");
            return TurnOutcome {
                exit_ok: false,
                cancelled: true,
                error: None,
            };
        }

        match child.wait().await {
            Ok(status) if status.success() => TurnOutcome {
                exit_ok: true,
                cancelled: false,
                error: None,
            },
            Ok(status) => TurnOutcome {
                exit_ok: false,
                cancelled: false,
                error: Some(format!(
                    "subprocess exited with code {}",
                    status.code().unwrap_or(-1)
                )),
            },
            Err(e) => TurnOutcome {
                exit_ok: false,
                cancelled: false,
                error: Some(format!("failed to await subprocess: {e}")),
            },
        }
    });

    Ok(handle)
}

/// Build the CLI invocation for a turn.
fn build_command(config: &TurnConfig) -> std::process::Command {
    let mut cmd = std::process::Command::new(&config.agent_bin);
    cmd.current_dir(usable_working_dir(&config.working_directory))
        .arg("-p")
        .arg(&config.prompt)
        .arg("--output-format")
        .arg("stream-json")
        .arg("--verbose");

    if let Some(ref token) = config.resume_token {
        cmd.arg("--resume").arg(token);
    }

    // Essential env vars survive even when the embedding service runs with a
    // stripped environment.
    cmd.env_clear();
    for key in ["HOME", "PATH", "ANTHROPIC_API_KEY"] {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }

    cmd
}

async fn forward_line(line: &str, message_tx: &mpsc::Sender<Message>) {
    match parse_line(line) {
        Ok(msg) => {
            if message_tx.send(msg).await.is_err() {
                debug!("Message channel closed");
            }
        }
        Err(e) => warn!(error = %e, "Skipping undecodable stdout line"),
    }
}

/// Terminate a process: SIGTERM, wait the grace period, then SIGKILL.
async fn terminate_process(child: &mut tokio::process::Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid comes from our own Child handle; kill(2) with
            // SIGTERM is safe on an owned subprocess.
            #[allow(unsafe_code, clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(pid, error = %err, "Failed to send SIGTERM");
            }
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!("Grace period expired, sending SIGKILL");
        let _ = child.kill().await;
    }
}
