//! Child-process transport: newline-delimited JSON over stdio.

use crate::logging::StderrCapture;
use crate::transport::{RawClose, RawEvent, RawEventSender, RawTransport, TransportError};
use manifold_types::EnvVar;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Grace window between SIGTERM and SIGKILL at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Spawn spec for a stdio upstream.
#[derive(Debug, Clone)]
pub struct StdioSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
}

/// Raw transport speaking newline-delimited JSON to a spawned child.
///
/// The child inherits the parent environment with the configured overrides
/// applied on top (overrides win). Stderr is captured line-by-line and
/// surfaced on the diagnostic stream under the upstream's logical name,
/// never on the JSON-RPC channel.
pub struct StdioTransport {
    name: String,
    spec: StdioSpec,
    stderr_capture: StderrCapture,
    /// Shared with the read task so whichever side observes the end of the
    /// child first can reap it.
    child: Arc<Mutex<Option<Child>>>,
    stdin: Option<ChildStdin>,
    read_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl StdioTransport {
    pub fn new(name: impl Into<String>, spec: StdioSpec, stderr_capture: StderrCapture) -> Self {
        Self {
            name: name.into(),
            spec,
            stderr_capture,
            child: Arc::new(Mutex::new(None)),
            stdin: None,
            read_task: None,
            stderr_task: None,
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args);
        for EnvVar { key, value } in &self.spec.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    fn teardown_tasks(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl RawTransport for StdioTransport {
    fn kind(&self) -> &'static str {
        "stdio"
    }

    fn validate(&self) -> Result<(), TransportError> {
        if self.spec.command.trim().is_empty() {
            return Err(TransportError::fatal("stdio transport requires a command"));
        }
        Ok(())
    }

    async fn connect(&mut self, events: RawEventSender) -> Result<(), TransportError> {
        self.teardown_tasks();
        if let Some(mut old) = self.child.lock().await.take() {
            let _ = old.kill().await;
        }

        let mut child = self.build_command().spawn().map_err(|err| {
            TransportError::connect(format!("failed to spawn '{}': {err}", self.spec.command))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::fatal("child stdout not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::fatal("child stderr not piped"))?;
        self.stdin = child.stdin.take();

        debug!(upstream = %self.name, pid = ?child.id(), "spawned child process");
        *self.child.lock().await = Some(child);

        let capture = self.stderr_capture.clone();
        let stderr_name = self.name.clone();
        self.stderr_task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                capture.record(&stderr_name, &line);
            }
        }));

        let name = self.name.clone();
        let child_slot = Arc::clone(&self.child);
        self.read_task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if events.send(RawEvent::Message(line)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = events
                            .send(RawEvent::Closed(RawClose::Retry(format!(
                                "stdout read error: {err}"
                            ))))
                            .await;
                        return;
                    }
                }
            }

            // Stdout EOF. If the owner already claimed the child this is a
            // deliberate shutdown; otherwise reap it and classify the loss.
            let close = match child_slot.lock().await.take() {
                Some(mut child) => match child.wait().await {
                    Ok(status) if status.success() => {
                        RawClose::Retry("child exited".to_string())
                    }
                    Ok(status) => {
                        warn!(upstream = %name, %status, "child exited abnormally");
                        RawClose::Retry(format!("child exited with {status}"))
                    }
                    Err(err) => RawClose::Retry(format!("failed to reap child: {err}")),
                },
                None => RawClose::Normal,
            };
            let _ = events.send(RawEvent::Closed(close)).await;
        }));

        Ok(())
    }

    async fn send_raw(&mut self, frame: String) -> Result<(), TransportError> {
        let stdin = self.stdin.as_mut().ok_or(TransportError::Closed)?;
        stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(|err| TransportError::send(format!("stdin write failed: {err}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|err| TransportError::send(format!("stdin write failed: {err}")))?;
        stdin
            .flush()
            .await
            .map_err(|err| TransportError::send(format!("stdin flush failed: {err}")))?;
        Ok(())
    }

    async fn close_raw(&mut self) -> Result<(), TransportError> {
        // Claim the child before dropping stdin so the read task's EOF path
        // sees an owner-initiated shutdown.
        let child = self.child.lock().await.take();
        self.stdin = None;

        if let Some(mut child) = child {
            terminate_gracefully(&self.name, &mut child).await;
        }
        self.teardown_tasks();
        Ok(())
    }
}

/// SIGTERM, then SIGKILL after the grace window.
async fn terminate_gracefully(name: &str, child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: signaling a child process we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(_) => {
                debug!(upstream = %name, "child exited after SIGTERM");
                return;
            }
            Err(_) => {
                warn!(upstream = %name, "child ignored SIGTERM, killing");
            }
        }
    }

    let _ = child.kill().await;
}
