//! One interactive debug session against a CDP target.

use crate::breakpoints::{Breakpoint, BreakpointRegistry, ResolvedLocation};
use crate::cdp::{CdpClient, CdpError, CdpEvent, PausedParams};
use crate::console::{ConsoleBuffer, ConsoleEntry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Session lifecycle, independent of the target's execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initializing,
    Connected,
    Active,
    Terminating,
    Terminated,
}

/// What the debug target itself is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Running,
    Paused,
    Terminated,
}

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Cdp(#[from] CdpError),

    #[error("session terminated")]
    Terminated,

    #[error("no pause occurred within {timeout_ms}ms")]
    PauseTimeout { timeout_ms: u64 },

    #[error("unknown session: {id}")]
    NotFound { id: String },

    #[error("unknown breakpoint: {id}")]
    BreakpointNotFound { id: String },
}

/// The top frame captured at a pause, 1-based.
#[derive(Debug, Clone, Serialize)]
pub struct FrameInfo {
    pub call_frame_id: String,
    pub function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub line: u32,
    pub column: u32,
}

/// What a pause looked like when it happened.
#[derive(Debug, Clone, Serialize)]
pub struct PauseSnapshot {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<FrameInfo>,
    pub hit_breakpoints: Vec<String>,
}

impl PauseSnapshot {
    fn from_params(params: &PausedParams) -> Self {
        let frame = params.call_frames.first().map(|frame| FrameInfo {
            call_frame_id: frame.call_frame_id.clone(),
            function_name: frame.function_name.clone(),
            url: frame.url.clone(),
            line: frame.location.line_number + 1,
            column: frame.location.column_number,
        });
        Self {
            reason: params.reason.clone(),
            frame,
            hit_breakpoints: params.hit_breakpoints.clone(),
        }
    }
}

/// Coordinates concurrent `wait_for_pause` callers.
///
/// Every waiter registered before a pause is resolved by that one pause
/// event; each keeps its own timeout. Termination rejects everyone.
pub(crate) struct PauseGate {
    inner: Mutex<GateInner>,
}

struct GateInner {
    execution: ExecutionState,
    last_pause: Option<PauseSnapshot>,
    waiters: Vec<oneshot::Sender<PauseSnapshot>>,
}

impl PauseGate {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(GateInner {
                execution: ExecutionState::Running,
                last_pause: None,
                waiters: Vec::new(),
            }),
        }
    }

    pub(crate) fn execution(&self) -> ExecutionState {
        self.inner.lock().expect("gate lock").execution
    }

    pub(crate) fn last_pause(&self) -> Option<PauseSnapshot> {
        self.inner.lock().expect("gate lock").last_pause.clone()
    }

    pub(crate) fn on_pause(&self, snapshot: PauseSnapshot) {
        let waiters = {
            let mut inner = self.inner.lock().expect("gate lock");
            inner.execution = ExecutionState::Paused;
            inner.last_pause = Some(snapshot.clone());
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(snapshot.clone());
        }
    }

    pub(crate) fn on_resume(&self) {
        let mut inner = self.inner.lock().expect("gate lock");
        if inner.execution == ExecutionState::Paused {
            inner.execution = ExecutionState::Running;
        }
        inner.last_pause = None;
    }

    /// Dropping the senders rejects every outstanding wait.
    pub(crate) fn on_terminated(&self) {
        let mut inner = self.inner.lock().expect("gate lock");
        inner.execution = ExecutionState::Terminated;
        inner.waiters.clear();
    }

    pub(crate) async fn wait(&self, timeout: Duration) -> Result<PauseSnapshot, SessionError> {
        let rx = {
            let mut inner = self.inner.lock().expect("gate lock");
            match inner.execution {
                ExecutionState::Paused => {
                    if let Some(snapshot) = inner.last_pause.clone() {
                        return Ok(snapshot);
                    }
                    // Paused without a snapshot should not happen; fall
                    // through and wait for the next pause.
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(tx);
                    rx
                }
                ExecutionState::Terminated => return Err(SessionError::Terminated),
                ExecutionState::Running => {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(tx);
                    rx
                }
            }
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(SessionError::Terminated),
            Err(_) => Err(SessionError::PauseTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Summary of one session for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub target_url: String,
    pub state: SessionState,
    pub execution: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub breakpoint_count: usize,
}

/// A live (or post-mortem) debug session.
pub struct DebugSession {
    id: String,
    target_url: String,
    created_at: DateTime<Utc>,
    client: CdpClient,
    state: Mutex<SessionState>,
    gate: PauseGate,
    breakpoints: AsyncMutex<BreakpointRegistry>,
    console: Mutex<ConsoleBuffer>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl DebugSession {
    /// Connect to the target's inspector endpoint and enable the debugger
    /// domains.
    pub async fn connect(id: String, ws_url: &str) -> Result<Arc<Self>, SessionError> {
        let client = CdpClient::connect(ws_url).await?;

        let session = Arc::new(Self {
            id,
            target_url: ws_url.to_string(),
            created_at: Utc::now(),
            client: client.clone(),
            state: Mutex::new(SessionState::Initializing),
            gate: PauseGate::new(),
            breakpoints: AsyncMutex::new(BreakpointRegistry::new()),
            console: Mutex::new(ConsoleBuffer::default()),
            event_task: Mutex::new(None),
        });

        // Subscribe before enabling the domains so no early event is lost.
        let events = client.subscribe();
        let task = tokio::spawn(Self::event_loop(Arc::clone(&session), events));
        *session.event_task.lock().expect("task lock") = Some(task);

        client.command("Runtime.enable", json!({})).await?;
        client.command("Debugger.enable", json!({})).await?;
        session.set_state(SessionState::Connected);

        // Targets started with --inspect-brk sit waiting for this.
        if let Err(err) = client
            .command("Runtime.runIfWaitingForDebugger", json!({}))
            .await
        {
            debug!(error = %err, "runIfWaitingForDebugger not supported by target");
        }
        session.set_state(SessionState::Active);

        Ok(session)
    }

    async fn event_loop(
        session: Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<CdpEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(CdpEvent::Paused(params)) => {
                    debug!(session = %session.id, reason = %params.reason, "target paused");
                    session.gate.on_pause(PauseSnapshot::from_params(&params));
                }
                Ok(CdpEvent::Resumed) => {
                    session.gate.on_resume();
                }
                Ok(CdpEvent::BreakpointResolved(params)) => {
                    session
                        .breakpoints
                        .lock()
                        .await
                        .mark_resolved(&params.breakpoint_id, &params.location);
                }
                Ok(CdpEvent::ConsoleApiCalled(params)) => {
                    let text = params
                        .args
                        .iter()
                        .map(|arg| arg.display())
                        .collect::<Vec<_>>()
                        .join(" ");
                    session.push_console(ConsoleEntry::new(params.level, text));
                }
                Ok(CdpEvent::ExceptionThrown(params)) => {
                    let details = &params.exception_details;
                    let text = details
                        .exception
                        .as_ref()
                        .map(|e| e.display())
                        .unwrap_or_else(|| details.text.clone());
                    session.push_console(ConsoleEntry::new("error", text));
                }
                Ok(CdpEvent::ScriptParsed(_)) | Ok(CdpEvent::Other { .. }) => {}
                Ok(CdpEvent::Disconnected) => {
                    // The adapter died. The session stays queryable for
                    // post-mortem inspection; only waits are rejected.
                    warn!(session = %session.id, "inspector disconnected");
                    session.gate.on_terminated();
                    session.set_state(SessionState::Terminated);
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn push_console(&self, entry: ConsoleEntry) {
        if let Ok(mut console) = self.console.lock() {
            console.push(entry);
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("state lock") = state;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock")
    }

    pub fn execution(&self) -> ExecutionState {
        self.gate.execution()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            target_url: self.target_url.clone(),
            state: self.state(),
            execution: self.execution(),
            created_at: self.created_at,
            breakpoint_count: self
                .breakpoints
                .try_lock()
                .map(|registry| registry.len())
                .unwrap_or(0),
        }
    }

    /// Block until the target pauses, the timeout lapses, or the session
    /// terminates. Many callers may wait at once; one pause resolves all.
    pub async fn wait_for_pause(&self, timeout: Duration) -> Result<PauseSnapshot, SessionError> {
        self.gate.wait(timeout).await
    }

    /// Set a breakpoint by file and 1-based line. Synchronous from the
    /// caller's perspective: resolves once the target has answered.
    pub async fn set_breakpoint(
        &self,
        file: &str,
        line: u32,
        condition: Option<String>,
    ) -> Result<Breakpoint, SessionError> {
        self.ensure_live()?;
        let url = if file.contains("://") {
            file.to_string()
        } else {
            format!("file://{file}")
        };

        let mut params = json!({
            "url": url,
            "lineNumber": line.saturating_sub(1),
        });
        if let Some(condition) = &condition {
            params["condition"] = Value::String(condition.clone());
        }

        let result = self.client.command("Debugger.setBreakpointByUrl", params).await?;
        let id = result
            .get("breakpointId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let resolved_locations: Vec<ResolvedLocation> = result
            .get("locations")
            .and_then(Value::as_array)
            .map(|locations| {
                locations
                    .iter()
                    .filter_map(|l| serde_json::from_value(l.clone()).ok())
                    .map(|wire: crate::cdp::WireLocation| ResolvedLocation::from_wire(&wire))
                    .collect()
            })
            .unwrap_or_default();

        let breakpoint = Breakpoint {
            id: id.clone(),
            file: file.to_string(),
            line,
            condition,
            verified: !resolved_locations.is_empty(),
            resolved_locations,
        };
        self.breakpoints.lock().await.insert(breakpoint.clone());
        Ok(breakpoint)
    }

    /// Remove a breakpoint by target-issued id.
    pub async fn remove_breakpoint(&self, id: &str) -> Result<(), SessionError> {
        self.ensure_live()?;
        if self.breakpoints.lock().await.get(id).is_none() {
            return Err(SessionError::BreakpointNotFound { id: id.to_string() });
        }
        self.client
            .command("Debugger.removeBreakpoint", json!({ "breakpointId": id }))
            .await?;
        self.breakpoints.lock().await.remove(id);
        Ok(())
    }

    pub async fn list_breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.lock().await.list()
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.client.command("Debugger.resume", json!({})).await?;
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.client.command("Debugger.pause", json!({})).await?;
        Ok(())
    }

    pub async fn step_over(&self) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.client.command("Debugger.stepOver", json!({})).await?;
        Ok(())
    }

    /// Evaluate an expression: in the paused top frame while paused, in the
    /// global scope otherwise.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, SessionError> {
        self.ensure_live()?;

        let paused_frame = match self.gate.execution() {
            ExecutionState::Paused => self
                .gate
                .last_pause()
                .and_then(|snapshot| snapshot.frame.map(|frame| frame.call_frame_id)),
            _ => None,
        };

        let result = match paused_frame {
            Some(call_frame_id) => {
                self.client
                    .command(
                        "Debugger.evaluateOnCallFrame",
                        json!({
                            "callFrameId": call_frame_id,
                            "expression": expression,
                            "returnByValue": true,
                        }),
                    )
                    .await?
            }
            None => {
                self.client
                    .command(
                        "Runtime.evaluate",
                        json!({ "expression": expression, "returnByValue": true }),
                    )
                    .await?
            }
        };

        Ok(result.get("result").cloned().unwrap_or(Value::Null))
    }

    /// The most recent captured console output, oldest first.
    pub fn console_output(&self, limit: usize) -> Vec<ConsoleEntry> {
        self.console
            .lock()
            .map(|console| console.recent(limit))
            .unwrap_or_default()
    }

    /// Tear the session down. The session object itself stays queryable;
    /// deletion is the owner's decision.
    pub async fn terminate(&self) {
        if self.state() == SessionState::Terminated {
            return;
        }
        self.set_state(SessionState::Terminating);
        self.client.close().await;
        self.gate.on_terminated();
        self.set_state(SessionState::Terminated);
        if let Some(task) = self.event_task.lock().expect("task lock").take() {
            task.abort();
        }
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Terminating | SessionState::Terminated => Err(SessionError::Terminated),
            _ => Ok(()),
        }
    }
}
