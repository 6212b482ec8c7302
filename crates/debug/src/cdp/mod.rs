//! CDP client: JSON over one WebSocket, commands correlated by id.
//!
//! The correlation discipline mirrors the proxy's transport core: every
//! command gets a monotonically allocated id and a pending entry that is
//! settled by exactly one of response, timeout, or socket loss. Events
//! (messages without an id) fan out on a broadcast bus.

mod events;

pub use events::{
    BreakpointResolvedParams, CallFrame, CdpEvent, ConsoleApiParams, ExceptionThrownParams,
    PausedParams, RemoteObject, ScriptParsedParams, WireLocation,
};

use futures_util::SinkExt;
use futures_util::stream::{SplitSink, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Default per-command timeout.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the CDP client.
#[derive(Debug, Error)]
pub enum CdpError {
    #[error("inspector connect failed: {0}")]
    Connect(String),

    #[error("inspector connection closed")]
    Closed,

    #[error("command '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("inspector error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("send failed: {0}")]
    Send(String),
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WireError>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    code: i64,
    message: String,
}

struct CdpInner {
    writer: Mutex<Option<WsSink>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Result<Value, CdpError>>>>,
    next_id: AtomicI64,
    events: broadcast::Sender<CdpEvent>,
    command_timeout: Duration,
    closed: AtomicBool,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

/// A connected CDP client.
#[derive(Clone)]
pub struct CdpClient {
    inner: Arc<CdpInner>,
}

impl std::fmt::Debug for CdpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdpClient").finish_non_exhaustive()
    }
}

impl CdpClient {
    /// Connect to an inspector WebSocket endpoint
    /// (e.g. `ws://127.0.0.1:9229/<target-id>`).
    pub async fn connect(url: &str) -> Result<Self, CdpError> {
        Self::connect_with_timeout(url, COMMAND_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        url: &str,
        command_timeout: Duration,
    ) -> Result<Self, CdpError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|err| CdpError::Connect(err.to_string()))?;
        debug!(url, "inspector connected");

        let (sink, mut source) = stream.split();
        let (events, _) = broadcast::channel(256);

        let inner = Arc::new(CdpInner {
            writer: Mutex::new(Some(sink)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            events,
            command_timeout,
            closed: AtomicBool::new(false),
            read_task: Mutex::new(None),
        });

        let reader_inner = Arc::clone(&inner);
        let read_task = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => reader_inner.handle_frame(text.as_ref()).await,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "inspector socket error");
                        break;
                    }
                }
            }
            reader_inner.abort_pending().await;
            let _ = reader_inner.events.send(CdpEvent::Disconnected);
        });
        *inner.read_task.lock().await = Some(read_task);

        Ok(Self { inner })
    }

    /// Subscribe to inspector events.
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Issue one command and await its response.
    pub async fn command(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CdpError::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let frame = json!({ "id": id, "method": method, "params": params }).to_string();
        let send_result = {
            let mut writer = self.inner.writer.lock().await;
            match writer.as_mut() {
                Some(sink) => sink
                    .send(Message::text(frame))
                    .await
                    .map_err(|err| CdpError::Send(err.to_string())),
                None => Err(CdpError::Closed),
            }
        };
        if let Err(err) = send_result {
            self.inner.pending.lock().await.remove(&id);
            return Err(err);
        }

        match timeout(self.inner.command_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CdpError::Closed),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                Err(CdpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.inner.command_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Tear the socket down and fail everything outstanding.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        self.inner.abort_pending().await;
        if let Some(task) = self.inner.read_task.lock().await.take() {
            task.abort();
        }
    }
}

impl CdpInner {
    async fn handle_frame(&self, frame: &str) {
        let message: WireMessage = match serde_json::from_str(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping unparseable inspector frame");
                return;
            }
        };

        if let Some(id) = message.id {
            if let Some(tx) = self.pending.lock().await.remove(&id) {
                let outcome = match message.error {
                    Some(error) => Err(CdpError::Protocol {
                        code: error.code,
                        message: error.message,
                    }),
                    None => Ok(message.result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            } else {
                debug!(id, "unmatched inspector response");
            }
            return;
        }

        if let Some(method) = message.method {
            let event = CdpEvent::from_wire(&method, message.params.unwrap_or(Value::Null));
            let _ = self.events.send(event);
        }
    }

    async fn abort_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(CdpError::Closed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// A scripted inspector: answers every command with an empty result and
    /// pushes a `Debugger.paused` event after seeing `Debugger.enable`.
    async fn spawn_fake_inspector() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            let (mut sink, mut source) = ws.split();

            while let Some(Ok(message)) = source.next().await {
                if let Message::Text(text) = message {
                    let request: Value = serde_json::from_str(text.as_ref()).unwrap();
                    let id = request["id"].as_i64().unwrap();
                    let method = request["method"].as_str().unwrap().to_string();

                    let response = match method.as_str() {
                        "Runtime.evaluate" => json!({
                            "id": id,
                            "result": {"result": {"type": "number", "value": 3}}
                        }),
                        "Fail.me" => json!({
                            "id": id,
                            "error": {"code": -32000, "message": "nope"}
                        }),
                        "Slow.command" => continue,
                        _ => json!({ "id": id, "result": {} }),
                    };
                    sink.send(Message::text(response.to_string())).await.unwrap();

                    if method == "Debugger.enable" {
                        let paused = json!({
                            "method": "Debugger.paused",
                            "params": {
                                "callFrames": [{
                                    "callFrameId": "f0",
                                    "functionName": "main",
                                    "location": {"scriptId": "1", "lineNumber": 0}
                                }],
                                "reason": "other"
                            }
                        });
                        sink.send(Message::text(paused.to_string())).await.unwrap();
                    }
                }
            }
        });

        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn commands_resolve_with_results() {
        let url = spawn_fake_inspector().await;
        let client = CdpClient::connect(&url).await.unwrap();

        let result = client.command("Runtime.evaluate", json!({"expression": "1+2"})).await.unwrap();
        assert_eq!(result["result"]["value"], json!(3));
        client.close().await;
    }

    #[tokio::test]
    async fn protocol_errors_are_surfaced() {
        let url = spawn_fake_inspector().await;
        let client = CdpClient::connect(&url).await.unwrap();

        let err = client.command("Fail.me", json!({})).await.unwrap_err();
        match err {
            CdpError::Protocol { code, message } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "nope");
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
        client.close().await;
    }

    #[tokio::test]
    async fn unanswered_commands_time_out() {
        let url = spawn_fake_inspector().await;
        let client = CdpClient::connect_with_timeout(&url, Duration::from_millis(100))
            .await
            .unwrap();

        let err = client.command("Slow.command", json!({})).await.unwrap_err();
        assert!(matches!(err, CdpError::Timeout { .. }));
        client.close().await;
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let url = spawn_fake_inspector().await;
        let client = CdpClient::connect(&url).await.unwrap();
        let mut events = client.subscribe();

        client.command("Debugger.enable", json!({})).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            CdpEvent::Paused(paused) => assert_eq!(paused.reason, "other"),
            other => panic!("expected Paused, got {other:?}"),
        }
        client.close().await;
    }

    #[tokio::test]
    async fn connect_failure_is_an_error() {
        let err = CdpClient::connect("ws://127.0.0.1:1/nothing").await.unwrap_err();
        assert!(matches!(err, CdpError::Connect(_)));
    }
}
