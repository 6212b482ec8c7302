//! The framing and correlation core shared by all transports.

use crate::reconnect::{ConnectionState, ReconnectController, ReconnectSettings};
use crate::transport::{RawClose, RawEvent, RawTransport, TransportError};
use manifold_types::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, RequestId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long a request may stay unanswered before it is failed. A zero
    /// timeout fails every request immediately.
    pub request_timeout: Duration,
    pub reconnect: ReconnectSettings,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(30_000),
            reconnect: ReconnectSettings::default(),
        }
    }
}

/// Lifecycle and traffic events observable on a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The wire is up; a fresh opaque session id was generated.
    Connected { session_id: String },
    /// Any inbound message, responses included.
    Message(JsonRpcMessage),
    /// The wire is down. Fired once per close.
    Closed { reason: String },
    /// A recoverable error worth surfacing to observers.
    Error { message: String },
}

/// One pending request awaiting its correlated response.
struct PendingEntry {
    tx: oneshot::Sender<Result<Value, TransportError>>,
    #[allow(dead_code)]
    queued_at: Instant,
}

struct ConnectionInner {
    name: String,
    raw: Mutex<Box<dyn RawTransport>>,
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
    next_id: AtomicI64,
    request_timeout: Duration,
    events: broadcast::Sender<ConnectionEvent>,
    reconnect: ReconnectController,
    session_id: std::sync::Mutex<Option<String>>,
    started: AtomicBool,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// A JSON-RPC client connection over an arbitrary raw transport.
///
/// Allocates ids, keeps the pending-request table, applies the request
/// timeout, and drives the reconnection controller. Cloning shares the
/// underlying connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(
        name: impl Into<String>,
        raw: Box<dyn RawTransport>,
        config: ConnectionConfig,
    ) -> Self {
        let name = name.into();
        let (events, _) = broadcast::channel(256);
        let reconnect = ReconnectController::new(name.clone(), config.reconnect);

        let inner = Arc::new(ConnectionInner {
            name,
            raw: Mutex::new(raw),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            request_timeout: config.request_timeout,
            events,
            reconnect,
            session_id: std::sync::Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pump: Mutex::new(None),
        });

        // Retry thunk and give-up hook hold weak references so a dropped
        // connection is not kept alive by its own scheduled retries.
        let weak = Arc::downgrade(&inner);
        let weak_give_up = weak.clone();
        inner.reconnect.set_hooks(
            Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        let _ = ConnectionInner::establish(&inner).await;
                    }
                })
            }),
            Arc::new(move |error| {
                if let Some(inner) = weak_give_up.upgrade() {
                    let _ = inner.events.send(ConnectionEvent::Error {
                        message: format!("connection failed permanently: {error}"),
                    });
                }
            }),
        );

        Self { inner }
    }

    /// Logical name of the peer this connection reaches.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.reconnect.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Opaque id of the current wire session, if connected.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().expect("session lock").clone()
    }

    /// Subscribe to lifecycle and traffic events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Observe reconnection state transitions.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.reconnect.subscribe()
    }

    /// Open the connection. Idempotent: once started, further calls are
    /// no-ops. The first connect error is returned; retryable failures keep
    /// retrying in the background regardless.
    pub async fn start(&self) -> Result<(), TransportError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let raw = self.inner.raw.lock().await;
            raw.validate()?;
        }

        ConnectionInner::establish(&self.inner).await
    }

    /// Send a request and await its correlated response.
    ///
    /// A fresh id is allocated unless the caller supplies one. The pending
    /// entry is removed by exactly one of: response match, timeout, or
    /// close.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, TransportError> {
        self.request_with_id(None, method, params).await
    }

    /// Like [`Connection::request`] with a caller-chosen id, honored as-is.
    pub async fn request_with_id(
        &self,
        id: Option<RequestId>,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let id = id.unwrap_or_else(|| {
            RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst))
        });

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id.clone(), PendingEntry { tx, queued_at: Instant::now() });
        }

        let frame =
            JsonRpcMessage::from(JsonRpcRequest::new(id.clone(), method, params)).to_line();
        let send_result = {
            let mut raw = self.inner.raw.lock().await;
            raw.send_raw(frame).await
        };
        if let Err(err) = send_result {
            self.inner.pending.lock().await.remove(&id);
            return Err(err);
        }

        match timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // The sender was dropped without a verdict: the table was torn
            // down by a close.
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                Err(TransportError::Timeout {
                    timeout_ms: self.inner.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification; no correlation, resolves once the write is on
    /// the wire.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let frame = JsonRpcMessage::from(JsonRpcNotification::new(method, params)).to_line();
        let mut raw = self.inner.raw.lock().await;
        raw.send_raw(frame).await
    }

    /// Write an arbitrary pre-built message (response or notification)
    /// directly onto the wire.
    pub async fn send_message(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut raw = self.inner.raw.lock().await;
        raw.send_raw(message.to_line()).await
    }

    /// Close the connection. Idempotent. Cancels reconnection, aborts all
    /// pending requests, closes the wire, and fires `Closed` once.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.reconnect.cancel();
        self.inner.abort_pending().await;

        {
            let mut raw = self.inner.raw.lock().await;
            if let Err(err) = raw.close_raw().await {
                debug!(connection = %self.inner.name, error = %err, "close_raw reported an error");
            }
        }

        if let Some(pump) = self.inner.pump.lock().await.take() {
            pump.abort();
        }

        let _ = self.inner.events.send(ConnectionEvent::Closed {
            reason: "closed by owner".to_string(),
        });
    }

    /// Number of requests currently awaiting a response.
    #[cfg(test)]
    pub async fn pending_len(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

impl ConnectionInner {
    /// Run one connect attempt and wire up the read pump on success.
    async fn establish(inner: &Arc<ConnectionInner>) -> Result<(), TransportError> {
        if inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        inner.reconnect.note_connecting();

        let (tx, rx) = mpsc::channel(64);
        let result = {
            let mut raw = inner.raw.lock().await;
            raw.connect(tx).await
        };

        match result {
            Ok(()) => {
                let session_id = Uuid::new_v4().to_string();
                *inner.session_id.lock().expect("session lock") = Some(session_id.clone());
                inner.reconnect.note_connected();

                let pump = tokio::spawn(Self::pump(Arc::clone(inner), rx));
                if let Some(previous) = inner.pump.lock().await.replace(pump) {
                    previous.abort();
                }

                let _ = inner.events.send(ConnectionEvent::Connected { session_id });
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                let _ = inner.events.send(ConnectionEvent::Error { message: err.to_string() });
                inner.reconnect.note_disconnected(err.to_string());
                Err(err)
            }
            Err(err) => {
                let _ = inner.events.send(ConnectionEvent::Error { message: err.to_string() });
                inner.reconnect.fail(err.to_string());
                Err(err)
            }
        }
    }

    /// Drain raw events for the lifetime of one wire session.
    async fn pump(inner: Arc<ConnectionInner>, mut rx: mpsc::Receiver<RawEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                RawEvent::Message(frame) => inner.handle_frame(&frame).await,
                RawEvent::Closed(close) => {
                    inner.abort_pending().await;

                    if inner.closed.load(Ordering::SeqCst) {
                        // Owner-initiated close already emitted `Closed`.
                        break;
                    }

                    let reason = match &close {
                        RawClose::Normal => "closed by remote".to_string(),
                        RawClose::Retry(e) | RawClose::Fatal(e) => e.clone(),
                    };
                    let _ = inner
                        .events
                        .send(ConnectionEvent::Closed { reason: reason.clone() });

                    match close {
                        RawClose::Normal => inner.reconnect.cancel(),
                        RawClose::Retry(error) => inner.reconnect.note_disconnected(error),
                        RawClose::Fatal(error) => inner.reconnect.fail(error),
                    }
                    break;
                }
            }
        }
    }

    /// Parse one inbound frame, settle its pending entry if it is a
    /// response, and forward it to observers either way.
    async fn handle_frame(&self, frame: &str) {
        let message = match JsonRpcMessage::from_str(frame) {
            Ok(message) => message,
            Err(err) => {
                // Framing violations are logged and dropped; the transport
                // stays up.
                warn!(connection = %self.name, error = %err, "dropping unparseable frame");
                return;
            }
        };

        if let JsonRpcMessage::Response(response) = &message {
            let entry = self.pending.lock().await.remove(&response.id);
            match entry {
                Some(entry) => {
                    let outcome = match (&response.result, &response.error) {
                        (_, Some(error)) => Err(TransportError::Rpc(error.clone())),
                        (Some(result), None) => Ok(result.clone()),
                        (None, None) => Ok(Value::Null),
                    };
                    let _ = entry.tx.send(outcome);
                }
                None => {
                    debug!(connection = %self.name, id = %response.id, "unmatched response id");
                }
            }
        }

        let _ = self.events.send(ConnectionEvent::Message(message));
    }

    /// Drop every pending entry; awaiting callers observe a closed
    /// transport.
    async fn abort_pending(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            debug!(
                connection = %self.name,
                aborted = pending.len(),
                "aborting pending requests"
            );
        }
        for (_, entry) in pending.drain() {
            let _ = entry.tx.send(Err(TransportError::Closed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_types::JsonRpcResponse;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    /// Scripted in-process wire for exercising the correlation core.
    struct MockRaw {
        /// Frames the connection has written, in order.
        sent: Arc<StdMutex<Vec<String>>>,
        /// Event sender captured at connect time so tests can inject
        /// inbound frames and closes.
        events: Arc<StdMutex<Option<RawEventSender>>>,
        /// Error to produce on connect, once.
        connect_error: Option<TransportError>,
    }

    use crate::transport::RawEventSender;

    impl MockRaw {
        fn new() -> (Box<Self>, Arc<StdMutex<Vec<String>>>, Arc<StdMutex<Option<RawEventSender>>>) {
            let sent = Arc::new(StdMutex::new(Vec::new()));
            let events = Arc::new(StdMutex::new(None));
            let raw = Box::new(Self {
                sent: Arc::clone(&sent),
                events: Arc::clone(&events),
                connect_error: None,
            });
            (raw, sent, events)
        }
    }

    #[async_trait::async_trait]
    impl RawTransport for MockRaw {
        fn kind(&self) -> &'static str {
            "mock"
        }

        fn validate(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn connect(&mut self, events: RawEventSender) -> Result<(), TransportError> {
            if let Some(err) = self.connect_error.take() {
                return Err(err);
            }
            *self.events.lock().unwrap() = Some(events);
            Ok(())
        }

        async fn send_raw(&mut self, frame: String) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close_raw(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            request_timeout: Duration::from_millis(200),
            reconnect: ReconnectSettings {
                max_attempts: 0,
                ..ReconnectSettings::default()
            },
        }
    }

    async fn inject(events: &Arc<StdMutex<Option<RawEventSender>>>, event: RawEvent) {
        let sender = events.lock().unwrap().clone().expect("connected");
        sender.send(event).await.expect("pump alive");
    }

    #[tokio::test]
    async fn allocates_distinct_monotonic_ids() {
        let (raw, sent, events) = MockRaw::new();
        let conn = Connection::new("mock", raw, fast_config());
        conn.start().await.unwrap();

        for _ in 0..3 {
            let conn = conn.clone();
            tokio::spawn(async move {
                let _ = conn.request("ping", None).await;
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frames = sent.lock().unwrap().clone();
        assert_eq!(frames.len(), 3);
        let mut ids: Vec<i64> = frames
            .iter()
            .map(|f| serde_json::from_str::<Value>(f).unwrap()["id"].as_i64().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        drop(events);
    }

    #[tokio::test]
    async fn correlates_response_by_id() {
        let (raw, _sent, events) = MockRaw::new();
        let conn = Connection::new("mock", raw, fast_config());
        conn.start().await.unwrap();

        let request = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request("tools/list", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let response = JsonRpcMessage::from(JsonRpcResponse::success(
            RequestId::Number(1),
            json!({"tools": []}),
        ));
        inject(&events, RawEvent::Message(response.to_line())).await;

        let result = request.await.unwrap().unwrap();
        assert_eq!(result, json!({"tools": []}));
        assert_eq!(conn.pending_len().await, 0);
    }

    #[tokio::test]
    async fn out_of_order_responses_resolve_the_right_callers() {
        let (raw, _sent, events) = MockRaw::new();
        let conn = Connection::new("mock", raw, fast_config());
        conn.start().await.unwrap();

        let first = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request("a", None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request("b", None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Answer id 2 before id 1.
        inject(
            &events,
            RawEvent::Message(
                JsonRpcMessage::from(JsonRpcResponse::success(RequestId::Number(2), json!("two")))
                    .to_line(),
            ),
        )
        .await;
        inject(
            &events,
            RawEvent::Message(
                JsonRpcMessage::from(JsonRpcResponse::success(RequestId::Number(1), json!("one")))
                    .to_line(),
            ),
        )
        .await;

        assert_eq!(first.await.unwrap().unwrap(), json!("one"));
        assert_eq!(second.await.unwrap().unwrap(), json!("two"));
    }

    #[tokio::test]
    async fn timeout_removes_pending_and_keeps_transport_up() {
        let (raw, _sent, events) = MockRaw::new();
        let conn = Connection::new("mock", raw, fast_config());
        conn.start().await.unwrap();

        let err = conn.request("slow", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        assert_eq!(conn.pending_len().await, 0);
        assert!(conn.is_connected());

        // The transport was not torn down: a later request still works.
        let request = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request("fast", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        inject(
            &events,
            RawEvent::Message(
                JsonRpcMessage::from(JsonRpcResponse::success(RequestId::Number(2), json!("fast")))
                    .to_line(),
            ),
        )
        .await;
        assert_eq!(request.await.unwrap().unwrap(), json!("fast"));
    }

    #[tokio::test]
    async fn zero_timeout_fails_immediately() {
        let (raw, _sent, _events) = MockRaw::new();
        let config = ConnectionConfig {
            request_timeout: Duration::ZERO,
            ..fast_config()
        };
        let conn = Connection::new("mock", raw, config);
        conn.start().await.unwrap();

        let err = conn.request("anything", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { timeout_ms: 0 }));
    }

    #[tokio::test]
    async fn close_aborts_pending_and_is_idempotent() {
        let (raw, _sent, _events) = MockRaw::new();
        let conn = Connection::new("mock", raw, fast_config());
        conn.start().await.unwrap();

        let request = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request("never", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        conn.close().await;
        conn.close().await;

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert_eq!(conn.pending_len().await, 0);

        let err = conn.request("after-close", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (raw, _sent, _events) = MockRaw::new();
        let conn = Connection::new("mock", raw, fast_config());
        conn.start().await.unwrap();
        let before = conn.session_id();
        conn.start().await.unwrap();
        assert_eq!(conn.session_id(), before);
    }

    #[tokio::test]
    async fn caller_supplied_ids_are_honored() {
        let (raw, sent, _events) = MockRaw::new();
        let conn = Connection::new("mock", raw, fast_config());
        conn.start().await.unwrap();

        let conn2 = conn.clone();
        tokio::spawn(async move {
            let _ = conn2
                .request_with_id(Some(RequestId::String("ext-7".into())), "x", None)
                .await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let frames = sent.lock().unwrap().clone();
        assert_eq!(
            serde_json::from_str::<Value>(&frames[0]).unwrap()["id"],
            json!("ext-7")
        );
    }

    #[tokio::test]
    async fn notifications_and_server_requests_reach_observers() {
        let (raw, _sent, events) = MockRaw::new();
        let conn = Connection::new("mock", raw, fast_config());
        let mut rx = conn.subscribe();
        conn.start().await.unwrap();

        // Drain the Connected event.
        loop {
            if let ConnectionEvent::Connected { .. } = rx.recv().await.unwrap() {
                break;
            }
        }

        inject(
            &events,
            RawEvent::Message(
                JsonRpcMessage::from(JsonRpcNotification::new("notifications/tools/list_changed", None))
                    .to_line(),
            ),
        )
        .await;

        match rx.recv().await.unwrap() {
            ConnectionEvent::Message(JsonRpcMessage::Notification(n)) => {
                assert_eq!(n.method, "notifications/tools/list_changed");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unparseable_frames_are_dropped_without_closing() {
        let (raw, _sent, events) = MockRaw::new();
        let conn = Connection::new("mock", raw, fast_config());
        conn.start().await.unwrap();

        inject(&events, RawEvent::Message("{not json".to_string())).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn remote_close_aborts_pending() {
        let (raw, _sent, events) = MockRaw::new();
        let conn = Connection::new("mock", raw, fast_config());
        conn.start().await.unwrap();

        let request = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request("never", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        inject(&events, RawEvent::Closed(RawClose::Normal)).await;

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
