//! WebSocket transport for remote MCP upstreams.

use crate::transport::{
    AuthProvider, RawClose, RawEvent, RawEventSender, RawTransport, TransportError,
};
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Default keepalive ping interval.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Raw transport over WebSocket text frames.
///
/// Auth headers are injected at handshake time only. A ping rides the wire
/// every `ping_interval` to keep intermediaries from idling the connection
/// out.
pub struct WsTransport {
    name: String,
    url: Url,
    auth: Option<Arc<dyn AuthProvider>>,
    ping_interval: Duration,
    writer: Option<Arc<Mutex<WsSink>>>,
    read_task: Option<JoinHandle<()>>,
    ping_task: Option<JoinHandle<()>>,
}

impl WsTransport {
    pub fn new(
        name: impl Into<String>,
        url: Url,
        auth: Option<Arc<dyn AuthProvider>>,
        ping_interval: Option<Duration>,
    ) -> Self {
        Self {
            name: name.into(),
            url,
            auth,
            ping_interval: ping_interval.unwrap_or(DEFAULT_PING_INTERVAL),
            writer: None,
            read_task: None,
            ping_task: None,
        }
    }

    fn teardown(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
        self.writer = None;
    }

    /// One handshake attempt with the given headers.
    async fn handshake(
        &self,
        headers: &[(String, String)],
    ) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, HandshakeFailure> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| HandshakeFailure::Fatal(format!("invalid WebSocket URL: {err}")))?;

        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| HandshakeFailure::Fatal(format!("invalid header name '{key}': {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| HandshakeFailure::Fatal(format!("invalid header value for '{key}': {err}")))?;
            request.headers_mut().insert(name, value);
        }

        match connect_async(request).await {
            Ok((stream, response)) => {
                debug!(upstream = %self.name, status = ?response.status(), "websocket connected");
                Ok(stream)
            }
            Err(tokio_tungstenite::tungstenite::Error::Http(response))
                if response.status().as_u16() == 401 =>
            {
                Err(HandshakeFailure::Unauthorized)
            }
            Err(err) => Err(HandshakeFailure::Retryable(format!(
                "websocket connect failed: {err}"
            ))),
        }
    }
}

enum HandshakeFailure {
    Unauthorized,
    Retryable(String),
    Fatal(String),
}

#[async_trait::async_trait]
impl RawTransport for WsTransport {
    fn kind(&self) -> &'static str {
        "ws"
    }

    fn validate(&self) -> Result<(), TransportError> {
        match self.url.scheme() {
            "wss" => Ok(()),
            "ws" if is_localhost(&self.url) => Ok(()),
            "ws" => Err(TransportError::fatal(format!(
                "insecure ws:// is only allowed for localhost, got '{}'",
                self.url
            ))),
            other => Err(TransportError::fatal(format!(
                "unsupported WebSocket scheme '{other}'"
            ))),
        }
    }

    async fn connect(&mut self, events: RawEventSender) -> Result<(), TransportError> {
        self.teardown();

        let headers = match &self.auth {
            Some(provider) => provider
                .headers()
                .await
                .map_err(|err| TransportError::auth(err.to_string()))?,
            None => Vec::new(),
        };

        let stream = match self.handshake(&headers).await {
            Ok(stream) => stream,
            Err(HandshakeFailure::Unauthorized) => {
                // One refresh, one retry; a second 401 is fatal.
                let provider = self
                    .auth
                    .as_ref()
                    .ok_or_else(|| TransportError::auth("401 without auth configured"))?;
                provider
                    .refresh()
                    .await
                    .map_err(|err| TransportError::auth(err.to_string()))?;
                let headers = provider
                    .headers()
                    .await
                    .map_err(|err| TransportError::auth(err.to_string()))?;
                match self.handshake(&headers).await {
                    Ok(stream) => stream,
                    Err(HandshakeFailure::Unauthorized) => {
                        return Err(TransportError::auth("401 after credential refresh"));
                    }
                    Err(HandshakeFailure::Retryable(message)) => {
                        return Err(TransportError::connect(message));
                    }
                    Err(HandshakeFailure::Fatal(message)) => {
                        return Err(TransportError::fatal(message));
                    }
                }
            }
            Err(HandshakeFailure::Retryable(message)) => {
                return Err(TransportError::connect(message));
            }
            Err(HandshakeFailure::Fatal(message)) => {
                return Err(TransportError::fatal(message));
            }
        };

        let (sink, mut source) = stream.split();
        let writer = Arc::new(Mutex::new(sink));
        self.writer = Some(Arc::clone(&writer));

        let name = self.name.clone();
        let pong_writer = Arc::clone(&writer);
        self.read_task = Some(tokio::spawn(async move {
            loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(RawEvent::Message(text.to_string())).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let mut sink = pong_writer.lock().await;
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let close = map_close_frame(frame.as_ref().map(|f| u16::from(f.code)));
                        let _ = events.send(RawEvent::Closed(close)).await;
                        return;
                    }
                    Some(Ok(other)) => {
                        debug!(upstream = %name, "ignoring non-text frame: {other:?}");
                    }
                    Some(Err(err)) => {
                        let _ = events
                            .send(RawEvent::Closed(RawClose::Retry(format!(
                                "websocket error: {err}"
                            ))))
                            .await;
                        return;
                    }
                    None => {
                        let _ = events
                            .send(RawEvent::Closed(RawClose::Retry(
                                "websocket stream ended".to_string(),
                            )))
                            .await;
                        return;
                    }
                }
            }
        }));

        let ping_writer = Arc::clone(&writer);
        let ping_interval = self.ping_interval;
        let ping_name = self.name.clone();
        self.ping_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(ping_interval);
            interval.tick().await; // The first tick fires immediately; skip it.
            loop {
                interval.tick().await;
                let mut sink = ping_writer.lock().await;
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    warn!(upstream = %ping_name, "ping failed, stopping keepalive");
                    return;
                }
            }
        }));

        Ok(())
    }

    async fn send_raw(&mut self, frame: String) -> Result<(), TransportError> {
        let writer = self.writer.as_ref().ok_or(TransportError::Closed)?;
        let mut sink = writer.lock().await;
        sink.send(Message::text(frame))
            .await
            .map_err(|err| TransportError::send(format!("websocket send failed: {err}")))
    }

    async fn close_raw(&mut self) -> Result<(), TransportError> {
        if let Some(writer) = self.writer.take() {
            let mut sink = writer.lock().await;
            let _ = sink.send(Message::Close(None)).await;
        }
        self.teardown();
        Ok(())
    }
}

/// Close-code policy: 1000 normal, 1002/1003 protocol error (no reconnect),
/// 1011 server error (reconnect), everything else reconnects.
fn map_close_frame(code: Option<u16>) -> RawClose {
    match code {
        Some(1000) | None => RawClose::Normal,
        Some(code @ (1002 | 1003)) => {
            RawClose::Fatal(format!("websocket protocol error (close code {code})"))
        }
        Some(1011) => RawClose::Retry("websocket server error (close code 1011)".to_string()),
        Some(code) => RawClose::Retry(format!("websocket closed with code {code}")),
    }
}

fn is_localhost(url: &Url) -> bool {
    matches!(
        url.host_str(),
        Some("localhost") | Some("127.0.0.1") | Some("[::1]") | Some("::1")
    )
}
