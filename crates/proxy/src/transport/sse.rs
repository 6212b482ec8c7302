//! SSE transport: a GET event stream inbound, paired HTTP POSTs outbound.

use crate::transport::{
    AuthProvider, RawClose, RawEvent, RawEventSender, RawTransport, TransportError,
};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

/// Session header echoed on outgoing POSTs.
pub(crate) const SESSION_HEADER: &str = "Mcp-Session-Id";

/// How long to wait for the server's `endpoint` event before the connect
/// attempt is considered failed.
const ENDPOINT_WAIT: Duration = Duration::from_secs(10);

/// Where outgoing messages are POSTed, as established by the `endpoint`
/// event.
#[derive(Debug, Clone)]
struct PostTarget {
    url: Url,
    session_id: Option<String>,
}

/// Raw transport over Server-Sent Events.
///
/// The server pushes JSON-RPC messages as `data:` frames on a long-lived
/// GET stream; the client sends by POSTing to the endpoint announced on the
/// stream's `endpoint` event, echoing the established session id.
pub struct SseTransport {
    name: String,
    url: Url,
    auth: Option<Arc<dyn AuthProvider>>,
    client: reqwest::Client,
    target: Arc<Mutex<Option<PostTarget>>>,
    read_task: Option<JoinHandle<()>>,
}

impl SseTransport {
    pub fn new(name: impl Into<String>, url: Url, auth: Option<Arc<dyn AuthProvider>>) -> Self {
        Self {
            name: name.into(),
            url,
            auth,
            client: reqwest::Client::new(),
            target: Arc::new(Mutex::new(None)),
            read_task: None,
        }
    }

    async fn auth_headers(&self) -> Result<Vec<(String, String)>, TransportError> {
        match &self.auth {
            Some(provider) => provider
                .headers()
                .await
                .map_err(|err| TransportError::auth(err.to_string())),
            None => Ok(Vec::new()),
        }
    }

    /// One GET attempt on the event stream.
    async fn open_stream(
        &self,
        headers: &[(String, String)],
    ) -> Result<reqwest::Response, TransportError> {
        let mut request = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream");
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|err| TransportError::connect(format!("SSE connect failed: {err}")))?;

        if response.status().as_u16() == 401 {
            return Err(TransportError::auth("SSE stream returned 401"));
        }
        if !response.status().is_success() {
            return Err(TransportError::connect(format!(
                "SSE stream returned HTTP {}",
                response.status()
            )));
        }
        Ok(response)
    }

    fn teardown(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        *self.target.lock().expect("target lock") = None;
    }
}

#[async_trait::async_trait]
impl RawTransport for SseTransport {
    fn kind(&self) -> &'static str {
        "sse"
    }

    fn validate(&self) -> Result<(), TransportError> {
        match self.url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(TransportError::fatal(format!(
                "SSE transport requires http(s), got '{other}'"
            ))),
        }
    }

    async fn connect(&mut self, events: RawEventSender) -> Result<(), TransportError> {
        self.teardown();

        let headers = self.auth_headers().await?;
        let response = match self.open_stream(&headers).await {
            Ok(response) => response,
            Err(TransportError::Auth { .. }) => {
                let provider = self
                    .auth
                    .as_ref()
                    .ok_or_else(|| TransportError::auth("401 without auth configured"))?;
                provider
                    .refresh()
                    .await
                    .map_err(|err| TransportError::auth(err.to_string()))?;
                let headers = self.auth_headers().await?;
                match self.open_stream(&headers).await {
                    Ok(response) => response,
                    Err(TransportError::Auth { .. }) => {
                        return Err(TransportError::auth("401 after credential refresh"));
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };

        // A session id may arrive as a response header before the endpoint
        // event carries one.
        let header_session = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
        let mut ready_tx = Some(ready_tx);

        let name = self.name.clone();
        let origin = self.url.clone();
        let target = Arc::clone(&self.target);
        self.read_task = Some(tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let _ = events
                            .send(RawEvent::Closed(RawClose::Retry(format!(
                                "SSE stream error: {err}"
                            ))))
                            .await;
                        return;
                    }
                };
                buf.extend_from_slice(&bytes);

                for frame in drain_frames(&mut buf) {
                    match frame.event.as_deref() {
                        Some("endpoint") => {
                            let Some(data) = frame.data else { continue };
                            match origin.join(data.trim()) {
                                Ok(url) => {
                                    let session_id = session_id_from_url(&url)
                                        .or_else(|| header_session.clone());
                                    debug!(upstream = %name, endpoint = %url, "SSE endpoint established");
                                    *target.lock().expect("target lock") =
                                        Some(PostTarget { url, session_id });
                                    if let Some(tx) = ready_tx.take() {
                                        let _ = tx.send(());
                                    }
                                }
                                Err(err) => {
                                    warn!(upstream = %name, error = %err, "bad SSE endpoint URL");
                                }
                            }
                        }
                        None | Some("message") => {
                            if let Some(data) = frame.data
                                && events.send(RawEvent::Message(data)).await.is_err()
                            {
                                return;
                            }
                        }
                        Some(other) => {
                            debug!(upstream = %name, event = other, "ignoring SSE event");
                        }
                    }
                }
            }

            let _ = events
                .send(RawEvent::Closed(RawClose::Retry(
                    "SSE stream ended".to_string(),
                )))
                .await;
        }));

        // Sends are impossible until the endpoint event lands; treat its
        // absence as a failed (retryable) connect.
        match tokio::time::timeout(ENDPOINT_WAIT, ready_rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                self.teardown();
                Err(TransportError::connect(
                    "SSE endpoint event not received",
                ))
            }
        }
    }

    async fn send_raw(&mut self, frame: String) -> Result<(), TransportError> {
        let target = self
            .target
            .lock()
            .expect("target lock")
            .clone()
            .ok_or(TransportError::Closed)?;

        let headers = self.auth_headers().await?;
        let mut request = self
            .client
            .post(target.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(frame);
        for (key, value) in &headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(session_id) = &target.session_id {
            request = request.header(SESSION_HEADER, session_id.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|err| TransportError::send(format!("SSE POST failed: {err}")))?;

        if !response.status().is_success() {
            return Err(TransportError::send(format!(
                "SSE POST returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn close_raw(&mut self) -> Result<(), TransportError> {
        self.teardown();
        Ok(())
    }
}

/// Extract a session id from an endpoint URL's query string.
fn session_id_from_url(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "sessionId" || key == "session_id")
        .map(|(_, value)| value.into_owned())
}

/// One parsed SSE frame.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: Option<String>,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

/// Drain every complete frame out of the buffer, leaving any partial frame
/// in place. Frames are separated by a blank line (`\n\n` or `\r\n\r\n`).
pub(crate) fn drain_frames(buf: &mut Vec<u8>) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    loop {
        let Some((end, sep_len)) = find_frame_boundary(buf) else {
            break;
        };
        let text = String::from_utf8_lossy(&buf[..end]).into_owned();
        buf.drain(..end + sep_len);
        if let Some(frame) = parse_sse_frame(&text) {
            frames.push(frame);
        }
    }
    frames
}

fn find_frame_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if buf[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
    }
    None
}

/// Parse one frame's text into its fields. Comment lines (leading `:`) are
/// skipped; multiple `data:` lines are joined with newlines.
pub(crate) fn parse_sse_frame(text: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("event:") {
            frame.event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("id:") {
            frame.id = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("retry:")
            && let Ok(ms) = rest.trim().parse()
        {
            frame.retry = Some(ms);
        }
    }

    if !data_lines.is_empty() {
        frame.data = Some(data_lines.join("\n"));
    }

    if frame == SseFrame::default() {
        None
    } else {
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_data_frame() {
        let mut buf = b"data: {\"jsonrpc\":\"2.0\"}\n\n".to_vec();
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.as_deref(), Some("{\"jsonrpc\":\"2.0\"}"));
        assert!(buf.is_empty());
    }

    #[test]
    fn keeps_partial_frame_in_buffer() {
        let mut buf = b"data: one\n\ndata: partial".to_vec();
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(buf, b"data: partial");
    }

    #[test]
    fn handles_crlf_separators() {
        let mut buf = b"event: endpoint\r\ndata: /messages?sessionId=s1\r\n\r\n".to_vec();
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("endpoint"));
        assert_eq!(frames[0].data.as_deref(), Some("/messages?sessionId=s1"));
    }

    #[test]
    fn joins_multiline_data() {
        let mut buf = b"data: line1\ndata: line2\n\n".to_vec();
        let frames = drain_frames(&mut buf);
        assert_eq!(frames[0].data.as_deref(), Some("line1\nline2"));
    }

    #[test]
    fn skips_comment_lines() {
        let mut buf = b": keepalive\n\n".to_vec();
        assert!(drain_frames(&mut buf).is_empty());
    }

    #[test]
    fn parses_id_and_retry() {
        let frame = parse_sse_frame("id: 42\nretry: 3000\ndata: x").unwrap();
        assert_eq!(frame.id.as_deref(), Some("42"));
        assert_eq!(frame.retry, Some(3000));
    }

    #[test]
    fn extracts_session_id_from_endpoint_url() {
        let url = Url::parse("https://h/messages?sessionId=abc-123").unwrap();
        assert_eq!(session_id_from_url(&url).as_deref(), Some("abc-123"));

        let url = Url::parse("https://h/messages").unwrap();
        assert!(session_id_from_url(&url).is_none());
    }

    #[test]
    fn validate_rejects_non_http() {
        let transport = SseTransport::new(
            "x",
            Url::parse("wss://h/events").unwrap(),
            None,
        );
        assert!(transport.validate().is_err());
    }
}
