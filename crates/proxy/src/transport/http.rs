//! Streamable HTTP transport: one POST per outbound message.
//!
//! Each outgoing message is POSTed to a single URL. The server answers with
//! either one JSON-RPC response body (`application/json`) or an SSE body
//! (`text/event-stream`) carrying several messages; the transport
//! demultiplexes both into the same inbound event stream. A session id
//! assigned by the server is captured from the response headers and echoed
//! on subsequent requests.

use crate::transport::sse::{SESSION_HEADER, drain_frames};
use crate::transport::{
    AuthProvider, RawEvent, RawEventSender, RawTransport, TransportError,
};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

pub struct StreamableHttpTransport {
    name: String,
    url: Url,
    auth: Option<Arc<dyn AuthProvider>>,
    client: reqwest::Client,
    session_id: Arc<Mutex<Option<String>>>,
    events: Option<RawEventSender>,
    stream_tasks: Vec<JoinHandle<()>>,
}

impl StreamableHttpTransport {
    pub fn new(name: impl Into<String>, url: Url, auth: Option<Arc<dyn AuthProvider>>) -> Self {
        Self {
            name: name.into(),
            url,
            auth,
            client: reqwest::Client::new(),
            session_id: Arc::new(Mutex::new(None)),
            events: None,
            stream_tasks: Vec::new(),
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

    async fn post_once(
        &self,
        frame: &str,
        headers: &[(String, String)],
    ) -> Result<reqwest::Response, TransportError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(frame.to_string());
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(session_id) = self.session_id.lock().expect("session lock").clone() {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request
            .send()
            .await
            .map_err(|err| TransportError::send(format!("HTTP POST failed: {err}")))?;

        if response.status().as_u16() == 401 {
            return Err(TransportError::auth("HTTP POST returned 401"));
        }
        if !response.status().is_success() {
            return Err(TransportError::send(format!(
                "HTTP POST returned {}",
                response.status()
            )));
        }
        Ok(response)
    }

    fn reap_finished_tasks(&mut self) {
        self.stream_tasks.retain(|task| !task.is_finished());
    }
}

#[async_trait::async_trait]
impl RawTransport for StreamableHttpTransport {
    fn kind(&self) -> &'static str {
        "streamable-http"
    }

    fn validate(&self) -> Result<(), TransportError> {
        match self.url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(TransportError::fatal(format!(
                "streamable HTTP transport requires http(s), got '{other}'"
            ))),
        }
    }

    async fn connect(&mut self, events: RawEventSender) -> Result<(), TransportError> {
        // The wire itself is per-request; connecting just arms the inbound
        // side and forgets any previous session.
        self.events = Some(events);
        *self.session_id.lock().expect("session lock") = None;
        Ok(())
    }

    async fn send_raw(&mut self, frame: String) -> Result<(), TransportError> {
        let events = self.events.clone().ok_or(TransportError::Closed)?;
        self.reap_finished_tasks();

        let headers = self.auth_headers().await?;
        let response = match self.post_once(&frame, &headers).await {
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
                match self.post_once(&frame, &headers).await {
                    Ok(response) => response,
                    Err(TransportError::Auth { .. }) => {
                        return Err(TransportError::auth("401 after credential refresh"));
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut guard = self.session_id.lock().expect("session lock");
            if guard.as_deref() != Some(session) {
                debug!(upstream = %self.name, session, "captured session id");
                *guard = Some(session.to_string());
            }
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            // Multi-message response: demultiplex in the background so the
            // write resolves as soon as the request is accepted.
            let name = self.name.clone();
            self.stream_tasks.push(tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                let mut buf: Vec<u8> = Vec::new();
                while let Some(chunk) = stream.next().await {
                    let bytes = match chunk {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            warn!(upstream = %name, error = %err, "response stream error");
                            return;
                        }
                    };
                    buf.extend_from_slice(&bytes);
                    for frame in drain_frames(&mut buf) {
                        if let Some(data) = frame.data
                            && events.send(RawEvent::Message(data)).await.is_err()
                        {
                            return;
                        }
                    }
                }
            }));
        } else if content_type.starts_with("application/json") {
            let body = response
                .text()
                .await
                .map_err(|err| TransportError::send(format!("failed to read response: {err}")))?;
            if !body.trim().is_empty()
                && events.send(RawEvent::Message(body)).await.is_err()
            {
                return Err(TransportError::Closed);
            }
        }
        // Anything else (202 Accepted with no body, typically) means the
        // notification was taken and nothing comes back on this exchange.

        Ok(())
    }

    async fn close_raw(&mut self) -> Result<(), TransportError> {
        for task in self.stream_tasks.drain(..) {
            task.abort();
        }
        self.events = None;

        // Best-effort session teardown.
        let session = self.session_id.lock().expect("session lock").take();
        if let Some(session) = session {
            let _ = self
                .client
                .delete(self.url.clone())
                .header(SESSION_HEADER, session)
                .send()
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_http_and_https() {
        let ok = StreamableHttpTransport::new(
            "x",
            Url::parse("https://mcp.example.com/mcp").unwrap(),
            None,
        );
        assert!(ok.validate().is_ok());

        let bad = StreamableHttpTransport::new(
            "x",
            Url::parse("ws://mcp.example.com/mcp").unwrap(),
            None,
        );
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn send_before_connect_is_closed() {
        let mut transport = StreamableHttpTransport::new(
            "x",
            Url::parse("https://mcp.example.com/mcp").unwrap(),
            None,
        );
        let err = transport.send_raw("{}".to_string()).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
