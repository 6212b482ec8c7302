//! Transport layer: JSON-RPC framing and correlation over pluggable wires.
//!
//! A transport is split in two. A [`RawTransport`] moves opaque text frames:
//! it validates its endpoint, connects, sends, and closes, pushing incoming
//! frames and lifecycle changes over a channel. The [`Connection`] wrapper
//! owns everything transport-agnostic on top: request id allocation, the
//! pending-request table, timeouts, reconnect wiring, and the event bus.
//! Concrete wires (stdio child process, WebSocket, SSE, streamable HTTP)
//! implement only the raw half — composition, not inheritance.

mod auth;
mod connection;
mod http;
mod sse;
mod stdio;
mod ws;

pub use auth::{AuthError, AuthProvider, StaticAuthProvider};
pub use connection::{Connection, ConnectionConfig, ConnectionEvent};
pub use http::StreamableHttpTransport;
pub use sse::SseTransport;
pub use stdio::{StdioSpec, StdioTransport};
pub use ws::WsTransport;

use manifold_types::JsonRpcError;
use thiserror::Error;
use tokio::sync::mpsc;

/// Events pushed by a raw transport's read side.
#[derive(Debug)]
pub enum RawEvent {
    /// One complete inbound text frame (expected to be one JSON-RPC object).
    Message(String),
    /// The underlying wire is gone.
    Closed(RawClose),
}

/// How a raw transport ended, which decides what the reconnection
/// controller does next.
#[derive(Debug, Clone)]
pub enum RawClose {
    /// Clean shutdown requested by the remote; do not reconnect.
    Normal,
    /// Transient loss; eligible for reconnection.
    Retry(String),
    /// Protocol-level failure; reconnecting would not help.
    Fatal(String),
}

/// Sender half handed to a raw transport at connect time.
pub type RawEventSender = mpsc::Sender<RawEvent>;

/// A minimal wire: validate, connect, send, close.
///
/// Implementations push every inbound frame and the eventual close through
/// the sender given to [`RawTransport::connect`]. They hold no JSON-RPC
/// knowledge; framing and correlation live in [`Connection`].
#[async_trait::async_trait]
pub trait RawTransport: Send {
    /// A short label for logs ("stdio", "ws", "sse", "streamable-http").
    fn kind(&self) -> &'static str;

    /// Check the endpoint descriptor before any connect attempt. Errors are
    /// non-retryable.
    fn validate(&self) -> Result<(), TransportError>;

    /// Open the wire and start the read side. Called again on reconnect;
    /// implementations must tear down any previous state.
    async fn connect(&mut self, events: RawEventSender) -> Result<(), TransportError>;

    /// Transmit one already-framed message.
    async fn send_raw(&mut self, frame: String) -> Result<(), TransportError>;

    /// Tear the wire down. Must be safe to call at any point.
    async fn close_raw(&mut self) -> Result<(), TransportError>;
}

/// Errors produced by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connect-time failure that is worth retrying.
    #[error("connect failed: {message}")]
    Connect { message: String },

    /// Endpoint or protocol-level failure; retrying would not help.
    #[error("transport failure: {message}")]
    Fatal { message: String },

    /// Authentication failed and a refresh did not help.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// A write onto the wire failed.
    #[error("send failed: {message}")]
    Send { message: String },

    /// The transport is closed.
    #[error("transport closed")]
    Closed,

    /// No response arrived within the request timeout.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The remote answered with a JSON-RPC error object.
    #[error(transparent)]
    Rpc(#[from] JsonRpcError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect { message: message.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal { message: message.into() }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth { message: message.into() }
    }

    pub fn send(message: impl Into<String>) -> Self {
        Self::Send { message: message.into() }
    }

    /// Whether the reconnection controller should spend an attempt on this.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. }
                | TransportError::Send { .. }
                | TransportError::Io(_)
        )
    }
}
