//! Manifold aggregating proxy core.
//!
//! This crate presents a single MCP endpoint to a host client while
//! multiplexing over a configurable set of upstream MCP servers: child
//! processes reached over stdio and remote servers reached over WebSocket,
//! SSE, or streamable HTTP. Upstream tool catalogs are merged into one
//! prefixed namespace (`<upstream>__<tool>`), tool invocations are routed to
//! the owning upstream, disconnections are survived through capped
//! exponential backoff, and a small set of built-in core tools provides
//! discovery and selective exposure.
//!
//! ## Layering
//!
//! - [`reconnect`] — the per-connection backoff state machine.
//! - [`transport`] — JSON-RPC framing/correlation core plus the four
//!   concrete transports.
//! - [`registry`] — the merged, prefixed tool catalog.
//! - [`upstream`] — per-upstream lifecycle and discovery.
//! - [`server`] — the downstream-facing endpoint, dispatch, and core tools.
//! - [`command`] — the seam for optional plug-in commands.

pub mod command;
pub mod config;
pub mod logging;
pub mod reconnect;
pub mod registry;
pub mod server;
pub mod transport;
pub mod upstream;

pub use command::{CommandError, CommandModule, CommandRegistry};
pub use config::{ConfigError, ProxyConfig, UpstreamConfig};
pub use logging::{StderrCapture, init_tracing};
pub use reconnect::{ConnectionState, ReconnectController, ReconnectSettings};
pub use registry::{ToolEntry, ToolOrigin, ToolRegistry};
pub use server::{ProxyError, ProxyServer};
pub use transport::{Connection, ConnectionEvent, RawTransport, TransportError};
pub use upstream::{Upstream, UpstreamEvent, UpstreamSet};
