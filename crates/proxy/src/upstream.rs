//! Upstream lifecycle: construction, discovery, and supervision.

use crate::config::{ProxyConfig, TransportKind, UpstreamConfig};
use crate::logging::StderrCapture;
use crate::reconnect::{ConnectionState, ReconnectSettings};
use crate::transport::{
    Connection, ConnectionConfig, ConnectionEvent, SseTransport, StaticAuthProvider, StdioSpec,
    StdioTransport, StreamableHttpTransport, TransportError, WsTransport,
};
use futures_util::future::join_all;
use manifold_types::{
    ToolMetadata,
    tool::{call_tool_params, parse_tool_list},
};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// MCP protocol revision the proxy speaks to upstreams.
const PROTOCOL_VERSION: &str = "2025-06-18";

/// Shared defaults applied where an upstream config has no override.
#[derive(Clone)]
pub struct UpstreamDefaults {
    pub request_timeout: Duration,
    pub reconnect: ReconnectSettings,
    pub stderr_capture: StderrCapture,
}

impl UpstreamDefaults {
    pub fn from_config(config: &ProxyConfig, stderr_capture: StderrCapture) -> Self {
        Self {
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            reconnect: config.auto_reconnect.to_reconnect_settings(),
            stderr_capture,
        }
    }
}

/// One upstream MCP server behind the proxy.
pub struct Upstream {
    name: String,
    connection: Connection,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream").field("name", &self.name).finish()
    }
}

impl Upstream {
    /// Build the transport an upstream config describes and wrap it in a
    /// connection.
    pub fn from_config(
        config: &UpstreamConfig,
        defaults: &UpstreamDefaults,
    ) -> Result<Self, UpstreamError> {
        let auth = match &config.auth {
            Some(settings) => Some(Arc::new(
                StaticAuthProvider::from_settings(settings)
                    .map_err(|err| UpstreamError::Build {
                        name: config.name.clone(),
                        message: err.to_string(),
                    })?,
            ) as Arc<dyn crate::transport::AuthProvider>),
            None => None,
        };

        let mut connection_config = ConnectionConfig {
            request_timeout: defaults.request_timeout,
            reconnect: defaults.reconnect.clone(),
        };

        let raw: Box<dyn crate::transport::RawTransport> = if let Some(command) = &config.command {
            Box::new(StdioTransport::new(
                config.name.clone(),
                StdioSpec {
                    command: command.clone(),
                    args: config.args.clone().unwrap_or_default(),
                    env: config.env.clone().unwrap_or_default(),
                },
                defaults.stderr_capture.clone(),
            ))
        } else if let Some(transport) = &config.transport {
            if let Some(timeout_ms) = transport.timeout_ms {
                connection_config.request_timeout = Duration::from_millis(timeout_ms);
            }
            if let Some(reconnect) = &transport.reconnect {
                connection_config.reconnect = reconnect.to_reconnect_settings();
            }
            match transport.kind {
                TransportKind::Ws => Box::new(WsTransport::new(
                    config.name.clone(),
                    transport.url.clone(),
                    auth,
                    transport.ping_interval_ms.map(Duration::from_millis),
                )),
                TransportKind::Sse => Box::new(SseTransport::new(
                    config.name.clone(),
                    transport.url.clone(),
                    auth,
                )),
                TransportKind::StreamableHttp => Box::new(StreamableHttpTransport::new(
                    config.name.clone(),
                    transport.url.clone(),
                    auth,
                )),
            }
        } else {
            return Err(UpstreamError::Build {
                name: config.name.clone(),
                message: "no transport configured".to_string(),
            });
        };

        Ok(Self {
            name: config.name.clone(),
            connection: Connection::new(config.name.clone(), raw, connection_config),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Run the MCP `initialize` handshake.
    pub async fn initialize(&self) -> Result<Value, TransportError> {
        let result = self
            .connection
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "manifold",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                })),
            )
            .await?;
        self.connection
            .notify("notifications/initialized", None)
            .await?;
        Ok(result)
    }

    /// Fetch the complete tool list, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<ToolMetadata>, TransportError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor
                .as_ref()
                .map(|cursor| json!({ "cursor": cursor }));
            let result = self.connection.request("tools/list", params).await?;
            tools.extend(parse_tool_list(&result));

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        Ok(tools)
    }

    /// Forward a tool invocation with the original (unprefixed) name. The
    /// upstream's result object is returned verbatim.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: &Map<String, Value>,
    ) -> Result<Value, TransportError> {
        self.connection
            .request("tools/call", Some(call_tool_params(tool, arguments)))
            .await
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}

/// Lifecycle events emitted by the upstream set.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// The upstream's wire came up (again).
    Connected { name: String },
    /// Discovery completed; the registry should now hold these tools.
    Discovered { name: String, tools: Vec<ToolMetadata> },
    /// The upstream's wire went down.
    Disconnected { name: String },
    /// The upstream gave up reconnecting.
    Failed { name: String, error: String },
}

/// Errors from upstream construction and dispatch.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream '{name}' misconfigured: {message}")]
    Build { name: String, message: String },

    #[error("unknown upstream: {name}")]
    NotFound { name: String },

    #[error("upstream '{name}' is not connected")]
    Unavailable { name: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Supervises every configured upstream: parallel startup, re-discovery on
/// reconnect, and lifecycle event fan-out.
#[derive(Clone)]
pub struct UpstreamSet {
    upstreams: Arc<Mutex<HashMap<String, Arc<Upstream>>>>,
    watchers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    events: broadcast::Sender<UpstreamEvent>,
}

impl UpstreamSet {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            upstreams: Arc::new(Mutex::new(HashMap::new())),
            watchers: Arc::new(Mutex::new(Vec::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.events.subscribe()
    }

    /// Construct and start every enabled upstream in parallel. Individual
    /// failures are collected; they never fail the proxy as a whole.
    pub async fn start_all(
        &self,
        configs: &[UpstreamConfig],
        defaults: &UpstreamDefaults,
    ) -> Vec<(String, Result<(), String>)> {
        let mut connects: Vec<futures_util::future::BoxFuture<'static, (String, Result<(), String>)>> =
            Vec::new();

        for config in configs {
            if config.is_disabled() {
                debug!(upstream = %config.name, "skipping disabled upstream");
                continue;
            }
            let name = config.name.clone();

            let upstream = match Upstream::from_config(config, defaults) {
                Ok(upstream) => Arc::new(upstream),
                Err(err) => {
                    warn!(upstream = %name, error = %err, "failed to build upstream");
                    connects.push(Box::pin(async move { (name, Err(err.to_string())) }));
                    continue;
                }
            };

            self.watch(&upstream).await;
            self.upstreams
                .lock()
                .await
                .insert(name.clone(), Arc::clone(&upstream));

            connects.push(Box::pin(async move {
                let result = upstream
                    .connection()
                    .start()
                    .await
                    .map_err(|err| err.to_string());
                (name, result)
            }));
        }

        let results = join_all(connects).await;
        for (name, result) in &results {
            match result {
                Ok(()) => info!(upstream = %name, "upstream connected"),
                Err(error) => warn!(upstream = %name, %error, "upstream failed to connect"),
            }
        }
        results
    }

    /// Spawn the supervision task for one upstream: discovery on every
    /// connect, disconnect fan-out, terminal failure fan-out.
    async fn watch(&self, upstream: &Arc<Upstream>) {
        let mut connection_events = upstream.connection().subscribe();
        let mut state_events = upstream.connection().subscribe_state();
        let events = self.events.clone();
        let upstream = Arc::clone(upstream);

        let watcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = connection_events.recv() => match event {
                        Ok(ConnectionEvent::Connected { .. }) => {
                            let name = upstream.name().to_string();
                            let _ = events.send(UpstreamEvent::Connected { name: name.clone() });

                            match discover(&upstream).await {
                                Ok(tools) => {
                                    let _ = events.send(UpstreamEvent::Discovered { name, tools });
                                }
                                Err(err) => {
                                    warn!(upstream = %name, error = %err, "discovery failed");
                                }
                            }
                        }
                        Ok(ConnectionEvent::Closed { .. }) => {
                            let _ = events.send(UpstreamEvent::Disconnected {
                                name: upstream.name().to_string(),
                            });
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    state = state_events.recv() => match state {
                        Ok(ConnectionState::Failed) => {
                            let _ = events.send(UpstreamEvent::Failed {
                                name: upstream.name().to_string(),
                                error: "reconnection attempts exhausted".to_string(),
                            });
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        self.watchers.lock().await.push(watcher);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Upstream>> {
        self.upstreams.lock().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.upstreams.lock().await.keys().cloned().collect()
    }

    /// Dispatch a tool call to a named upstream.
    ///
    /// A disconnected upstream fails fast; dispatch never waits for
    /// reconnection.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: &Map<String, Value>,
    ) -> Result<Value, UpstreamError> {
        let upstream = self
            .get(name)
            .await
            .ok_or_else(|| UpstreamError::NotFound { name: name.to_string() })?;

        if !upstream.is_connected() {
            return Err(UpstreamError::Unavailable { name: name.to_string() });
        }

        Ok(upstream.call_tool(tool, arguments).await?)
    }

    /// Close every upstream and stop supervision.
    pub async fn shutdown(&self) {
        let upstreams: Vec<Arc<Upstream>> =
            self.upstreams.lock().await.drain().map(|(_, u)| u).collect();
        for upstream in upstreams {
            upstream.close().await;
        }
        for watcher in self.watchers.lock().await.drain(..) {
            watcher.abort();
        }
    }
}

impl Default for UpstreamSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Handshake and list tools after a (re)connect.
async fn discover(upstream: &Upstream) -> Result<Vec<ToolMetadata>, TransportError> {
    upstream.initialize().await?;
    let tools = upstream.list_tools().await?;
    debug!(upstream = %upstream.name(), count = tools.len(), "discovered tools");
    Ok(tools)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> UpstreamDefaults {
        UpstreamDefaults {
            request_timeout: Duration::from_secs(2),
            reconnect: ReconnectSettings {
                max_attempts: 0,
                ..ReconnectSettings::default()
            },
            stderr_capture: StderrCapture::disabled(),
        }
    }

    #[test]
    fn builds_stdio_upstream_from_config() {
        let config: UpstreamConfig =
            serde_json::from_str(r#"{"name": "files", "command": "npx", "args": ["x"]}"#).unwrap();
        let upstream = Upstream::from_config(&config, &defaults()).unwrap();
        assert_eq!(upstream.name(), "files");
        assert_eq!(upstream.state(), ConnectionState::Idle);
    }

    #[test]
    fn builds_each_network_kind() {
        for (kind, url) in [
            ("ws", "wss://h/ws"),
            ("sse", "https://h/events"),
            ("streamable-http", "https://h/mcp"),
        ] {
            let json = format!(
                r#"{{"name": "r", "transport": {{"kind": "{kind}", "url": "{url}"}}}}"#
            );
            let config: UpstreamConfig = serde_json::from_str(&json).unwrap();
            assert!(Upstream::from_config(&config, &defaults()).is_ok(), "{kind}");
        }
    }

    #[test]
    fn rejects_config_without_transport() {
        let config: UpstreamConfig = serde_json::from_str(r#"{"name": "empty"}"#).unwrap();
        let err = Upstream::from_config(&config, &defaults()).unwrap_err();
        assert!(matches!(err, UpstreamError::Build { .. }));
    }

    #[tokio::test]
    async fn call_tool_on_unknown_upstream_is_not_found() {
        let set = UpstreamSet::new();
        let err = set
            .call_tool("ghost", "x", &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::NotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_all_collects_failures_without_failing_others() {
        // One upstream that spawns, one that cannot.
        let configs: Vec<UpstreamConfig> = serde_json::from_str(
            r#"[
                {"name": "ok", "command": "sh", "args": ["-c", "read line"]},
                {"name": "broken", "command": "/nonexistent/not-a-binary"}
            ]"#,
        )
        .unwrap();

        let set = UpstreamSet::new();
        let results = set.start_all(&configs, &defaults()).await;

        let ok = results.iter().find(|(n, _)| n == "ok").unwrap();
        let broken = results.iter().find(|(n, _)| n == "broken").unwrap();
        assert!(ok.1.is_ok());
        assert!(broken.1.is_err());

        set.shutdown().await;
    }
}
