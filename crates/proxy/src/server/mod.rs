//! The downstream-facing proxy server.
//!
//! Speaks JSON-RPC 2.0 with the host client over newline-delimited JSON
//! (stdio from the host's perspective), routes `tools/call` through the
//! registry to upstreams, core tools, or plug-in commands, and emits
//! coalesced `tools/list_changed` notifications whenever the exposed
//! catalog changes.

mod core_tools;
mod registry_tools;

pub use registry_tools::RegistryClient;

use crate::command::{CommandError, CommandRegistry};
use crate::config::ProxyConfig;
use crate::logging::StderrCapture;
use crate::registry::{ExposureFilter, Resolution, ToolRegistry};
use crate::transport::TransportError;
use crate::upstream::{UpstreamDefaults, UpstreamError, UpstreamEvent, UpstreamSet};
use manifold_types::{
    CallToolResult, InitializeResult, JsonRpcError, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ServerInfo, jsonrpc,
};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// MCP protocol revision advertised downstream.
const PROTOCOL_VERSION: &str = "2025-06-18";

/// Errors that are fatal to the proxy as a whole. Everything else is
/// per-request or per-upstream and never tears the server down.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration admits no upstreams and no core tools")]
    NothingToServe,

    #[error("invalid exposure pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("proxy is already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) struct ProxyInner {
    config: ProxyConfig,
    registry: RwLock<ToolRegistry>,
    upstreams: UpstreamSet,
    commands: CommandRegistry,
    registry_client: Option<RegistryClient>,
    list_changed: Notify,
    outbound: mpsc::UnboundedSender<String>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    stderr_capture: StderrCapture,
}

/// One MCP endpoint fronting N upstream servers.
#[derive(Clone)]
pub struct ProxyServer {
    inner: Arc<ProxyInner>,
}

impl ProxyServer {
    /// Build the proxy: compile the exposure filter, mount core and command
    /// tools, and verify there is something to serve.
    pub fn new(config: ProxyConfig, commands: CommandRegistry) -> Result<Self, ProxyError> {
        let filter = ExposureFilter::new(
            &config.expose_tools,
            &config.hide_tools,
            &config.always_visible_tools,
        )?;
        let mut registry = ToolRegistry::new(filter);

        let registry_client = config
            .registry
            .as_ref()
            .map(RegistryClient::from_settings);

        for metadata in core_tools::mounted_tools(&config, registry_client.is_some()) {
            registry.register_core(metadata);
        }

        for command in commands.iter() {
            registry.register_command_tools(command.name(), command.tools());
        }

        let enabled_upstreams = config.servers.iter().filter(|s| !s.is_disabled()).count();
        if enabled_upstreams == 0 && registry.is_empty() {
            return Err(ProxyError::NothingToServe);
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(ProxyInner {
                config,
                registry: RwLock::new(registry),
                upstreams: UpstreamSet::new(),
                commands,
                registry_client,
                list_changed: Notify::new(),
                outbound,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                stderr_capture: StderrCapture::default(),
            }),
        })
    }

    /// Connect every configured upstream in parallel and begin supervising
    /// them. Per-upstream failures are logged, never fatal.
    pub async fn start_upstreams(&self) {
        // Subscribe before any upstream can connect so no discovery event
        // is lost.
        let events = self.inner.upstreams.subscribe();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            ProxyInner::upstream_event_loop(inner, events).await;
        });

        let defaults = UpstreamDefaults::from_config(
            &self.inner.config,
            self.inner.stderr_capture.clone(),
        );
        let results = self
            .inner
            .upstreams
            .start_all(&self.inner.config.servers, &defaults)
            .await;

        let connected = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!(
            connected,
            configured = results.len(),
            "upstream startup complete"
        );
    }

    /// Serve the downstream endpoint on this process's stdio.
    pub async fn run_stdio(&self) -> Result<(), ProxyError> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve the downstream endpoint over an arbitrary byte stream pair.
    /// Returns when the host closes its side.
    pub async fn run<R, W>(&self, reader: R, writer: W) -> Result<(), ProxyError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or(ProxyError::AlreadyRunning)?;

        let writer_task: JoinHandle<()> = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = outbound_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let notifier_task = {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                ProxyInner::notifier_loop(inner).await;
            })
        };

        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    self.inner.clone().handle_line(line).await;
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "downstream read error");
                    break;
                }
            }
        }

        info!("downstream closed, shutting down");
        self.inner.upstreams.shutdown().await;
        notifier_task.abort();
        writer_task.abort();
        Ok(())
    }

    /// Captured upstream stderr, for diagnostics.
    pub fn stderr_capture(&self) -> &StderrCapture {
        &self.inner.stderr_capture
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ProxyInner> {
        &self.inner
    }
}

impl ProxyInner {
    /// Apply upstream lifecycle events to the registry. Registry mutation
    /// always precedes the change notification, so a `tools/list` issued
    /// after the notification observes the mutation.
    async fn upstream_event_loop(
        inner: Arc<ProxyInner>,
        mut events: tokio::sync::broadcast::Receiver<UpstreamEvent>,
    ) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "upstream event loop lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            match event {
                UpstreamEvent::Discovered { name, tools } => {
                    inner
                        .registry
                        .write()
                        .await
                        .register_upstream_tools(&name, tools);
                    inner.schedule_list_changed();
                }
                UpstreamEvent::Disconnected { name } | UpstreamEvent::Failed { name, .. } => {
                    let removed = inner.registry.write().await.remove_owner(&name);
                    if removed > 0 {
                        inner.schedule_list_changed();
                    }
                }
                UpstreamEvent::Connected { .. } => {}
            }
        }
    }

    /// Emit one `tools/list_changed` per burst of triggers.
    async fn notifier_loop(inner: Arc<ProxyInner>) {
        loop {
            inner.list_changed.notified().await;
            // Let same-tick triggers land before emitting.
            tokio::task::yield_now().await;
            let notification = JsonRpcMessage::from(JsonRpcNotification::new(
                "notifications/tools/list_changed",
                None,
            ));
            inner.send_line(notification.to_line());
            debug!("sent tools/list_changed");
        }
    }

    pub(crate) fn schedule_list_changed(&self) {
        self.list_changed.notify_one();
    }

    fn send_line(&self, line: String) {
        let _ = self.outbound.send(line);
    }

    fn respond(&self, response: JsonRpcResponse) {
        self.send_line(JsonRpcMessage::from(response).to_line());
    }

    /// Handle one inbound line from the host.
    async fn handle_line(self: Arc<Self>, line: String) {
        let message = match JsonRpcMessage::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                // Parse errors are logged and dropped; the endpoint stays up.
                warn!(error = %err, "dropping unparseable downstream frame");
                return;
            }
        };

        match message {
            JsonRpcMessage::Request(request) => self.handle_request(request).await,
            JsonRpcMessage::Notification(notification) => {
                debug!(method = %notification.method, "downstream notification");
            }
            JsonRpcMessage::Response(response) => {
                debug!(id = %response.id, "ignoring unsolicited downstream response");
            }
        }
    }

    async fn handle_request(self: Arc<Self>, request: JsonRpcRequest) {
        match request.method.as_str() {
            "initialize" => {
                let result = InitializeResult {
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    capabilities: json!({ "tools": { "listChanged": true } }),
                    server_info: ServerInfo {
                        name: "manifold".to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                };
                // These shapes serialize infallibly.
                let result = serde_json::to_value(result).unwrap_or_default();
                self.respond(JsonRpcResponse::success(request.id, result));
            }
            "ping" => {
                self.respond(JsonRpcResponse::success(request.id, json!({})));
            }
            "tools/list" => {
                let tools = self.registry.read().await.exposed_tools();
                self.respond(JsonRpcResponse::success(
                    request.id,
                    json!({ "tools": tools }),
                ));
            }
            "tools/call" => {
                // Dispatch on its own task so a slow upstream cannot block
                // the read loop or other calls.
                let inner = Arc::clone(&self);
                tokio::spawn(async move {
                    let (name, arguments) = match parse_call_params(request.params) {
                        Ok(parsed) => parsed,
                        Err(error) => {
                            inner.respond(JsonRpcResponse::failure(request.id, error));
                            return;
                        }
                    };

                    let response = match inner.dispatch_tool(&name, arguments).await {
                        Ok(result) => JsonRpcResponse::success(request.id, result),
                        Err(error) => JsonRpcResponse::failure(request.id, error),
                    };
                    inner.respond(response);
                });
            }
            other => {
                self.respond(JsonRpcResponse::failure(
                    request.id,
                    JsonRpcError::method_not_found(other),
                ));
            }
        }
    }

    /// Resolve and dispatch one tool invocation. Also the backing for the
    /// `bridge_tool_request` core tool.
    pub(crate) async fn dispatch_tool(
        self: &Arc<Self>,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, JsonRpcError> {
        let resolution = self
            .registry
            .read()
            .await
            .resolve(name, self.config.allow_short_tool_names);

        match resolution {
            Resolution::Core(tool) => core_tools::dispatch(self, &tool, arguments).await,
            Resolution::Upstream { upstream, tool } => {
                match self.upstreams.call_tool(&upstream, &tool, &arguments).await {
                    Ok(result) => Ok(result),
                    Err(err) => Err(map_upstream_error(err)),
                }
            }
            Resolution::Command { command, tool } => {
                let module = self
                    .commands
                    .get(&command)
                    .ok_or_else(|| JsonRpcError::tool_not_found(name))?
                    .clone();
                match module.call_tool(&tool, arguments).await {
                    Ok(result) => to_result_value(result),
                    Err(CommandError::InvalidArguments { message }) => {
                        Err(JsonRpcError::invalid_params(message))
                    }
                    Err(CommandError::UnknownTool { .. }) => {
                        Err(JsonRpcError::tool_not_found(name))
                    }
                    Err(CommandError::Failed { message }) => Err(JsonRpcError::internal(message)),
                }
            }
            Resolution::NotFound => Err(JsonRpcError::tool_not_found(name)),
            Resolution::Ambiguous(candidates) => {
                Err(JsonRpcError::ambiguous_tool(name, &candidates))
            }
        }
    }

    pub(crate) fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &RwLock<ToolRegistry> {
        &self.registry
    }

    pub(crate) fn registry_client(&self) -> Option<&RegistryClient> {
        self.registry_client.as_ref()
    }
}

fn parse_call_params(params: Option<Value>) -> Result<(String, Map<String, Value>), JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError::invalid_params("missing params"))?;
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcError::invalid_params("missing 'name'"))?
        .to_string();
    let arguments = match params.get("arguments") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(JsonRpcError::invalid_params("'arguments' must be an object"));
        }
    };
    Ok((name, arguments))
}

fn to_result_value(result: CallToolResult) -> Result<Value, JsonRpcError> {
    serde_json::to_value(result)
        .map_err(|err| JsonRpcError::internal(format!("failed to encode result: {err}")))
}

fn map_upstream_error(err: UpstreamError) -> JsonRpcError {
    match err {
        UpstreamError::NotFound { name } | UpstreamError::Unavailable { name } => {
            JsonRpcError::upstream_unavailable(&name)
        }
        // Upstream JSON-RPC errors pass through verbatim.
        UpstreamError::Transport(TransportError::Rpc(error)) => error,
        UpstreamError::Transport(TransportError::Timeout { timeout_ms }) => {
            JsonRpcError::timeout(format!("upstream request timed out after {timeout_ms}ms"))
        }
        UpstreamError::Transport(TransportError::Closed) => {
            JsonRpcError::new(jsonrpc::UPSTREAM_UNAVAILABLE, "upstream connection closed")
        }
        other => JsonRpcError::internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use std::time::Duration;

    fn config(json: &str) -> ProxyConfig {
        serde_json::from_str(json).expect("test config parses")
    }

    fn server(json: &str) -> ProxyServer {
        ProxyServer::new(config(json), CommandRegistry::new()).expect("server builds")
    }

    #[tokio::test]
    async fn empty_config_with_core_tools_is_servable() {
        // No upstreams, but the default core tools are mounted.
        let server = server("{}");
        let tools = server.inner().registry.read().await.exposed_tools();
        assert!(tools.iter().any(|t| t.name == "discover_tools_by_words"));
    }

    #[test]
    fn zero_upstreams_and_zero_core_tools_is_fatal() {
        let result = ProxyServer::new(
            config(r#"{"exposeCoreTools": []}"#),
            CommandRegistry::new(),
        );
        assert!(matches!(result, Err(ProxyError::NothingToServe)));
    }

    #[tokio::test]
    async fn unknown_method_gets_method_not_found() {
        let server = server("{}");
        let inner = Arc::clone(server.inner());
        let mut rx = inner.outbound_rx.lock().await.take().unwrap();

        inner
            .clone()
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"resources/list"}"#.to_string())
            .await;

        let line = rx.recv().await.unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["error"]["code"], json!(jsonrpc::METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn initialize_advertises_list_changed() {
        let server = server("{}");
        let inner = Arc::clone(server.inner());
        let mut rx = inner.outbound_rx.lock().await.take().unwrap();

        inner
            .clone()
            .handle_line(
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-06-18"}}"#
                    .to_string(),
            )
            .await;

        let line = rx.recv().await.unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            response["result"]["capabilities"]["tools"]["listChanged"],
            json!(true)
        );
        assert_eq!(response["result"]["serverInfo"]["name"], json!("manifold"));
    }

    #[tokio::test]
    async fn call_of_unknown_tool_is_tool_not_found() {
        let server = server("{}");
        let inner = Arc::clone(server.inner());
        let err = inner
            .dispatch_tool("ghost__tool", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, jsonrpc::TOOL_NOT_FOUND);
    }

    #[tokio::test]
    async fn call_of_disconnected_upstream_is_unavailable() {
        let server = server(r#"{"servers": [{"name": "a", "command": "sleep"}]}"#);
        let inner = Arc::clone(server.inner());
        // Register tools as if discovery had run, without connecting.
        inner
            .registry
            .write()
            .await
            .register_upstream_tools("a", vec![manifold_types::ToolMetadata::new("x", "d")]);

        let err = inner.dispatch_tool("a__x", Map::new()).await.unwrap_err();
        assert_eq!(err.code, jsonrpc::UPSTREAM_UNAVAILABLE);
    }

    #[tokio::test]
    async fn parse_errors_are_dropped_silently() {
        let server = server("{}");
        let inner = Arc::clone(server.inner());
        let mut rx = inner.outbound_rx.lock().await.take().unwrap();

        inner.clone().handle_line("{broken".to_string()).await;
        inner
            .clone()
            .handle_line(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#.to_string())
            .await;

        // Only the ping response arrives.
        let line = rx.recv().await.unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["id"], json!(2));
    }

    /// A POSIX-shell MCP server: answers initialize, tools/list, and
    /// tools/call on stdio, echoing back whatever id the client allocated.
    const FAKE_UPSTREAM: &str = r#"
        while IFS= read -r line; do
          case "$line" in *'"id"'*) ;; *) continue;; esac
          id=${line#*\"id\":}
          id=${id%%,*}
          case "$line" in
            *'"initialize"'*)
              printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-06-18","capabilities":{},"serverInfo":{"name":"fake","version":"0"}}}\n' "$id";;
            *'"tools/list"'*)
              printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"x","inputSchema":{"type":"object"}},{"name":"y","inputSchema":{"type":"object"}}]}}\n' "$id";;
            *'"tools/call"'*)
              printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"ok"}]}}\n' "$id";;
          esac
        done
    "#;

    #[cfg(unix)]
    #[tokio::test]
    async fn aggregates_discovers_and_dispatches_end_to_end() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let config: ProxyConfig = serde_json::from_value(json!({
            "servers": [{
                "name": "a",
                "command": "sh",
                "args": ["-c", FAKE_UPSTREAM]
            }],
            "autoReconnect": { "enabled": false }
        }))
        .unwrap();

        let server = ProxyServer::new(config, CommandRegistry::new()).unwrap();
        server.start_upstreams().await;

        // Discovery runs on the upstream watcher; wait for it to land.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if server.inner().registry.read().await.get("a__x").is_some() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "discovery never completed");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let (client, host_side) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let run_server = server.clone();
        let run_task =
            tokio::spawn(async move { run_server.run(host_read, host_write).await });

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut responses = BufReader::new(client_read).lines();

        // Aggregate list: upstream tools under the prefix plus core tools.
        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}\n")
            .await
            .unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), responses.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        let names: Vec<&str> = response["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"a__x"));
        assert!(names.contains(&"a__y"));
        assert!(names.contains(&"discover_tools_by_words"));

        // Dispatch routing: the upstream's response comes back verbatim.
        client_write
            .write_all(
                b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/call\",\"params\":{\"name\":\"a__y\",\"arguments\":{\"n\":1}}}\n",
            )
            .await
            .unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), responses.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["id"], json!(2));
        assert_eq!(
            response["result"]["content"][0],
            json!({"type": "text", "text": "ok"})
        );

        // Closing the host side shuts the proxy down cleanly.
        drop(client_write);
        drop(responses);
        tokio::time::timeout(Duration::from_secs(5), run_task)
            .await
            .expect("run returns on host close")
            .unwrap()
            .unwrap();
    }

    #[test]
    fn call_params_require_object_arguments() {
        let err = parse_call_params(Some(json!({"name": "t", "arguments": [1, 2]}))).unwrap_err();
        assert_eq!(err.code, jsonrpc::INVALID_PARAMS);

        let (name, args) = parse_call_params(Some(json!({"name": "t"}))).unwrap();
        assert_eq!(name, "t");
        assert!(args.is_empty());
    }
}
