//! Built-in core tools served by the proxy itself.
//!
//! Core tools cover discovery and selective exposure of the aggregated
//! catalog. They are mounted at startup, filtered by `exposeCoreTools`
//! (omitted = all, empty = none), and once mounted are always exposed.

use crate::server::ProxyInner;
use futures_util::future::BoxFuture;
use manifold_types::{CallToolResult, JsonRpcError, ToolMetadata};
use serde_json::{Map, Value, json};
use std::sync::Arc;

pub(crate) const DISCOVER_TOOLS: &str = "discover_tools_by_words";
pub(crate) const GET_TOOL_SCHEMA: &str = "get_tool_schema";
pub(crate) const BRIDGE_TOOL_REQUEST: &str = "bridge_tool_request";
pub(crate) const LOAD_TOOLSET: &str = "load_toolset";
pub(crate) const SEARCH_REGISTRY: &str = "search_registry_tools";
pub(crate) const SERVER_INSTALL_INFO: &str = "get_server_install_info";

const DEFAULT_DISCOVER_LIMIT: usize = 10;

/// Core tools to mount given the configuration. Registry-service tools are
/// only offered when a registry endpoint is configured.
pub(crate) fn mounted_tools(
    config: &crate::config::ProxyConfig,
    registry_configured: bool,
) -> Vec<ToolMetadata> {
    let mut tools = vec![
        ToolMetadata::new(
            DISCOVER_TOOLS,
            "Search the aggregated tool catalog by words matched against names and descriptions; \
             optionally enable matches for this session",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "words": { "type": "string", "description": "Space-separated search words" },
                "limit": { "type": "number", "description": "Maximum results (default 10)" },
                "enable": { "type": "boolean", "description": "Expose matched tools dynamically" }
            },
            "required": ["words"]
        })),
        ToolMetadata::new(
            GET_TOOL_SCHEMA,
            "Return the input schema of one tool by fully-qualified name",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Fully-qualified tool name" }
            },
            "required": ["name"]
        })),
        ToolMetadata::new(
            BRIDGE_TOOL_REQUEST,
            "Invoke a tool by fully-qualified name with the given arguments",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "tool": { "type": "string", "description": "Fully-qualified tool name" },
                "arguments": { "type": "object", "description": "Arguments for the tool" }
            },
            "required": ["tool"]
        })),
        ToolMetadata::new(
            LOAD_TOOLSET,
            "Expose a configured named group of tools for this session",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Toolset name from configuration" }
            },
            "required": ["name"]
        })),
    ];

    if registry_configured {
        tools.push(
            ToolMetadata::new(
                SEARCH_REGISTRY,
                "Search the external tool registry service",
            )
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" }
                },
                "required": ["query"]
            })),
        );
        tools.push(
            ToolMetadata::new(
                SERVER_INSTALL_INFO,
                "Fetch install metadata for a server from the registry service",
            )
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "server": { "type": "string", "description": "Registry server identifier" }
                },
                "required": ["server"]
            })),
        );
    }

    match &config.expose_core_tools {
        None => tools,
        Some(allowed) => tools
            .into_iter()
            .filter(|tool| allowed.iter().any(|name| name == &tool.name))
            .collect(),
    }
}

/// Dispatch one core tool invocation. Returns the `tools/call` result
/// value; `bridge_tool_request` passes the bridged result through verbatim.
pub(crate) async fn dispatch(
    inner: &Arc<ProxyInner>,
    tool: &str,
    arguments: Map<String, Value>,
) -> Result<Value, JsonRpcError> {
    match tool {
        DISCOVER_TOOLS => wrap(discover_tools(inner, arguments).await?),
        GET_TOOL_SCHEMA => wrap(get_tool_schema(inner, arguments).await?),
        BRIDGE_TOOL_REQUEST => bridge_tool_request(inner, arguments).await,
        LOAD_TOOLSET => wrap(load_toolset(inner, arguments).await?),
        SEARCH_REGISTRY => wrap(search_registry(inner, arguments).await?),
        SERVER_INSTALL_INFO => wrap(server_install_info(inner, arguments).await?),
        other => Err(JsonRpcError::internal(format!(
            "core tool '{other}' has no handler"
        ))),
    }
}

fn wrap(result: CallToolResult) -> Result<Value, JsonRpcError> {
    serde_json::to_value(result)
        .map_err(|err| JsonRpcError::internal(format!("failed to encode result: {err}")))
}

fn required_str(arguments: &Map<String, Value>, key: &str) -> Result<String, JsonRpcError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| JsonRpcError::invalid_params(format!("missing '{key}'")))
}

/// Case-insensitive word match over names and descriptions, ranked by the
/// number of matching words.
async fn discover_tools(
    inner: &Arc<ProxyInner>,
    arguments: Map<String, Value>,
) -> Result<CallToolResult, JsonRpcError> {
    let words_arg = required_str(&arguments, "words")?;
    let words: Vec<String> = words_arg
        .split_whitespace()
        .map(str::to_lowercase)
        .collect();
    if words.is_empty() {
        return Err(JsonRpcError::invalid_params("'words' must not be empty"));
    }
    let limit = arguments
        .get("limit")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_DISCOVER_LIMIT);
    let enable = arguments
        .get("enable")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut matches: Vec<(String, Option<String>, usize, bool)> = {
        let registry = inner.registry().read().await;
        registry
            .all_entries()
            .filter_map(|entry| {
                let haystack = format!(
                    "{} {}",
                    entry.fq_name,
                    entry.metadata.description.as_deref().unwrap_or("")
                )
                .to_lowercase();
                let score = words.iter().filter(|w| haystack.contains(w.as_str())).count();
                (score > 0).then(|| {
                    (
                        entry.fq_name.clone(),
                        entry.metadata.description.clone(),
                        score,
                        entry.visibility.is_visible(),
                    )
                })
            })
            .collect()
    };

    matches.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
    matches.truncate(limit);

    if enable {
        let mut registry = inner.registry().write().await;
        let mut changed = false;
        for (fq_name, _, _, _) in &matches {
            changed |= registry.enable_dynamic(fq_name);
        }
        drop(registry);
        if changed {
            inner.schedule_list_changed();
        }
    }

    let tools: Vec<Value> = matches
        .into_iter()
        .map(|(name, description, score, exposed)| {
            json!({
                "name": name,
                "description": description,
                "score": score,
                "exposed": exposed || enable,
            })
        })
        .collect();

    Ok(CallToolResult::json(&json!({ "tools": tools })))
}

async fn get_tool_schema(
    inner: &Arc<ProxyInner>,
    arguments: Map<String, Value>,
) -> Result<CallToolResult, JsonRpcError> {
    let name = required_str(&arguments, "name")?;
    let registry = inner.registry().read().await;
    let entry = registry
        .get(&name)
        .ok_or_else(|| JsonRpcError::tool_not_found(&name))?;

    Ok(CallToolResult::json(&json!({
        "name": entry.fq_name,
        "inputSchema": entry.metadata.input_schema,
    })))
}

/// Indirection so the mutual recursion through `dispatch_tool` has a boxed
/// future to bottom out on.
fn bridge_dispatch<'a>(
    inner: &'a Arc<ProxyInner>,
    tool: String,
    arguments: Map<String, Value>,
) -> BoxFuture<'a, Result<Value, JsonRpcError>> {
    Box::pin(async move { inner.dispatch_tool(&tool, arguments).await })
}

async fn bridge_tool_request(
    inner: &Arc<ProxyInner>,
    arguments: Map<String, Value>,
) -> Result<Value, JsonRpcError> {
    let tool = required_str(&arguments, "tool")?;
    let bridged_arguments = match arguments.get("arguments") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(JsonRpcError::invalid_params("'arguments' must be an object"));
        }
    };

    bridge_dispatch(inner, tool, bridged_arguments).await
}

async fn load_toolset(
    inner: &Arc<ProxyInner>,
    arguments: Map<String, Value>,
) -> Result<CallToolResult, JsonRpcError> {
    let name = required_str(&arguments, "name")?;
    let members = inner
        .config()
        .toolsets
        .get(&name)
        .cloned()
        .ok_or_else(|| JsonRpcError::invalid_params(format!("unknown toolset: {name}")))?;

    let mut loaded = Vec::new();
    let mut missing = Vec::new();
    let mut changed = false;
    {
        let mut registry = inner.registry().write().await;
        for member in &members {
            if registry.get(member).is_some() {
                changed |= registry.enable_dynamic(member);
                loaded.push(member.clone());
            } else {
                missing.push(member.clone());
            }
        }
    }

    if changed {
        inner.schedule_list_changed();
    }

    Ok(CallToolResult::json(&json!({
        "toolset": name,
        "loaded": loaded,
        "missing": missing,
    })))
}

async fn search_registry(
    inner: &Arc<ProxyInner>,
    arguments: Map<String, Value>,
) -> Result<CallToolResult, JsonRpcError> {
    let query = required_str(&arguments, "query")?;
    let client = inner
        .registry_client()
        .ok_or_else(|| JsonRpcError::internal("registry service not configured"))?;
    let result = client
        .search_tools(&query)
        .await
        .map_err(|err| JsonRpcError::internal(err.to_string()))?;
    Ok(CallToolResult::json(&result))
}

async fn server_install_info(
    inner: &Arc<ProxyInner>,
    arguments: Map<String, Value>,
) -> Result<CallToolResult, JsonRpcError> {
    let server = required_str(&arguments, "server")?;
    let client = inner
        .registry_client()
        .ok_or_else(|| JsonRpcError::internal("registry service not configured"))?;
    let result = client
        .install_info(&server)
        .await
        .map_err(|err| JsonRpcError::internal(err.to_string()))?;
    Ok(CallToolResult::json(&result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRegistry;
    use crate::server::ProxyServer;
    use manifold_types::ToolContent;

    fn server_with_tools() -> ProxyServer {
        let config = serde_json::from_str(
            r#"{
                "toolsets": {"files": ["a__read_file", "a__write_file"]},
                "exposeTools": ["none_match"]
            }"#,
        )
        .unwrap();
        let server = ProxyServer::new(config, CommandRegistry::new()).unwrap();
        server
    }

    async fn seed_registry(server: &ProxyServer) {
        let mut registry = server.inner().registry().write().await;
        registry.register_upstream_tools(
            "a",
            vec![
                ToolMetadata::new("read_file", "Read a file from disk"),
                ToolMetadata::new("write_file", "Write a file to disk"),
                ToolMetadata::new("fetch_url", "Fetch a remote URL"),
            ],
        );
    }

    fn result_json(result: &Value) -> Value {
        let parsed: CallToolResult = serde_json::from_value(result.clone()).unwrap();
        let ToolContent::Text { text } = &parsed.content[0];
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn discover_ranks_by_matched_words() {
        let server = server_with_tools();
        seed_registry(&server).await;

        let mut args = Map::new();
        args.insert("words".into(), json!("file read"));
        let result = dispatch(server.inner(), DISCOVER_TOOLS, args).await.unwrap();
        let value = result_json(&result);
        let tools = value["tools"].as_array().unwrap();

        // read_file matches both words; write_file matches one.
        assert_eq!(tools[0]["name"], json!("a__read_file"));
        assert_eq!(tools[0]["score"], json!(2));
        assert!(tools.iter().any(|t| t["name"] == json!("a__write_file")));
        assert!(!tools.iter().any(|t| t["name"] == json!("a__fetch_url")));
    }

    #[tokio::test]
    async fn discover_with_enable_exposes_matches() {
        let server = server_with_tools();
        seed_registry(&server).await;

        // The exposure filter matches nothing, so nothing is visible.
        assert!(server.inner().registry().read().await.exposed_tools().iter().all(|t| !t.name.starts_with("a__")));

        let mut args = Map::new();
        args.insert("words".into(), json!("file"));
        args.insert("enable".into(), json!(true));
        dispatch(server.inner(), DISCOVER_TOOLS, args).await.unwrap();

        let exposed = server.inner().registry().read().await.exposed_tools();
        assert!(exposed.iter().any(|t| t.name == "a__read_file"));
        assert!(exposed.iter().any(|t| t.name == "a__write_file"));
        assert!(!exposed.iter().any(|t| t.name == "a__fetch_url"));
    }

    #[tokio::test]
    async fn get_tool_schema_returns_input_schema() {
        let server = server_with_tools();
        seed_registry(&server).await;

        let mut args = Map::new();
        args.insert("name".into(), json!("a__read_file"));
        let result = dispatch(server.inner(), GET_TOOL_SCHEMA, args).await.unwrap();
        let value = result_json(&result);
        assert_eq!(value["name"], json!("a__read_file"));
        assert_eq!(value["inputSchema"]["type"], json!("object"));
    }

    #[tokio::test]
    async fn get_tool_schema_unknown_name_errors() {
        let server = server_with_tools();
        let mut args = Map::new();
        args.insert("name".into(), json!("nope"));
        let err = dispatch(server.inner(), GET_TOOL_SCHEMA, args).await.unwrap_err();
        assert_eq!(err.code, manifold_types::jsonrpc::TOOL_NOT_FOUND);
    }

    #[tokio::test]
    async fn load_toolset_enables_members_and_reports_missing() {
        let server = server_with_tools();
        seed_registry(&server).await;
        // write_file exists; make the toolset reference one missing member.
        let mut args = Map::new();
        args.insert("name".into(), json!("files"));
        let result = dispatch(server.inner(), LOAD_TOOLSET, args).await.unwrap();
        let value = result_json(&result);

        assert_eq!(value["loaded"], json!(["a__read_file", "a__write_file"]));
        assert_eq!(value["missing"], json!([]));

        let exposed = server.inner().registry().read().await.exposed_tools();
        assert!(exposed.iter().any(|t| t.name == "a__read_file"));
    }

    #[tokio::test]
    async fn load_toolset_unknown_name_errors() {
        let server = server_with_tools();
        let mut args = Map::new();
        args.insert("name".into(), json!("ghost"));
        let err = dispatch(server.inner(), LOAD_TOOLSET, args).await.unwrap_err();
        assert_eq!(err.code, manifold_types::jsonrpc::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn bridge_dispatches_like_tools_call() {
        let server = server_with_tools();
        seed_registry(&server).await;

        // Bridge to a core tool: get_tool_schema.
        let mut args = Map::new();
        args.insert("tool".into(), json!("get_tool_schema"));
        args.insert("arguments".into(), json!({"name": "a__read_file"}));
        let result = dispatch(server.inner(), BRIDGE_TOOL_REQUEST, args).await.unwrap();
        let value = result_json(&result);
        assert_eq!(value["name"], json!("a__read_file"));
    }

    #[tokio::test]
    async fn registry_tools_absent_without_configuration() {
        let server = server_with_tools();
        let registry = server.inner().registry().read().await;
        assert!(registry.get(SEARCH_REGISTRY).is_none());
        assert!(registry.get(SERVER_INSTALL_INFO).is_none());
    }

    #[test]
    fn expose_core_tools_filters_mounting() {
        let config: crate::config::ProxyConfig =
            serde_json::from_str(r#"{"exposeCoreTools": ["get_tool_schema"]}"#).unwrap();
        let mounted = mounted_tools(&config, false);
        assert_eq!(mounted.len(), 1);
        assert_eq!(mounted[0].name, GET_TOOL_SCHEMA);
    }
}
