//! The `debugger` plug-in command: the session API as MCP tools.
//!
//! Mounted by the proxy under `debugger__<tool>`. Lines are 1-based at this
//! boundary; timeouts are milliseconds.

use crate::manager::SessionManager;
use crate::session::SessionError;
use manifold_proxy::command::{CommandError, CommandModule};
use manifold_types::{CallToolResult, ToolMetadata};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CONSOLE_LIMIT: usize = 100;

/// CDP debug sessions exposed as proxy tools.
pub struct DebuggerCommand {
    manager: Arc<SessionManager>,
}

impl DebuggerCommand {
    /// Command backed by the process-wide session manager.
    pub fn new() -> Self {
        Self {
            manager: SessionManager::global(),
        }
    }

    /// Command backed by a private manager; used by tests.
    pub fn with_manager(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

impl Default for DebuggerCommand {
    fn default() -> Self {
        Self::new()
    }
}

fn required_str(arguments: &Map<String, Value>, key: &str) -> Result<String, CommandError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CommandError::invalid_arguments(format!("missing '{key}'")))
}

fn session_id(arguments: &Map<String, Value>) -> Result<String, CommandError> {
    required_str(arguments, "sessionId")
}

fn to_command_error(err: SessionError) -> CommandError {
    match err {
        SessionError::NotFound { .. } | SessionError::BreakpointNotFound { .. } => {
            CommandError::invalid_arguments(err.to_string())
        }
        other => CommandError::failed(other.to_string()),
    }
}

fn json_result<T: serde::Serialize>(value: &T) -> Result<CallToolResult, CommandError> {
    let value = serde_json::to_value(value)
        .map_err(|err| CommandError::failed(format!("failed to encode result: {err}")))?;
    Ok(CallToolResult::json(&value))
}

#[async_trait::async_trait]
impl CommandModule for DebuggerCommand {
    fn name(&self) -> &str {
        "debugger"
    }

    fn describe(&self) -> &str {
        "Interactive debugging of Node.js and browser targets over the Chrome DevTools Protocol"
    }

    fn tools(&self) -> Vec<ToolMetadata> {
        let session_only = json!({
            "type": "object",
            "properties": {
                "sessionId": { "type": "string" }
            },
            "required": ["sessionId"]
        });

        vec![
            ToolMetadata::new(
                "create_session",
                "Attach to a debug target's inspector WebSocket endpoint",
            )
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "wsUrl": {
                        "type": "string",
                        "description": "Inspector endpoint, e.g. ws://127.0.0.1:9229/<id>"
                    }
                },
                "required": ["wsUrl"]
            })),
            ToolMetadata::new("list_sessions", "List debug sessions, including terminated ones"),
            ToolMetadata::new(
                "set_breakpoint",
                "Set a breakpoint by file and 1-based line, optionally conditional",
            )
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "sessionId": { "type": "string" },
                    "file": { "type": "string" },
                    "line": { "type": "number" },
                    "condition": { "type": "string" }
                },
                "required": ["sessionId", "file", "line"]
            })),
            ToolMetadata::new("remove_breakpoint", "Remove a breakpoint by id").with_schema(json!({
                "type": "object",
                "properties": {
                    "sessionId": { "type": "string" },
                    "breakpointId": { "type": "string" }
                },
                "required": ["sessionId", "breakpointId"]
            })),
            ToolMetadata::new("list_breakpoints", "List a session's breakpoints")
                .with_schema(session_only.clone()),
            ToolMetadata::new("continue", "Resume execution").with_schema(session_only.clone()),
            ToolMetadata::new("pause", "Request a pause").with_schema(session_only.clone()),
            ToolMetadata::new("step_over", "Step over the current statement")
                .with_schema(session_only.clone()),
            ToolMetadata::new(
                "evaluate",
                "Evaluate an expression in the paused frame, or globally while running",
            )
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "sessionId": { "type": "string" },
                    "expression": { "type": "string" }
                },
                "required": ["sessionId", "expression"]
            })),
            ToolMetadata::new("wait_for_pause", "Block until the target pauses").with_schema(
                json!({
                    "type": "object",
                    "properties": {
                        "sessionId": { "type": "string" },
                        "timeoutMs": { "type": "number" }
                    },
                    "required": ["sessionId"]
                }),
            ),
            ToolMetadata::new("get_console_output", "Recent console output, oldest first")
                .with_schema(json!({
                    "type": "object",
                    "properties": {
                        "sessionId": { "type": "string" },
                        "limit": { "type": "number" }
                    },
                    "required": ["sessionId"]
                })),
            ToolMetadata::new(
                "terminate_session",
                "Terminate a session's target connection; the session stays queryable",
            )
            .with_schema(session_only.clone()),
            ToolMetadata::new("delete_session", "Terminate and forget a session")
                .with_schema(session_only),
        ]
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, CommandError> {
        match tool {
            "create_session" => {
                let ws_url = required_str(&arguments, "wsUrl")?;
                let id = self
                    .manager
                    .create(&ws_url)
                    .await
                    .map_err(to_command_error)?;
                json_result(&json!({ "sessionId": id }))
            }
            "list_sessions" => {
                let sessions = self.manager.list().await;
                json_result(&json!({ "sessions": sessions }))
            }
            "set_breakpoint" => {
                let session = self
                    .manager
                    .get(&session_id(&arguments)?)
                    .await
                    .map_err(to_command_error)?;
                let file = required_str(&arguments, "file")?;
                let line = arguments
                    .get("line")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| CommandError::invalid_arguments("missing 'line'"))?
                    as u32;
                let condition = arguments
                    .get("condition")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let breakpoint = session
                    .set_breakpoint(&file, line, condition)
                    .await
                    .map_err(to_command_error)?;
                json_result(&breakpoint)
            }
            "remove_breakpoint" => {
                let session = self
                    .manager
                    .get(&session_id(&arguments)?)
                    .await
                    .map_err(to_command_error)?;
                let breakpoint_id = required_str(&arguments, "breakpointId")?;
                session
                    .remove_breakpoint(&breakpoint_id)
                    .await
                    .map_err(to_command_error)?;
                json_result(&json!({ "removed": breakpoint_id }))
            }
            "list_breakpoints" => {
                let session = self
                    .manager
                    .get(&session_id(&arguments)?)
                    .await
                    .map_err(to_command_error)?;
                json_result(&json!({ "breakpoints": session.list_breakpoints().await }))
            }
            "continue" => {
                let session = self
                    .manager
                    .get(&session_id(&arguments)?)
                    .await
                    .map_err(to_command_error)?;
                session.resume().await.map_err(to_command_error)?;
                json_result(&json!({ "execution": session.execution() }))
            }
            "pause" => {
                let session = self
                    .manager
                    .get(&session_id(&arguments)?)
                    .await
                    .map_err(to_command_error)?;
                session.pause().await.map_err(to_command_error)?;
                json_result(&json!({ "requested": true }))
            }
            "step_over" => {
                let session = self
                    .manager
                    .get(&session_id(&arguments)?)
                    .await
                    .map_err(to_command_error)?;
                session.step_over().await.map_err(to_command_error)?;
                json_result(&json!({ "stepped": true }))
            }
            "evaluate" => {
                let session = self
                    .manager
                    .get(&session_id(&arguments)?)
                    .await
                    .map_err(to_command_error)?;
                let expression = required_str(&arguments, "expression")?;
                let result = session
                    .evaluate(&expression)
                    .await
                    .map_err(to_command_error)?;
                json_result(&json!({ "result": result }))
            }
            "wait_for_pause" => {
                let id = session_id(&arguments)?;
                let timeout_ms = arguments
                    .get("timeoutMs")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
                let snapshot = self
                    .manager
                    .wait_for_pause(&id, Duration::from_millis(timeout_ms))
                    .await
                    .map_err(to_command_error)?;
                json_result(&snapshot)
            }
            "get_console_output" => {
                let session = self
                    .manager
                    .get(&session_id(&arguments)?)
                    .await
                    .map_err(to_command_error)?;
                let limit = arguments
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(DEFAULT_CONSOLE_LIMIT);
                json_result(&json!({ "entries": session.console_output(limit) }))
            }
            "terminate_session" => {
                let session = self
                    .manager
                    .get(&session_id(&arguments)?)
                    .await
                    .map_err(to_command_error)?;
                session.terminate().await;
                json_result(&json!({ "state": session.state() }))
            }
            "delete_session" => {
                let id = session_id(&arguments)?;
                self.manager.delete(&id).await.map_err(to_command_error)?;
                json_result(&json!({ "deleted": id }))
            }
            other => Err(CommandError::UnknownTool { name: other.to_string() }),
        }
    }
}
