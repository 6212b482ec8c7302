//! Metadata describing tools and tool-call results.
//!
//! Upstream servers return tool descriptions via the `tools/list` RPC. This
//! module keeps them in a serde-friendly shape that the registry, the core
//! tools, and plug-in commands can share without caring which transport the
//! description arrived on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Captures the essential metadata for an MCP tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMetadata {
    /// Tool identifier returned by the MCP server.
    pub name: String,
    /// Optional human-friendly title supplied by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Optional description explaining the tool's behavior.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema describing the expected arguments for this tool.
    pub input_schema: Value,
    /// Optional JSON schema describing structured output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Serialized annotations published by the tool, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

impl ToolMetadata {
    /// Build metadata with an empty object schema, the common case for
    /// argument-free tools.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            description: Some(description.into()),
            input_schema: json!({ "type": "object", "properties": {} }),
            output_schema: None,
            annotations: None,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Clone this metadata under a different (e.g. prefixed) name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.name = name.into();
        copy
    }
}

/// One block of tool output content.
///
/// Upstream results are forwarded verbatim as raw JSON and never re-encoded
/// through this type; only the proxy's own tools construct content, and they
/// only produce text blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToolContent {
    Text { text: String },
}

/// Result payload of a `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: None,
        }
    }

    /// Serialize a JSON payload as a single pretty-printed text block.
    pub fn json(value: &Value) -> Self {
        Self::text(serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()))
    }

    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: Some(true),
        }
    }
}

/// Identity advertised during the `initialize` handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Result of the `initialize` handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: Value,
    pub server_info: ServerInfo,
}

/// Parse the `tools` array out of a raw `tools/list` result payload.
/// Entries that do not deserialize are skipped.
pub fn parse_tool_list(result: &Value) -> Vec<ToolMetadata> {
    result
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| serde_json::from_value(t.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Build `tools/call` params in the MCP wire shape.
pub fn call_tool_params(name: &str, arguments: &Map<String, Value>) -> Value {
    json!({
        "name": name,
        "arguments": Value::Object(arguments.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_metadata_uses_mcp_field_names() {
        let meta = ToolMetadata::new("demo", "A demo tool")
            .with_schema(json!({"type": "object", "properties": {"n": {"type": "number"}}}));
        let value = serde_json::to_value(&meta).unwrap();
        assert!(value.get("inputSchema").is_some());
        assert!(value.get("input_schema").is_none());
    }

    #[test]
    fn parses_wire_tool_list() {
        let result = json!({
            "tools": [
                {"name": "x", "description": "first", "inputSchema": {"type": "object"}},
                {"name": "y", "inputSchema": {"type": "object"}}
            ]
        });
        let tools = parse_tool_list(&result);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "x");
        assert_eq!(tools[1].description, None);
    }

    #[test]
    fn text_result_shape() {
        let result = CallToolResult::text("ok");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][0]["text"], "ok");
        assert!(value.get("isError").is_none());
    }

    #[test]
    fn error_result_sets_flag() {
        let result = CallToolResult::error_text("boom");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["isError"], json!(true));
    }
}
