//! Data models for the proxy configuration.

use crate::reconnect::ReconnectSettings;
use indexmap::IndexMap;
use manifold_types::env::{EnvVar, deserialize_env_vars};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Top-level proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Upstream servers, normalized to a named list. The file may use either
    /// an array of named entries or a map whose keys become names.
    #[serde(default, deserialize_with = "deserialize_servers")]
    pub servers: Vec<UpstreamConfig>,

    /// Glob patterns of fully-qualified names to expose. Empty = expose all
    /// discovered tools not hidden.
    #[serde(default)]
    pub expose_tools: Vec<String>,

    /// Glob patterns of fully-qualified names to hide.
    #[serde(default)]
    pub hide_tools: Vec<String>,

    /// Glob patterns exposed regardless of `expose_tools`.
    #[serde(default)]
    pub always_visible_tools: Vec<String>,

    /// Core tools to mount. Omitted = all; empty list = none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose_core_tools: Option<Vec<String>>,

    /// Named groups of fully-qualified tool names for `load_toolset`.
    #[serde(default)]
    pub toolsets: IndexMap<String, Vec<String>>,

    /// Allow dispatch by unprefixed tool name when unambiguous.
    #[serde(default)]
    pub allow_short_tool_names: bool,

    /// Plug-in command settings.
    #[serde(default)]
    pub commands: CommandSettings,

    /// Reconnection policy applied to upstreams without a per-transport
    /// override.
    #[serde(default)]
    pub auto_reconnect: AutoReconnectSettings,

    /// Default timeout for requests sent to upstreams, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// External tool-registry service consulted by the optional registry
    /// core tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistrySettings>,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            expose_tools: Vec::new(),
            hide_tools: Vec::new(),
            always_visible_tools: Vec::new(),
            expose_core_tools: None,
            toolsets: IndexMap::new(),
            allow_short_tool_names: false,
            commands: CommandSettings::default(),
            auto_reconnect: AutoReconnectSettings::default(),
            request_timeout_ms: default_request_timeout_ms(),
            registry: None,
        }
    }
}

/// Configuration for a single upstream server.
///
/// Exactly one of `command` (stdio spawn) or `transport` (network) must be
/// present; validation enforces this.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// Logical name, unique within the proxy. Filled from the map key when
    /// the map form is used.
    #[serde(default)]
    pub name: String,

    /// Command to spawn for stdio transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments passed to the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    /// Environment overrides for the child process; merged over the parent
    /// environment, overrides winning.
    #[serde(
        default,
        deserialize_with = "deserialize_env_vars",
        skip_serializing_if = "Option::is_none"
    )]
    pub env: Option<Vec<EnvVar>>,

    /// Network transport specification for remote servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<NetworkTransportConfig>,

    /// Optional authorization configuration for network transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSettings>,

    /// Whether this upstream is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
}

impl UpstreamConfig {
    /// Check if this upstream is configured for stdio transport.
    pub fn is_stdio(&self) -> bool {
        self.command.is_some()
    }

    /// Check if this upstream is configured for a network transport.
    pub fn is_network(&self) -> bool {
        self.transport.is_some()
    }

    /// Check if this upstream is disabled.
    pub fn is_disabled(&self) -> bool {
        self.disabled.unwrap_or(false)
    }
}

/// Network transport specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkTransportConfig {
    /// Wire protocol to the upstream.
    pub kind: TransportKind,

    /// Endpoint URL.
    pub url: Url,

    /// Per-upstream request timeout override, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// WebSocket keepalive ping interval, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_interval_ms: Option<u64>,

    /// Per-upstream reconnection override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<AutoReconnectSettings>,
}

/// Wire protocol of a network upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    #[serde(rename = "ws")]
    Ws,
    #[serde(rename = "sse")]
    Sse,
    #[serde(rename = "streamable-http")]
    StreamableHttp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Ws => write!(f, "ws"),
            TransportKind::Sse => write!(f, "sse"),
            TransportKind::StreamableHttp => write!(f, "streamable-http"),
        }
    }
}

/// Authorization configuration for network upstreams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSettings {
    /// Authorization scheme.
    pub scheme: AuthScheme,
    /// Bearer token (supports `${env:NAME}` interpolation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Basic-auth username (supports interpolation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Basic-auth password (supports interpolation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Custom header name; defaults to `Authorization`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
}

/// Supported authorization schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    Bearer,
    Basic,
}

/// Plug-in command settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CommandSettings {
    /// Whether plug-in commands are mounted at all.
    #[serde(default)]
    pub enabled: bool,
    /// Names of commands to mount. Omitted = all compiled-in commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<String>>,
}

impl CommandSettings {
    /// Whether a compiled-in command with this name should be mounted.
    pub fn allows(&self, name: &str) -> bool {
        self.enabled
            && match &self.list {
                Some(list) => list.iter().any(|n| n == name),
                None => true,
            }
    }
}

/// Reconnection policy as it appears in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoReconnectSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_true() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    10
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.25
}

impl Default for AutoReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl AutoReconnectSettings {
    /// Convert to the controller-level settings. A disabled policy becomes a
    /// zero-attempt policy: any failure is terminal.
    pub fn to_reconnect_settings(&self) -> ReconnectSettings {
        ReconnectSettings {
            max_attempts: if self.enabled { self.max_attempts } else { 0 },
            initial_delay_ms: self.initial_delay_ms,
            max_delay_ms: self.max_delay_ms,
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

/// External tool-registry service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySettings {
    /// Base URL of the registry HTTP service.
    pub base_url: Url,
    /// How long cached registry responses stay fresh, in milliseconds.
    #[serde(default = "default_registry_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

fn default_registry_cache_ttl_ms() -> u64 {
    60_000
}

/// Deserialize upstream servers supporting both list and map forms; map keys
/// become names.
fn deserialize_servers<'de, D>(deserializer: D) -> Result<Vec<UpstreamConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawServers {
        List(Vec<UpstreamConfig>),
        Map(IndexMap<String, UpstreamConfig>),
    }

    match RawServers::deserialize(deserializer)? {
        RawServers::List(list) => Ok(list),
        RawServers::Map(map) => Ok(map
            .into_iter()
            .map(|(name, mut server)| {
                server.name = name;
                server
            })
            .collect()),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Interpolation error: {0}")]
    Interpolation(#[from] crate::config::InterpolationError),

    #[error("Validation error: {0}")]
    Validation(#[from] crate::config::ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servers_accept_list_form() {
        let json = r#"{
          "servers": [
            {"name": "files", "command": "npx", "args": ["@mcp/files"]},
            {"name": "remote", "transport": {"kind": "ws", "url": "wss://mcp.example.com/ws"}}
          ]
        }"#;
        let cfg: ProxyConfig = serde_json::from_str(json).expect("config deserializes");
        assert_eq!(cfg.servers.len(), 2);
        assert!(cfg.servers[0].is_stdio());
        assert!(cfg.servers[1].is_network());
        assert_eq!(cfg.servers[1].transport.as_ref().unwrap().kind, TransportKind::Ws);
    }

    #[test]
    fn servers_accept_map_form_keys_become_names() {
        let json = r#"{
          "servers": {
            "files": {"command": "npx", "args": ["@mcp/files"], "env": {"FOO": "bar"}},
            "events": {"transport": {"kind": "sse", "url": "https://mcp.example.com/events"}}
          }
        }"#;
        let cfg: ProxyConfig = serde_json::from_str(json).expect("config deserializes");
        let names: Vec<&str> = cfg.servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["files", "events"]);
        assert_eq!(
            cfg.servers[0].env.as_ref().unwrap()[0],
            EnvVar::new("FOO", "bar")
        );
    }

    #[test]
    fn reconnect_defaults_match_policy() {
        let cfg: ProxyConfig = serde_json::from_str("{}").unwrap();
        let settings = cfg.auto_reconnect.to_reconnect_settings();
        assert_eq!(settings.max_attempts, 10);
        assert_eq!(settings.initial_delay_ms, 1_000);
        assert_eq!(settings.max_delay_ms, 60_000);
        assert_eq!(settings.backoff_multiplier, 2.0);
        assert_eq!(settings.jitter, 0.25);
    }

    #[test]
    fn disabled_reconnect_means_zero_attempts() {
        let json = r#"{"autoReconnect": {"enabled": false}}"#;
        let cfg: ProxyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.auto_reconnect.to_reconnect_settings().max_attempts, 0);
    }

    #[test]
    fn expose_core_tools_distinguishes_omitted_from_empty() {
        let omitted: ProxyConfig = serde_json::from_str("{}").unwrap();
        assert!(omitted.expose_core_tools.is_none());

        let empty: ProxyConfig = serde_json::from_str(r#"{"exposeCoreTools": []}"#).unwrap();
        assert_eq!(empty.expose_core_tools.as_deref(), Some(&[][..]));
    }

    #[test]
    fn commands_list_filters_mounting() {
        let cfg: ProxyConfig =
            serde_json::from_str(r#"{"commands": {"enabled": true, "list": ["debugger"]}}"#)
                .unwrap();
        assert!(cfg.commands.allows("debugger"));
        assert!(!cfg.commands.allows("installer"));

        let disabled: ProxyConfig = serde_json::from_str("{}").unwrap();
        assert!(!disabled.commands.allows("debugger"));
    }
}
