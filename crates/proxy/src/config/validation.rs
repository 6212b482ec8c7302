//! Configuration validation for the proxy.

use crate::config::{ProxyConfig, TransportKind, UpstreamConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9._-]+$").expect("name pattern compiles"));

/// Validate the entire configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for server in &config.servers {
        validate_server_name(&server.name)?;
        if !seen.insert(server.name.clone()) {
            return Err(ValidationError::DuplicateServerName { name: server.name.clone() });
        }
        validate_server(server)?;
        debug!("validated upstream configuration: {}", server.name);
    }

    for (toolset, members) in &config.toolsets {
        for member in members {
            if !member.contains("__") {
                return Err(ValidationError::InvalidToolsetMember {
                    toolset: toolset.clone(),
                    member: member.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Validate an upstream server name.
pub fn validate_server_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::InvalidServerName {
            name: name.to_string(),
            reason: "name cannot be empty (array-form entries must carry a 'name' field)"
                .to_string(),
        });
    }

    if !NAME_PATTERN.is_match(name) {
        return Err(ValidationError::InvalidServerName {
            name: name.to_string(),
            reason: "name must contain only lowercase letters, numbers, dots, underscores, and hyphens"
                .to_string(),
        });
    }

    Ok(())
}

/// Validate a single upstream configuration.
pub fn validate_server(server: &UpstreamConfig) -> Result<(), ValidationError> {
    match (server.is_stdio(), server.is_network()) {
        (true, true) => Err(ValidationError::AmbiguousTransport { name: server.name.clone() }),
        (false, false) => Err(ValidationError::MissingTransport { name: server.name.clone() }),
        (true, false) => Ok(()),
        (false, true) => validate_network_server(server),
    }
}

fn validate_network_server(server: &UpstreamConfig) -> Result<(), ValidationError> {
    let transport = server
        .transport
        .as_ref()
        .expect("network server has a transport spec");

    let scheme = transport.url.scheme();
    let scheme_ok = match transport.kind {
        TransportKind::Ws => matches!(scheme, "ws" | "wss"),
        TransportKind::Sse | TransportKind::StreamableHttp => matches!(scheme, "http" | "https"),
    };
    if !scheme_ok {
        return Err(ValidationError::SchemeMismatch {
            name: server.name.clone(),
            kind: transport.kind.to_string(),
            scheme: scheme.to_string(),
        });
    }

    Ok(())
}

/// Errors that can occur during validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid server name '{name}': {reason}")]
    InvalidServerName { name: String, reason: String },

    #[error("Duplicate server name: {name}")]
    DuplicateServerName { name: String },

    #[error("Upstream '{name}' must have either 'command' (stdio) or 'transport' (network)")]
    MissingTransport { name: String },

    #[error("Upstream '{name}' has both 'command' and 'transport'; exactly one is allowed")]
    AmbiguousTransport { name: String },

    #[error("Upstream '{name}': transport kind '{kind}' does not accept URL scheme '{scheme}'")]
    SchemeMismatch { name: String, kind: String, scheme: String },

    #[error("Toolset '{toolset}' member '{member}' is not a fully-qualified tool name")]
    InvalidToolsetMember { toolset: String, member: String },

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}
