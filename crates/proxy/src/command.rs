//! Plug-in command surface.
//!
//! A command is a bundle of tools served in-process by the proxy rather
//! than routed upstream. Commands are compiled in, gated by configuration,
//! and mounted into the registry under `<command>__<tool>`.

use manifold_types::{CallToolResult, ToolMetadata};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A mounted plug-in command.
#[async_trait::async_trait]
pub trait CommandModule: Send + Sync {
    /// The mount prefix for this command's tools.
    fn name(&self) -> &str;

    /// One-line human description, shown by `manifold commands list`.
    fn describe(&self) -> &str;

    /// The tools this command serves, under their unprefixed names.
    fn tools(&self) -> Vec<ToolMetadata>;

    /// Invoke one of this command's tools by unprefixed name.
    async fn call_tool(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, CommandError>;
}

/// Errors surfaced by command tool invocations.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("invalid arguments: {message}")]
    InvalidArguments { message: String },

    #[error("{message}")]
    Failed { message: String },
}

impl CommandError {
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments { message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed { message: message.into() }
    }
}

/// The set of mounted commands, keyed by name.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn CommandModule>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&mut self, command: Arc<dyn CommandModule>) {
        self.commands.insert(command.name().to_string(), command);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CommandModule>> {
        self.commands.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// (name, description) of every mounted command, sorted by name.
    pub fn describe_all(&self) -> Vec<(String, String)> {
        let mut list: Vec<(String, String)> = self
            .commands
            .values()
            .map(|c| (c.name().to_string(), c.describe().to_string()))
            .collect();
        list.sort();
        list
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn CommandModule>> {
        self.commands.values()
    }
}
