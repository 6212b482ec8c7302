use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use manifold_debug::DebuggerCommand;
use manifold_proxy::command::CommandRegistry;
use manifold_proxy::config::{self, ProxyConfig};
use manifold_proxy::logging::init_tracing;
use manifold_proxy::server::ProxyServer;
use tracing::info;

#[derive(Parser)]
#[command(name = "manifold", version, about = "MCP aggregating proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the proxy on stdio.
    Serve {
        /// Path to the configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Inspect compiled-in plug-in commands.
    Commands {
        #[command(subcommand)]
        action: CommandsAction,
    },
}

#[derive(Subcommand)]
enum CommandsAction {
    /// List plug-in commands and whether the configuration mounts them.
    List {
        /// Path to the configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    init_tracing("info");

    if let Err(err) = run().await {
        eprintln!("manifold: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::Commands { action: CommandsAction::List { config } } => list_commands(config).await,
    }
}

async fn load(config_path: Option<PathBuf>) -> Result<ProxyConfig> {
    match config_path {
        Some(path) => config::load_config_from_path(&path)
            .await
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => config::load_config()
            .await
            .context("failed to load config from the default location"),
    }
}

/// Mount the compiled-in plug-in commands the configuration enables.
fn mount_commands(config: &ProxyConfig) -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    if config.commands.allows("debugger") {
        registry.mount(Arc::new(DebuggerCommand::new()));
    }
    registry
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let config = load(config_path).await?;
    let commands = mount_commands(&config);

    let server = ProxyServer::new(config, commands).context("failed to build proxy")?;
    server.start_upstreams().await;

    let serve = server.run_stdio();
    tokio::select! {
        result = serve => {
            result.context("proxy terminated abnormally")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }

    Ok(())
}

async fn list_commands(config_path: Option<PathBuf>) -> Result<()> {
    let config = load(config_path).await.unwrap_or_default();

    // Every compiled-in command, mounted or not.
    let compiled: Vec<(&str, &str)> = vec![(
        "debugger",
        "Interactive debugging of Node.js and browser targets over the Chrome DevTools Protocol",
    )];

    for (name, description) in compiled {
        let mounted = if config.commands.allows(name) { "enabled" } else { "disabled" };
        println!("{name}  [{mounted}]  {description}");
    }
    Ok(())
}
