//! Switchyard CLI: one MCP endpoint in front of many child tool servers.

use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use switchyard_config::{CliOverrides, SwitchyardConfig};
use switchyard_mux::{ChildState, Gateway};

#[derive(Parser)]
#[command(
    name = "switchyard",
    version,
    about = "Multiplex several MCP tool servers behind one stdio endpoint"
)]
struct Cli {
    /// Config file (overrides SWITCHYARD_CONFIG and the default locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Timeout for a single tool call, in milliseconds
    #[arg(long)]
    call_timeout_ms: Option<u64>,

    /// Print the aggregated tool catalog as JSON and exit
    #[arg(long)]
    list_tools: bool,

    /// Enable verbose/debug logging
    #[arg(long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the protocol.
    let log_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = SwitchyardConfig::load(CliOverrides {
        config_path: cli.config,
        call_timeout_ms: cli.call_timeout_ms,
    })
    .context("Failed to load configuration")?;
    match &config.source {
        Some(path) => tracing::info!("Loaded configuration from {}", path.display()),
        None => tracing::info!("Running with default configuration"),
    }

    let handshake_timeout = config.settings.handshake_timeout();
    let gateway = Gateway::start(config.children, config.settings).await;

    if cli.list_tools {
        return print_catalog(&gateway, handshake_timeout).await;
    }

    tokio::spawn(report_startup(gateway.clone(), handshake_timeout));

    let mut server = tokio::spawn(switchyard_server::serve(
        gateway.clone(),
        tokio::io::stdin(),
        tokio::io::stdout(),
    ));
    let served = tokio::select! {
        () = shutdown_signal() => None,
        result = &mut server => Some(result),
    };
    if served.is_some() {
        tracing::info!("Input closed, shutting down");
    }

    gateway.shutdown().await;
    let result = match served {
        Some(result) => result,
        None => server.await,
    };
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Front server stopped with error: {e}"),
        Err(e) => tracing::warn!("Front server task failed: {e}"),
    }

    // A blocking stdin read cannot be cancelled and would hold the runtime open.
    std::process::exit(0);
}

/// Wait for the children to settle, then print `{tools: [...]}` to stdout.
async fn print_catalog(gateway: &Gateway, handshake_timeout: Duration) -> Result<()> {
    gateway
        .wait_for_children(ChildState::Ready, handshake_timeout)
        .await;
    let entries = gateway.list_tools().await;
    let tools: Vec<_> = entries.iter().map(|e| e.to_catalog_tool()).collect();
    let catalog = serde_json::json!({ "tools": tools });
    println!(
        "{}",
        serde_json::to_string_pretty(&catalog).context("Failed to serialize catalog")?
    );
    gateway.shutdown().await;
    Ok(())
}

/// Log a one-time summary once every child is ready or the handshake window passed.
async fn report_startup(gateway: Gateway, handshake_timeout: Duration) {
    let all_ready = gateway
        .wait_for_children(ChildState::Ready, handshake_timeout)
        .await;
    let children = gateway.children().await;
    if !all_ready {
        for child in children.iter().filter(|c| c.state != ChildState::Ready) {
            tracing::warn!(
                "Child '{}' is {} and contributes no tools",
                child.name,
                child.state.as_str()
            );
        }
    }
    let ready = children
        .iter()
        .filter(|c| c.state == ChildState::Ready)
        .count();
    tracing::info!(
        "Gateway ready: {} tools from {ready}/{} children",
        gateway.list_tools().await.len(),
        children.len()
    );
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("Shutdown signal received, stopping children");
}
