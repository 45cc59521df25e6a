use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use serde_json::{Value, json};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod cli;

use cli::Cli;
use cli::commands::Commands;
use toolmux::config::Config;
use toolmux::host::{FnHandler, MemorySurface, ToolHost, register_ui_tools};
use toolmux::ipc::{ToolDefinition, ToolResult};
use toolmux::service::{Service, ServiceRole};

fn setup_logging(default_level: Option<&str>) -> Result<()> {
    // Stdout carries the agent protocol, so logs go to a file
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("toolmux")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("toolmux.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let env = env_logger::Env::default().default_filter_or(default_level.unwrap_or("info"));
    env_logger::Builder::from_env(env)
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            token.cancel();
        }
    });
}

async fn run_application(cli: &Cli, config: Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        eprintln!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Serve {
            bind,
            max_connections,
            timeout_ms,
        } => {
            let config = config.with_overrides(bind.clone(), *max_connections, *timeout_ms);
            config.validate()?;
            handle_serve_command(&config, cli.is_verbose()).await
        }
        Commands::Demo { name, router } => handle_demo_command(name, router.as_deref(), &config).await,
    }
}

async fn handle_serve_command(config: &Config, verbose: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let service = Service::start(config, shutdown.clone())
        .await
        .context("Failed to start router")?;

    if verbose {
        match service.role() {
            ServiceRole::Primary(addr) => eprintln!("{} listening on {}", "Router:".green(), addr),
            ServiceRole::Relay(addr) => eprintln!("{} relaying to {}", "Router:".cyan(), addr),
        }
    }

    let summary = service
        .serve_agent(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("Agent session failed")?;
    info!("Agent session finished: {:?}", summary);

    service.shutdown().await.context("Failed to shut down router")?;
    Ok(())
}

async fn handle_demo_command(name: &str, router: Option<&str>, config: &Config) -> Result<()> {
    let address = router.unwrap_or_else(|| config.router_address()).to_string();
    let host = ToolHost::new(name).with_secret(config.host.shared_secret.clone());

    register_ui_tools(&host, Arc::new(MemorySurface::demo(name)));
    host.register_tool(
        ToolDefinition::new("echo", "Return the arguments unchanged").with_schema(json!({
            "type": "object",
            "additionalProperties": true
        })),
        FnHandler::new(|params: Value| async move { ToolResult::success(params) }),
    );

    eprintln!(
        "{} '{}' serving {} tools via {}",
        "Demo:".green(),
        name,
        host.tool_count(),
        address
    );

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    Arc::new(host)
        .run(
            &address,
            Duration::from_millis(config.host.reconnect_delay_ms),
            shutdown,
        )
        .await;
    Ok(())
}

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(config.log_level.as_deref()).context("Failed to setup logging")?;
    info!("Starting with config from: {:?}", cli.config);

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let result = runtime.block_on(run_application(&cli, config));
    // A stdin read blocked on its thread would otherwise hold up exit
    runtime.shutdown_timeout(Duration::from_millis(250));

    result.context("Application failed")
}
