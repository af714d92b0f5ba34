//! opencode sidecar: launches `opencode serve` and answers JSON commands on
//! stdin/stdout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use opencode_sidecar::bridge::SidecarBridge;
use opencode_sidecar::cli::{self, Commands, ServeArgs};
use opencode_sidecar::client::{OpencodeApi, RetryingClient};
use opencode_sidecar::config::Config;
use opencode_sidecar::context::Context;
use opencode_sidecar::dispatch::{self, Dispatcher};
use opencode_sidecar::health::{self, HealthMonitor};
use opencode_sidecar::service;
use serde_json::Value;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

/// stdout carries protocol responses, so logs go to stderr.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = cli::Cli::parse();

    match cli
        .command
        .unwrap_or_else(|| Commands::Serve(ServeArgs::default()))
    {
        Commands::Serve(args) => serve(args).await?,
        Commands::Check { binary } => {
            let binary = binary.unwrap_or_else(|| Config::from_env().binary);
            let status = service::cli_status(&binary).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Send { cmd, args, sidecar } => {
            let args: Value = match args {
                Some(raw) => serde_json::from_str(&raw).context("ARGS_JSON is not valid JSON")?,
                None => Value::Null,
            };
            let path = match sidecar {
                Some(path) => path,
                None => std::env::current_exe().context("cannot locate this executable")?,
            };

            let bridge = SidecarBridge::spawn(&path, None)?;
            let result = bridge.send(&cmd, args).await;
            bridge.shutdown(Duration::from_secs(10)).await?;
            let data = result?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, args: &ServeArgs) {
    if let Some(binary) = &args.binary {
        config.binary = binary.clone();
    }
    if let Some(hostname) = &args.hostname {
        config.hostname = hostname.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(directory) = &args.directory {
        config.directory = Some(shellexpand::tilde(directory).to_string());
    }
    if let Some(ms) = args.launch_timeout_ms {
        config.launch_timeout = Duration::from_millis(ms);
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = Config::from_env();
    apply_overrides(&mut config, &args);

    let (base_url, service_handle) = match &args.url {
        Some(url) => (url.clone(), None),
        None => service::launch_or_fallback(&config).await,
    };

    let api = OpencodeApi::new(&base_url, config.request_timeout)?;
    let client = RetryingClient::new(api, config.retry);
    let launched = service_handle.is_some();
    if launched {
        match health::wait_until_healthy(&client, &config.startup_check).await {
            Ok(health) => tracing::info!(%health, "opencode is healthy"),
            Err(e) => tracing::warn!("opencode did not become healthy: {}", e),
        }
    }

    let monitor = HealthMonitor::spawn(client.clone(), config.health_interval);
    let ctx = Arc::new(Context::new(client, config.directory.clone(), launched));
    let dispatcher = Arc::new(Dispatcher::new(ctx));
    tracing::info!(url = %base_url, launched, "serving commands on stdin");

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    tokio::select! {
        res = dispatch::run(dispatcher, stdin, stdout) => {
            tracing::info!("stdin closed, shutting down");
            monitor.stop();
            if let Some(handle) = &service_handle {
                handle.terminate();
            }
            res?;
            Ok(())
        }
        signal = shutdown_signal() => {
            tracing::info!("received {}, shutting down", signal);
            monitor.stop();
            if let Some(handle) = &service_handle {
                handle.terminate();
            }
            // the blocking stdin reader would otherwise hold up runtime shutdown
            std::process::exit(0);
        }
    }
}

async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "ctrl-c",
                    _ = term.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                tracing::warn!("cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "ctrl-c"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}
