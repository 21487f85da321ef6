use std::path::PathBuf;

use anyhow::Context;
use args::{Args, Command};
use clap::Parser;
use tokio_util::sync::CancellationToken;

mod args;
mod logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Start {
            config,
            port,
            host,
            debug,
        } => start(config, port, host, debug).await,
        Command::Stop { port, force } => stop(port, force).await,
        Command::Status { port, detailed } => status(port, detailed).await,
    }
}

async fn start(config_path: PathBuf, port: Option<u16>, host: Option<String>, debug: bool) -> anyhow::Result<()> {
    logger::init(debug);

    let mut config = config::Config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    config.validate()?;

    let address = format!("{}:{}", config.server.host, config.server.port);
    let shutdown = CancellationToken::new();

    let router = gateway::router(config, shutdown.clone())?;

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;

    log::info!("rcc {} listening on {address}", env!("CARGO_PKG_VERSION"));

    let drain = {
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::signal::ctrl_c() => {
                    log::info!("interrupt received, shutting down");
                }
            }
        }
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(drain)
        .await
        .context("server error")?;

    log::info!("rcc stopped");
    Ok(())
}

async fn stop(port: u16, force: bool) -> anyhow::Result<()> {
    let url = format!("http://127.0.0.1:{port}/shutdown");

    match reqwest::Client::new().post(&url).send().await {
        Ok(response) if response.status().is_success() => {
            println!("gateway on port {port} is shutting down");
            Ok(())
        }
        Ok(response) => anyhow::bail!("gateway refused shutdown: {}", response.status()),
        Err(e) if force => {
            println!("gateway on port {port} unreachable ({e}), assuming stopped");
            Ok(())
        }
        Err(e) => Err(e).context(format!("could not reach gateway on port {port}")),
    }
}

async fn status(port: u16, detailed: bool) -> anyhow::Result<()> {
    let client = reqwest::Client::new();

    let status: serde_json::Value = client
        .get(format!("http://127.0.0.1:{port}/status"))
        .send()
        .await
        .with_context(|| format!("could not reach gateway on port {port}"))?
        .json()
        .await
        .context("status response did not parse")?;

    println!("{}", serde_json::to_string_pretty(&status)?);

    if detailed {
        let health: serde_json::Value = client
            .get(format!("http://127.0.0.1:{port}/health"))
            .send()
            .await?
            .json()
            .await?;

        println!("{}", serde_json::to_string_pretty(&health)?);
    }

    Ok(())
}
