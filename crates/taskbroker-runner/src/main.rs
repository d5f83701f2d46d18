//! Task Broker Runner Daemon

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use taskbroker_core::RunnerId;

mod config;
mod connection;
mod executor;
mod runner;

use config::Config;
use connection::RunnerConnection;
use executor::EchoExecutor;

/// Task Broker runner: offers capacity to a broker and executes tasks.
#[derive(Parser, Debug)]
#[command(name = "taskbroker-runner", version, about)]
struct Args {
    /// Broker base URL
    #[arg(long, default_value = "ws://127.0.0.1:5679")]
    broker_url: String,

    /// Runner ID (generated if not set)
    #[arg(long)]
    id: Option<String>,

    /// Name reported to the broker
    #[arg(long, default_value = "taskbroker-runner")]
    name: String,

    /// Task type to offer (repeatable)
    #[arg(long = "task-type", default_value = "javascript")]
    task_types: Vec<String>,

    /// Maximum concurrent tasks
    #[arg(long, default_value = "5")]
    max_concurrency: usize,

    /// Nominal offer validity in milliseconds
    #[arg(long, default_value = "5000")]
    offer_valid_for_ms: u64,

    /// Timeout for data requests and RPC calls in seconds
    #[arg(long, default_value = "30")]
    rpc_timeout_secs: u64,

    /// Delay before reconnecting in seconds
    #[arg(long, default_value = "5")]
    reconnect_delay_secs: u64,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            broker_url: self.broker_url,
            runner_id: self.id.map(RunnerId::new).unwrap_or_else(RunnerId::generate),
            name: self.name,
            task_types: self.task_types,
            max_concurrency: self.max_concurrency,
            offer_valid_for_ms: self.offer_valid_for_ms,
            rpc_timeout_secs: self.rpc_timeout_secs,
            reconnect_delay_secs: self.reconnect_delay_secs,
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config = Arc::new(Args::parse().into_config());

    info!(
        runner_id = %config.runner_id,
        broker = %config.broker_url,
        task_types = ?config.task_types,
        "Starting task broker runner"
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        signal.cancel();
    });

    // Reconnection loop
    let connection = RunnerConnection::new(config.clone(), Arc::new(EchoExecutor));
    loop {
        match connection.connect_and_run(shutdown.clone()).await {
            Ok(()) => info!("Connection closed"),
            Err(e) => error!(error = %e, "Connection error"),
        }

        if shutdown.is_cancelled() {
            break;
        }

        info!(
            delay_secs = config.reconnect_delay_secs,
            "Reconnecting in {} seconds...", config.reconnect_delay_secs
        );
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect_delay()) => {}
        }
    }

    info!("Runner stopped");
    Ok(())
}
