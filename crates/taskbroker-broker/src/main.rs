//! Task Broker Server

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taskbroker_broker::{http, Broker, Config};
use taskbroker_core::RpcAllowList;

/// Task broker: matches runner offers to task requests.
#[derive(Parser, Debug)]
#[command(name = "taskbroker-broker")]
#[command(about = "Task broker for runners and requesters")]
struct Args {
    /// HTTP/WebSocket bind address
    #[arg(long, default_value = "127.0.0.1:5679")]
    bind: String,

    /// Seconds a task request may wait for an offer
    #[arg(long, default_value = "60")]
    request_timeout_secs: u64,

    /// Seconds finished tasks stay queryable
    #[arg(long, default_value = "300")]
    finished_task_retention_secs: u64,

    /// Seconds between maintenance sweeps
    #[arg(long, default_value = "10")]
    sweep_interval_secs: u64,

    /// Consecutive protocol errors before a connection is closed
    #[arg(long, default_value = "10")]
    max_protocol_errors: u32,

    /// JSON file with node type descriptions pushed to runners
    #[arg(long)]
    node_types: Option<PathBuf>,

    /// RPC procedure runners may call (repeatable, replaces the built-in list)
    #[arg(long = "rpc-allow")]
    rpc_allow: Vec<String>,
}

impl Args {
    fn into_config(self) -> Config {
        let defaults = Config::default();
        let rpc_allow_list = if self.rpc_allow.is_empty() {
            defaults.rpc_allow_list.clone()
        } else {
            RpcAllowList::new(self.rpc_allow)
        };
        Config {
            bind_addr: self.bind,
            request_timeout_secs: self.request_timeout_secs,
            finished_task_retention_secs: self.finished_task_retention_secs,
            sweep_interval_secs: self.sweep_interval_secs,
            max_protocol_errors: self.max_protocol_errors,
            node_types_path: self.node_types,
            rpc_allow_list,
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing (RUST_LOG overrides the default level)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = Args::parse().into_config();
    let addr: SocketAddr = config.bind_addr.parse()?;

    let node_types = match &config.node_types_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                format!("Failed to read node types from '{}': {}", path.display(), e)
            })?;
            Some(serde_json::from_str::<serde_json::Value>(&raw)?)
        }
        None => None,
    };

    info!(
        bind = %addr,
        request_timeout_secs = config.request_timeout_secs,
        rpc_allowed = config.rpc_allow_list.len(),
        "Starting task broker"
    );

    let broker = Broker::new(config);
    if let Some(node_types) = node_types {
        broker.push_node_types(node_types).await;
    }

    let shutdown = CancellationToken::new();
    let maintenance = broker.spawn_maintenance(shutdown.clone());

    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let signal = shutdown.clone();
    axum::serve(listener, http::create_router(broker))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = maintenance.await;
    Ok(())
}
