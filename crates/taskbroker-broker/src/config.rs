//! Broker configuration.

use std::path::PathBuf;
use std::time::Duration;

use taskbroker_core::RpcAllowList;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket bind address.
    pub bind_addr: String,

    /// How long a task request may wait for an offer (seconds).
    pub request_timeout_secs: u64,

    /// How long finished tasks stay queryable (seconds).
    pub finished_task_retention_secs: u64,

    /// Interval of the maintenance sweep (seconds).
    pub sweep_interval_secs: u64,

    /// Outbound message buffer per connection.
    pub outbound_buffer: usize,

    /// Consecutive undecodable frames tolerated before a connection is closed.
    pub max_protocol_errors: u32,

    /// JSON file with node type descriptions pushed to runners.
    pub node_types_path: Option<PathBuf>,

    /// RPC procedures runners may call on requesters.
    pub rpc_allow_list: RpcAllowList,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn finished_task_retention(&self) -> Duration {
        Duration::from_secs(self.finished_task_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5679".to_string(),
            request_timeout_secs: 60,
            finished_task_retention_secs: 300,
            sweep_interval_secs: 10,
            outbound_buffer: 64,
            max_protocol_errors: 10,
            node_types_path: None,
            rpc_allow_list: RpcAllowList::default(),
        }
    }
}
