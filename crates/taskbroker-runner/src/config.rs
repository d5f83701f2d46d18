//! Runner configuration.

use std::time::Duration;

use taskbroker_core::RunnerId;

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Broker base URL (`ws://` or `wss://`).
    pub broker_url: String,

    /// Runner ID.
    pub runner_id: RunnerId,

    /// Name reported to the broker.
    pub name: String,

    /// Task types this runner executes.
    pub task_types: Vec<String>,

    /// Maximum concurrent tasks this runner can handle.
    pub max_concurrency: usize,

    /// Nominal offer validity window (milliseconds), jittered by ±20%.
    pub offer_valid_for_ms: u64,

    /// Interval at which expired offers are renewed (milliseconds).
    pub offer_refresh_interval_ms: u64,

    /// Bound on each data request or RPC call (seconds).
    pub rpc_timeout_secs: u64,

    /// Reconnection delay on connection loss (seconds).
    pub reconnect_delay_secs: u64,
}

impl Config {
    /// URL of the broker's runner endpoint for this runner.
    pub fn connect_url(&self) -> String {
        format!(
            "{}/runners/_ws?id={}",
            self.broker_url.trim_end_matches('/'),
            self.runner_id
        )
    }

    pub fn offer_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.offer_refresh_interval_ms.max(10))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: "ws://127.0.0.1:5679".to_string(),
            runner_id: RunnerId::generate(),
            name: "taskbroker-runner".to_string(),
            task_types: vec!["javascript".to_string()],
            max_concurrency: 5,
            offer_valid_for_ms: 5000,
            offer_refresh_interval_ms: 250,
            rpc_timeout_secs: 30,
            reconnect_delay_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_url() {
        let config = Config {
            broker_url: "ws://broker:5679/".to_string(),
            runner_id: RunnerId::new("r-1"),
            ..Config::default()
        };
        assert_eq!(config.connect_url(), "ws://broker:5679/runners/_ws?id=r-1");
    }
}
