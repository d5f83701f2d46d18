//! Shared broker state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskbroker_core::{RequesterId, RunnerId};
use taskbroker_proto::{BrokerToRequester, BrokerToRunner};

use crate::config::Config;
use crate::registry::{
    Delivery, OfferQueue, RequesterRegistry, RunnerRegistry, SessionId, TaskRegistry,
};

/// Shared application state.
pub struct AppState {
    pub config: Config,

    /// Registered runners indexed by RunnerId.
    pub runners: RunnerRegistry,

    /// Connected requesters indexed by RequesterId.
    pub requesters: RequesterRegistry,

    /// Outstanding offers and pending requests by task type.
    pub offers: OfferQueue,

    /// Matched tasks indexed by TaskId.
    pub tasks: TaskRegistry,

    /// Node type descriptions pushed to runners on registration.
    pub node_types: RwLock<Option<Value>>,

    next_session: AtomicU64,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            runners: RunnerRegistry::new(),
            requesters: RequesterRegistry::new(),
            offers: OfferQueue::new(),
            tasks: TaskRegistry::new(),
            node_types: RwLock::new(None),
            next_session: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a new connection.
    pub fn next_session(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }
}

/// Handle to the broker. Cheap to clone; every clone shares one state.
#[derive(Clone)]
pub struct Broker {
    pub(crate) state: Arc<AppState>,
}

impl Broker {
    pub fn new(config: Config) -> Self {
        Self {
            state: Arc::new(AppState::new(config)),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// Queue a message for a registered runner.
    ///
    /// Never waits on the runner. Returns false if the runner is gone, its
    /// connection closed, or its queue is full; a full queue disconnects it.
    pub async fn send_to_runner(&self, runner_id: &RunnerId, msg: BrokerToRunner) -> bool {
        let Some(peer) = self.state.runners.sender(runner_id).await else {
            debug!(runner_id = %runner_id, kind = msg.kind(), "Runner not registered, dropping message");
            return false;
        };
        let kind = msg.kind();
        match peer.deliver(msg) {
            Delivery::Sent => true,
            Delivery::Closed => {
                warn!(runner_id = %runner_id, kind, "Failed to send to runner - connection closed");
                false
            }
            Delivery::Stalled => {
                warn!(runner_id = %runner_id, kind, "Runner stopped reading, disconnecting");
                false
            }
        }
    }

    /// Queue a message for a connected requester.
    ///
    /// Never waits on the requester. Returns false if the requester is gone,
    /// its connection closed, or its queue is full; a full queue disconnects it.
    pub async fn send_to_requester(&self, requester_id: &RequesterId, msg: BrokerToRequester) -> bool {
        let Some(peer) = self.state.requesters.sender(requester_id).await else {
            debug!(requester_id = %requester_id, kind = msg.kind(), "Requester not connected, dropping message");
            return false;
        };
        let kind = msg.kind();
        match peer.deliver(msg) {
            Delivery::Sent => true,
            Delivery::Closed => {
                warn!(requester_id = %requester_id, kind, "Failed to send to requester - connection closed");
                false
            }
            Delivery::Stalled => {
                warn!(requester_id = %requester_id, kind, "Requester stopped reading, disconnecting");
                false
            }
        }
    }

    /// Replace the node type descriptions and push them to every runner.
    pub async fn push_node_types(&self, node_types: Value) {
        *self.state.node_types.write().await = Some(node_types.clone());

        let runners = self.state.runners.senders().await;
        info!(runners = runners.len(), "Broadcasting node types");
        for (runner_id, peer) in runners {
            let msg = BrokerToRunner::NodeTypes {
                node_types: node_types.clone(),
            };
            if !peer.deliver(msg).is_sent() {
                debug!(runner_id = %runner_id, "Node types not delivered");
            }
        }
    }

    /// Run one maintenance pass: reap expired offers and prune finished tasks.
    pub async fn sweep(&self) {
        let now = chrono::Utc::now();
        let expired = self.state.offers.reap_expired(now).await;
        self.state.runners.forget_offers(&expired).await;

        let retention = chrono::Duration::from_std(self.state.config.finished_task_retention())
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let pruned = self.state.tasks.prune_finished(now - retention).await;

        if !expired.is_empty() || pruned > 0 {
            debug!(expired_offers = expired.len(), pruned_tasks = pruned, "Maintenance sweep");
        }
    }

    /// Spawn the periodic maintenance sweep, stopped by `shutdown`.
    pub fn spawn_maintenance(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let broker = self.clone();
        let period = self.state.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => broker.sweep().await,
                }
            }
        })
    }
}
