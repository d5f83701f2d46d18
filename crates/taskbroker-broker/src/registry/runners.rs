//! Registry of connected runners and their outstanding offers.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use taskbroker_core::{CoreError, OfferId, RunnerId, RunnerInfo, TaskOffer};
use taskbroker_proto::BrokerToRunner;

use crate::error::BrokerError;
use crate::registry::{PeerHandle, SessionId};

/// A registered runner connection.
#[derive(Debug)]
pub struct ConnectedRunner {
    /// Information declared in `runner:info`.
    pub info: RunnerInfo,

    /// Connection this registration belongs to.
    pub session: SessionId,

    /// Offers recorded and not yet consumed or expired.
    pub open_offers: HashSet<OfferId>,

    /// Offers consumed during this registration; never accepted twice.
    pub used_offers: HashSet<OfferId>,

    /// When the runner registered.
    pub registered_at: DateTime<Utc>,

    /// Outbound side of the runner's connection.
    pub peer: PeerHandle<BrokerToRunner>,
}

/// Serializable view of a registered runner.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerSummary {
    pub runner_id: String,
    pub name: String,
    pub task_types: Vec<String>,
    pub open_offers: usize,
    pub registered_at: String,
}

/// Registered runners indexed by RunnerId.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: RwLock<HashMap<RunnerId, ConnectedRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner, replacing any previous registration with the same id.
    ///
    /// Returns the replaced registration, whose offers are no longer valid.
    pub async fn register(
        &self,
        info: RunnerInfo,
        session: SessionId,
        peer: impl Into<PeerHandle<BrokerToRunner>>,
    ) -> Option<ConnectedRunner> {
        let runner_id = info.runner_id.clone();
        let connected = ConnectedRunner {
            info,
            session,
            open_offers: HashSet::new(),
            used_offers: HashSet::new(),
            registered_at: Utc::now(),
            peer: peer.into(),
        };
        self.runners.write().await.insert(runner_id, connected)
    }

    /// Remove a runner if it is still registered by `session`.
    ///
    /// A reconnected runner is registered under a newer session, so the
    /// close of its previous connection leaves it in place.
    pub async fn remove(&self, runner_id: &RunnerId, session: SessionId) -> Option<ConnectedRunner> {
        let mut runners = self.runners.write().await;
        match runners.get(runner_id) {
            Some(runner) if runner.session == session => runners.remove(runner_id),
            _ => None,
        }
    }

    /// Record an offer as outstanding for its runner.
    pub async fn record_offer(&self, offer: &TaskOffer) -> Result<(), BrokerError> {
        let mut runners = self.runners.write().await;
        let runner = runners
            .get_mut(&offer.runner_id)
            .ok_or_else(|| BrokerError::RunnerNotRegistered(offer.runner_id.clone()))?;

        if !runner.info.supports(&offer.task_type) {
            return Err(CoreError::TaskTypeNotDeclared {
                task_type: offer.task_type.clone(),
                runner: offer.runner_id.to_string(),
            }
            .into());
        }

        if runner.used_offers.contains(&offer.offer_id)
            || !runner.open_offers.insert(offer.offer_id.clone())
        {
            return Err(BrokerError::DuplicateOffer(offer.offer_id.clone()));
        }

        Ok(())
    }

    /// Mark an outstanding offer consumed.
    ///
    /// Returns false if the offer is no longer outstanding, in which case it
    /// must not be matched.
    pub async fn consume_offer(&self, runner_id: &RunnerId, offer_id: &OfferId) -> bool {
        let mut runners = self.runners.write().await;
        let Some(runner) = runners.get_mut(runner_id) else {
            return false;
        };
        if !runner.open_offers.remove(offer_id) {
            return false;
        }
        runner.used_offers.insert(offer_id.clone());
        true
    }

    /// Undo `consume_offer` for a match that was abandoned before delivery.
    pub async fn restore_offer(&self, runner_id: &RunnerId, offer_id: &OfferId) {
        let mut runners = self.runners.write().await;
        if let Some(runner) = runners.get_mut(runner_id) {
            if runner.used_offers.remove(offer_id) {
                runner.open_offers.insert(offer_id.clone());
            }
        }
    }

    /// Drop expired offers from their runners' outstanding sets.
    pub async fn forget_offers(&self, offers: &[TaskOffer]) {
        if offers.is_empty() {
            return;
        }
        let mut runners = self.runners.write().await;
        for offer in offers {
            if let Some(runner) = runners.get_mut(&offer.runner_id) {
                runner.open_offers.remove(&offer.offer_id);
            }
        }
    }

    /// Outbound side of a registered runner.
    pub async fn sender(&self, runner_id: &RunnerId) -> Option<PeerHandle<BrokerToRunner>> {
        self.runners
            .read()
            .await
            .get(runner_id)
            .map(|r| r.peer.clone())
    }

    /// Outbound sides of every registered runner.
    pub async fn senders(&self) -> Vec<(RunnerId, PeerHandle<BrokerToRunner>)> {
        self.runners
            .read()
            .await
            .iter()
            .map(|(id, r)| (id.clone(), r.peer.clone()))
            .collect()
    }

    /// Check whether `runner_id` is registered by `session`.
    pub async fn is_registered(&self, runner_id: &RunnerId, session: SessionId) -> bool {
        self.runners
            .read()
            .await
            .get(runner_id)
            .is_some_and(|r| r.session == session)
    }

    /// Get the number of registered runners.
    pub async fn count(&self) -> usize {
        self.runners.read().await.len()
    }

    /// Summaries of all registered runners, sorted by id.
    pub async fn summaries(&self) -> Vec<RunnerSummary> {
        let runners = self.runners.read().await;
        let mut summaries: Vec<RunnerSummary> = runners
            .values()
            .map(|r| RunnerSummary {
                runner_id: r.info.runner_id.to_string(),
                name: r.info.name.clone(),
                task_types: r.info.task_types.clone(),
                open_offers: r.open_offers.len(),
                registered_at: r.registered_at.to_rfc3339(),
            })
            .collect();
        summaries.sort_by(|a, b| a.runner_id.cmp(&b.runner_id));
        summaries
    }
}
