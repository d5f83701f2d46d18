//! Per-task-type queues of outstanding offers and pending requests.
//!
//! Each task type has its own lock, so matching for one type never waits
//! on another.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use taskbroker_core::{RequestId, RequesterId, RunnerId, TaskOffer, TaskRequest};

use crate::error::BrokerError;

/// A request waiting for an offer.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request: TaskRequest,

    /// The request fails with no runner available at this instant.
    pub deadline: Instant,
}

impl PendingRequest {
    pub fn new(request: TaskRequest, deadline: Instant) -> Self {
        Self { request, deadline }
    }

    fn is(&self, requester_id: &RequesterId, request_id: &RequestId) -> bool {
        &self.request.requester_id == requester_id && &self.request.request_id == request_id
    }
}

/// Offers and requests of a single task type, both in arrival order.
#[derive(Debug, Default)]
pub struct TypeQueue {
    offers: VecDeque<TaskOffer>,
    requests: VecDeque<PendingRequest>,
}

impl TypeQueue {
    fn drop_expired_offers(&mut self, now: DateTime<Utc>) -> Vec<TaskOffer> {
        let mut expired = Vec::new();
        self.offers.retain(|offer| {
            if offer.is_expired_at(now) {
                expired.push(offer.clone());
                false
            } else {
                true
            }
        });
        expired
    }
}

/// Pairs produced by one matching pass.
#[derive(Debug, Default)]
pub struct Matches {
    /// Oldest request paired with oldest live offer.
    pub pairs: Vec<(PendingRequest, TaskOffer)>,

    /// Offers found expired during the pass.
    pub expired: Vec<TaskOffer>,
}

/// Queue depths for one task type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub offers: usize,
    pub requests: usize,
}

/// All offer and request queues.
#[derive(Default)]
pub struct OfferQueue {
    queues: RwLock<HashMap<String, Arc<Mutex<TypeQueue>>>>,
}

impl OfferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn queue(&self, task_type: &str) -> Arc<Mutex<TypeQueue>> {
        if let Some(queue) = self.queues.read().await.get(task_type) {
            return queue.clone();
        }
        self.queues
            .write()
            .await
            .entry(task_type.to_string())
            .or_default()
            .clone()
    }

    async fn all_queues(&self) -> Vec<(String, Arc<Mutex<TypeQueue>>)> {
        self.queues
            .read()
            .await
            .iter()
            .map(|(t, q)| (t.clone(), q.clone()))
            .collect()
    }

    /// Append an offer to its task type's queue.
    pub async fn push_offer(&self, offer: TaskOffer) {
        let queue = self.queue(&offer.task_type).await;
        queue.lock().await.offers.push_back(offer);
    }

    /// Append a request to its task type's queue.
    ///
    /// Fails if the requester already has a pending request with the same id.
    pub async fn push_request(&self, pending: PendingRequest) -> Result<(), BrokerError> {
        let request = &pending.request;
        if self
            .contains_request(&request.requester_id, &request.request_id)
            .await
        {
            return Err(BrokerError::DuplicateRequest(request.request_id.clone()));
        }

        let queue = self.queue(&request.task_type).await;
        queue.lock().await.requests.push_back(pending);
        Ok(())
    }

    /// Put an offer back at the head of its queue after a match was abandoned.
    pub async fn return_offer(&self, offer: TaskOffer) {
        let queue = self.queue(&offer.task_type).await;
        queue.lock().await.offers.push_front(offer);
    }

    /// Put a request back at the head of its queue after a failed match.
    pub async fn requeue_front(&self, pending: PendingRequest) {
        let queue = self.queue(&pending.request.task_type).await;
        queue.lock().await.requests.push_front(pending);
    }

    /// Pair pending requests with live offers of `task_type`, oldest first.
    ///
    /// Paired entries leave the queue. Expired offers are dropped and
    /// returned so their runners' records can be updated.
    pub async fn take_matches(&self, task_type: &str, now: DateTime<Utc>) -> Matches {
        let queue = self.queue(task_type).await;
        let mut queue = queue.lock().await;

        let expired = queue.drop_expired_offers(now);
        let mut pairs = Vec::new();
        while !queue.offers.is_empty() && !queue.requests.is_empty() {
            if let (Some(request), Some(offer)) =
                (queue.requests.pop_front(), queue.offers.pop_front())
            {
                pairs.push((request, offer));
            }
        }

        Matches { pairs, expired }
    }

    pub async fn contains_request(&self, requester_id: &RequesterId, request_id: &RequestId) -> bool {
        for (_, queue) in self.all_queues().await {
            if queue
                .lock()
                .await
                .requests
                .iter()
                .any(|p| p.is(requester_id, request_id))
            {
                return true;
            }
        }
        false
    }

    /// Remove a pending request, if it is still queued.
    pub async fn remove_request(
        &self,
        requester_id: &RequesterId,
        request_id: &RequestId,
    ) -> Option<PendingRequest> {
        for (_, queue) in self.all_queues().await {
            let mut queue = queue.lock().await;
            if let Some(pos) = queue
                .requests
                .iter()
                .position(|p| p.is(requester_id, request_id))
            {
                return queue.requests.remove(pos);
            }
        }
        None
    }

    /// Remove a pending request whose deadline has passed at `now`.
    ///
    /// A newer request reusing the same id keeps its own deadline and stays.
    pub async fn expire_request(
        &self,
        requester_id: &RequesterId,
        request_id: &RequestId,
        now: Instant,
    ) -> Option<PendingRequest> {
        for (_, queue) in self.all_queues().await {
            let mut queue = queue.lock().await;
            if let Some(pos) = queue
                .requests
                .iter()
                .position(|p| p.is(requester_id, request_id) && p.deadline <= now)
            {
                return queue.requests.remove(pos);
            }
        }
        None
    }

    /// Remove every offer made by a runner.
    pub async fn remove_runner_offers(&self, runner_id: &RunnerId) -> Vec<TaskOffer> {
        let mut removed = Vec::new();
        for (_, queue) in self.all_queues().await {
            queue.lock().await.offers.retain(|offer| {
                if &offer.runner_id == runner_id {
                    removed.push(offer.clone());
                    false
                } else {
                    true
                }
            });
        }
        removed
    }

    /// Remove every pending request of a requester.
    pub async fn remove_requester_requests(&self, requester_id: &RequesterId) -> Vec<PendingRequest> {
        let mut removed = Vec::new();
        for (_, queue) in self.all_queues().await {
            queue.lock().await.requests.retain(|pending| {
                if &pending.request.requester_id == requester_id {
                    removed.push(pending.clone());
                    false
                } else {
                    true
                }
            });
        }
        removed
    }

    /// Drop expired offers across all task types.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Vec<TaskOffer> {
        let mut expired = Vec::new();
        for (_, queue) in self.all_queues().await {
            expired.extend(queue.lock().await.drop_expired_offers(now));
        }
        expired
    }

    /// Queue depths by task type, omitting empty queues.
    pub async fn depths(&self) -> BTreeMap<String, QueueDepth> {
        let mut depths = BTreeMap::new();
        for (task_type, queue) in self.all_queues().await {
            let queue = queue.lock().await;
            if queue.offers.is_empty() && queue.requests.is_empty() {
                continue;
            }
            depths.insert(
                task_type,
                QueueDepth {
                    offers: queue.offers.len(),
                    requests: queue.requests.len(),
                },
            );
        }
        depths
    }
}
