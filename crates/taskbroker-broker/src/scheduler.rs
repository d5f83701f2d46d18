//! Offer/accept negotiation: matches task requests to runner offers.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskbroker_core::{
    FailureCode, RequestId, RequesterId, RunnerId, RunnerInfo, Task, TaskFailure, TaskId,
    TaskOffer, TaskRequest, TaskState,
};
use taskbroker_proto::{BrokerToRequester, BrokerToRunner};

use crate::error::BrokerError;
use crate::registry::{Matches, PeerHandle, PendingRequest, SessionId, TaskSlot};
use crate::state::Broker;

impl Broker {
    /// Register a runner after its `runner:info`.
    ///
    /// A previous registration under the same id is treated as disconnected:
    /// its offers are invalidated and its tasks failed.
    pub async fn register_runner(
        &self,
        info: RunnerInfo,
        session: SessionId,
        peer: impl Into<PeerHandle<BrokerToRunner>>,
    ) {
        let peer = peer.into();
        let runner_id = info.runner_id.clone();
        info!(
            runner_id = %runner_id,
            name = %info.name,
            types = ?info.task_types,
            "Runner registered"
        );

        if let Some(previous) = self.state.runners.register(info, session, peer.clone()).await {
            warn!(
                runner_id = %runner_id,
                previous_session = previous.session,
                "Runner re-registered, releasing previous registration"
            );
            previous.peer.closer.cancel();
            self.release_runner(&runner_id).await;
        }

        if !peer.deliver(BrokerToRunner::RunnerRegistered).is_sent() {
            return;
        }
        let node_types = self.state.node_types.read().await.clone();
        if let Some(node_types) = node_types {
            peer.deliver(BrokerToRunner::NodeTypes { node_types });
        }
    }

    /// Record an offer and try to match it against queued requests.
    pub async fn record_offer(&self, offer: TaskOffer) -> Result<(), BrokerError> {
        if offer.is_expired_at(Utc::now()) {
            debug!(
                runner_id = %offer.runner_id,
                offer_id = %offer.offer_id,
                "Offer expired on arrival, dropping"
            );
            return Ok(());
        }

        self.state.runners.record_offer(&offer).await?;
        debug!(
            runner_id = %offer.runner_id,
            offer_id = %offer.offer_id,
            task_type = %offer.task_type,
            valid_until = %offer.valid_until,
            "Offer recorded"
        );

        let task_type = offer.task_type.clone();
        self.state.offers.push_offer(offer).await;
        self.try_match(&task_type).await;
        Ok(())
    }

    /// Queue a task request and try to match it against open offers.
    ///
    /// The request fails with `no_runner_available` if no offer is matched
    /// within the configured request timeout.
    pub async fn submit_request(
        &self,
        requester_id: RequesterId,
        request_id: RequestId,
        task_type: String,
    ) -> Result<(), BrokerError> {
        if self
            .state
            .tasks
            .find_active_by_request(&requester_id, &request_id)
            .await
            .is_some()
        {
            return Err(BrokerError::DuplicateRequest(request_id));
        }

        let request = TaskRequest::new(request_id.clone(), task_type.clone(), requester_id.clone());
        let deadline = Instant::now() + self.state.config.request_timeout();
        self.state
            .offers
            .push_request(PendingRequest::new(request, deadline))
            .await?;

        info!(
            requester_id = %requester_id,
            request_id = %request_id,
            task_type = %task_type,
            "Task requested"
        );

        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            broker.expire_request(&requester_id, &request_id).await;
        });

        self.try_match(&task_type).await;
        Ok(())
    }

    /// Fail a request that is still queued once its deadline passed.
    pub async fn expire_request(&self, requester_id: &RequesterId, request_id: &RequestId) {
        let expired = self
            .state
            .offers
            .expire_request(requester_id, request_id, Instant::now())
            .await;
        if let Some(pending) = expired {
            warn!(
                requester_id = %requester_id,
                request_id = %request_id,
                task_type = %pending.request.task_type,
                "No runner available before request timeout"
            );
            self.fail_request(&pending.request, FailureCode::NoRunnerAvailable)
                .await;
        }
    }

    /// Withdraw a request. A request already matched cancels its task.
    pub async fn withdraw_request(
        &self,
        requester_id: &RequesterId,
        request_id: &RequestId,
        reason: &str,
    ) -> Result<(), BrokerError> {
        if self
            .state
            .offers
            .remove_request(requester_id, request_id)
            .await
            .is_some()
        {
            info!(
                requester_id = %requester_id,
                request_id = %request_id,
                reason,
                "Request withdrawn"
            );
            return Ok(());
        }

        match self
            .state
            .tasks
            .find_active_by_request(requester_id, request_id)
            .await
        {
            Some(slot) => self.cancel_by_requester(requester_id, &slot.id, reason).await,
            None => Err(BrokerError::RequestNotFound(request_id.clone())),
        }
    }

    /// Pair queued requests of `task_type` with open offers until one side runs out.
    pub async fn try_match(&self, task_type: &str) {
        loop {
            let Matches { pairs, expired } =
                self.state.offers.take_matches(task_type, Utc::now()).await;
            self.state.runners.forget_offers(&expired).await;
            for offer in &expired {
                debug!(
                    runner_id = %offer.runner_id,
                    offer_id = %offer.offer_id,
                    "Offer expired"
                );
            }

            if pairs.is_empty() {
                return;
            }

            let mut unmatched = Vec::new();
            for (pending, offer) in pairs {
                if let Some(pending) = self.dispatch_match(pending, offer).await {
                    unmatched.push(pending);
                }
            }

            if unmatched.is_empty() {
                return;
            }
            // Reverse keeps the original order at the head of the queue.
            for pending in unmatched.into_iter().rev() {
                self.requeue(pending).await;
            }
        }
    }

    /// Create the task for a matched pair and offer it to the runner.
    ///
    /// Returns the request if it must go back to the queue.
    async fn dispatch_match(
        &self,
        pending: PendingRequest,
        offer: TaskOffer,
    ) -> Option<PendingRequest> {
        if !self
            .state
            .runners
            .consume_offer(&offer.runner_id, &offer.offer_id)
            .await
        {
            debug!(
                runner_id = %offer.runner_id,
                offer_id = %offer.offer_id,
                "Offer withdrawn before match"
            );
            return Some(pending);
        }

        let task = Task::matched(&pending.request, &offer);
        let slot = self.state.tasks.insert(task, pending.clone()).await;

        if !self.state.requesters.contains(&slot.requester_id).await {
            debug!(
                task_id = %slot.id,
                requester_id = %slot.requester_id,
                "Requester left before match, returning offer"
            );
            self.state.tasks.remove(&slot.id).await;
            self.state
                .runners
                .restore_offer(&offer.runner_id, &offer.offer_id)
                .await;
            self.state.offers.return_offer(offer).await;
            return None;
        }

        info!(
            task_id = %slot.id,
            request_id = %slot.request_id,
            runner_id = %slot.runner_id,
            offer_id = %offer.offer_id,
            "Offer accepted"
        );

        let msg = BrokerToRunner::TaskOfferAccept {
            task_id: slot.id.clone(),
            offer_id: offer.offer_id,
        };
        if self.send_to_runner(&slot.runner_id, msg).await {
            return None;
        }

        warn!(
            task_id = %slot.id,
            runner_id = %slot.runner_id,
            "Runner unavailable for offer accept, rematching"
        );
        match self.unmatch(&slot).await {
            Ok(()) => Some(pending),
            // The runner's disconnect already failed the task.
            Err(_) => None,
        }
    }

    /// Return an `OFFER_ACCEPTED` task to `PENDING_REQUEST` and drop it.
    async fn unmatch(&self, slot: &TaskSlot) -> Result<(), BrokerError> {
        {
            let mut entry = slot.lock().await;
            entry.task.transition(TaskState::PendingRequest)?;
            entry.clear_pending();
        }
        self.state.tasks.remove(&slot.id).await;
        Ok(())
    }

    /// Put a request back at the head of its queue if it can still be served.
    async fn requeue(&self, pending: PendingRequest) {
        let request = &pending.request;
        if !self.state.requesters.contains(&request.requester_id).await {
            debug!(
                requester_id = %request.requester_id,
                request_id = %request.request_id,
                "Requester gone, dropping request"
            );
            return;
        }
        if pending.deadline <= Instant::now() {
            self.fail_request(request, FailureCode::NoRunnerAvailable)
                .await;
            return;
        }
        self.state.offers.requeue_front(pending).await;
    }

    /// Tell a requester its request failed before any task was created.
    async fn fail_request(&self, request: &TaskRequest, code: FailureCode) {
        let failure = TaskFailure::new(code, request.request_id.clone());
        self.send_to_requester(
            &request.requester_id,
            BrokerToRequester::request_failure(&failure),
        )
        .await;
    }

    /// Look up a task the runner is executing.
    pub(crate) async fn runner_task(
        &self,
        runner_id: &RunnerId,
        task_id: &TaskId,
    ) -> Result<Arc<TaskSlot>, BrokerError> {
        let slot = self
            .state
            .tasks
            .get(task_id)
            .await
            .ok_or_else(|| BrokerError::TaskNotFound(task_id.clone()))?;
        if &slot.runner_id != runner_id {
            return Err(BrokerError::NotOwner {
                task_id: task_id.clone(),
                party: runner_id.to_string(),
            });
        }
        Ok(slot)
    }

    /// Look up a task the requester owns.
    pub(crate) async fn requester_task(
        &self,
        requester_id: &RequesterId,
        task_id: &TaskId,
    ) -> Result<Arc<TaskSlot>, BrokerError> {
        let slot = self
            .state
            .tasks
            .get(task_id)
            .await
            .ok_or_else(|| BrokerError::TaskNotFound(task_id.clone()))?;
        if &slot.requester_id != requester_id {
            return Err(BrokerError::NotOwner {
                task_id: task_id.clone(),
                party: requester_id.to_string(),
            });
        }
        Ok(slot)
    }

    /// Runner acknowledged the offer accept; the requester may send settings.
    pub async fn task_accepted(
        &self,
        runner_id: &RunnerId,
        task_id: &TaskId,
    ) -> Result<(), BrokerError> {
        let slot = self.runner_task(runner_id, task_id).await?;
        slot.lock().await.task.transition(TaskState::Ready)?;
        info!(task_id = %task_id, runner_id = %runner_id, "Task accepted by runner");

        let msg = BrokerToRequester::TaskReady {
            request_id: slot.request_id.clone(),
            task_id: task_id.clone(),
        };
        if !self.send_to_requester(&slot.requester_id, msg).await {
            let reason = FailureCode::RequesterDisconnected.message();
            if slot.lock().await.task.cancel(reason).is_ok() {
                warn!(task_id = %task_id, "Requester unavailable for task ready, cancelling");
                self.send_to_runner(
                    runner_id,
                    BrokerToRunner::TaskCancel {
                        task_id: task_id.clone(),
                        reason: reason.to_string(),
                    },
                )
                .await;
            }
        }
        Ok(())
    }

    /// Runner declined the offer accept; the request is matched again.
    pub async fn task_rejected(
        &self,
        runner_id: &RunnerId,
        task_id: &TaskId,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let slot = self.runner_task(runner_id, task_id).await?;
        self.unmatch(&slot).await?;
        info!(
            task_id = %task_id,
            runner_id = %runner_id,
            request_id = %slot.request_id,
            reason,
            "Task rejected by runner, rematching"
        );

        let task_type = slot.origin.request.task_type.clone();
        self.requeue(slot.origin.clone()).await;
        self.try_match(&task_type).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;
    use taskbroker_core::OfferId;
    use tokio::sync::mpsc::{self, Receiver};

    async fn runner(broker: &Broker, id: &str) -> Receiver<BrokerToRunner> {
        let (tx, mut rx) = mpsc::channel::<BrokerToRunner>(16);
        let info = RunnerInfo::new(RunnerId::new(id), "test").with_task_type("code");
        broker.register_runner(info, broker.state().next_session(), tx).await;
        assert_eq!(rx.recv().await, Some(BrokerToRunner::RunnerRegistered));
        rx
    }

    async fn requester(broker: &Broker, id: &str) -> Receiver<BrokerToRequester> {
        let (tx, rx) = mpsc::channel::<BrokerToRequester>(16);
        broker
            .state()
            .requesters
            .register(RequesterId::new(id), broker.state().next_session(), tx)
            .await;
        rx
    }

    fn offer(runner: &str, id: &str, valid_for_ms: i64) -> TaskOffer {
        TaskOffer::valid_for(
            OfferId::new(id),
            RunnerId::new(runner),
            "code",
            valid_for_ms,
            Utc::now(),
        )
    }

    fn offer_accept_task(msg: Option<BrokerToRunner>) -> TaskId {
        match msg {
            Some(BrokerToRunner::TaskOfferAccept { task_id, .. }) => task_id,
            other => panic!("Expected offer accept, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_waits_for_offer() {
        let broker = Broker::new(Config::default());
        let mut runner_rx = runner(&broker, "r1").await;
        let _requester_rx = requester(&broker, "rq").await;

        broker
            .submit_request(RequesterId::new("rq"), RequestId::new("a"), "code".into())
            .await
            .unwrap();
        assert!(runner_rx.try_recv().is_err());

        broker.record_offer(offer("r1", "o1", 10_000)).await.unwrap();
        let task_id = offer_accept_task(runner_rx.recv().await);

        let slot = broker.state().tasks.get(&task_id).await.unwrap();
        assert_eq!(slot.state().await, TaskState::OfferAccepted);
    }

    #[tokio::test]
    async fn test_rejection_rematches_with_next_offer() {
        let broker = Broker::new(Config::default());
        let mut r1 = runner(&broker, "r1").await;
        let mut r2 = runner(&broker, "r2").await;
        let _rq = requester(&broker, "rq").await;

        broker.record_offer(offer("r1", "o1", 10_000)).await.unwrap();
        broker.record_offer(offer("r2", "o2", 10_000)).await.unwrap();
        broker
            .submit_request(RequesterId::new("rq"), RequestId::new("a"), "code".into())
            .await
            .unwrap();

        let first = offer_accept_task(r1.recv().await);
        broker
            .task_rejected(&RunnerId::new("r1"), &first, "busy")
            .await
            .unwrap();

        let second = offer_accept_task(r2.recv().await);
        assert_ne!(first, second);
        assert!(broker.state().tasks.get(&first).await.is_none());
    }

    #[tokio::test]
    async fn test_rejection_after_accept_is_refused() {
        let broker = Broker::new(Config::default());
        let mut r1 = runner(&broker, "r1").await;
        let _rq = requester(&broker, "rq").await;
        let r1_id = RunnerId::new("r1");

        broker.record_offer(offer("r1", "o1", 10_000)).await.unwrap();
        broker
            .submit_request(RequesterId::new("rq"), RequestId::new("a"), "code".into())
            .await
            .unwrap();
        let task_id = offer_accept_task(r1.recv().await);

        broker.task_accepted(&r1_id, &task_id).await.unwrap();
        assert!(broker.task_rejected(&r1_id, &task_id, "late").await.is_err());
    }

    #[tokio::test]
    async fn test_other_runner_cannot_accept() {
        let broker = Broker::new(Config::default());
        let mut r1 = runner(&broker, "r1").await;
        let _r2 = runner(&broker, "r2").await;
        let _rq = requester(&broker, "rq").await;

        broker.record_offer(offer("r1", "o1", 10_000)).await.unwrap();
        broker
            .submit_request(RequesterId::new("rq"), RequestId::new("a"), "code".into())
            .await
            .unwrap();
        let task_id = offer_accept_task(r1.recv().await);

        let result = broker.task_accepted(&RunnerId::new("r2"), &task_id).await;
        assert!(matches!(result, Err(BrokerError::NotOwner { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_without_offer() {
        let broker = Broker::new(Config {
            request_timeout_secs: 5,
            ..Config::default()
        });
        let mut rq = requester(&broker, "rq").await;

        broker
            .submit_request(RequesterId::new("rq"), RequestId::new("a"), "code".into())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        match rq.recv().await {
            Some(BrokerToRequester::RequestError { request_id, error }) => {
                assert_eq!(request_id.as_str(), "a");
                assert_eq!(error["code"], "no_runner_available");
            }
            other => panic!("Expected request error, got {other:?}"),
        }
        assert!(broker.state().offers.depths().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_request_id_refused() {
        let broker = Broker::new(Config::default());
        let _rq = requester(&broker, "rq").await;
        let submit = || {
            broker.submit_request(RequesterId::new("rq"), RequestId::new("a"), "code".into())
        };

        submit().await.unwrap();
        assert!(matches!(
            submit().await,
            Err(BrokerError::DuplicateRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_withdraw_queued_request() {
        let broker = Broker::new(Config::default());
        let _rq = requester(&broker, "rq").await;
        let rq_id = RequesterId::new("rq");

        broker
            .submit_request(rq_id.clone(), RequestId::new("a"), "code".into())
            .await
            .unwrap();
        broker
            .withdraw_request(&rq_id, &RequestId::new("a"), "changed my mind")
            .await
            .unwrap();

        assert!(broker.state().offers.depths().await.is_empty());
        assert!(matches!(
            broker
                .withdraw_request(&rq_id, &RequestId::new("a"), "again")
                .await,
            Err(BrokerError::RequestNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reregistration_invalidates_offers() {
        let broker = Broker::new(Config::default());
        let _old = runner(&broker, "r1").await;
        let _rq = requester(&broker, "rq").await;
        broker.record_offer(offer("r1", "o1", 10_000)).await.unwrap();

        let mut fresh = runner(&broker, "r1").await;
        broker
            .submit_request(RequesterId::new("rq"), RequestId::new("a"), "code".into())
            .await
            .unwrap();

        assert!(fresh.try_recv().is_err());
        assert_eq!(broker.state().offers.depths().await["code"].requests, 1);
    }
}
