//! Runner state machine.
//!
//! A [`Runner`] keeps offers open for its free slots, accepts the offers the
//! broker matches, executes tasks once settings arrive and reports their
//! outcome. It talks to the broker only through message channels, so the
//! transport lives elsewhere.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskbroker_core::{OfferId, RpcStatus, TaskId};
use taskbroker_proto::{BrokerToRunner, RunnerToBroker};

use crate::config::Config;
use crate::executor::{Executor, ExecutorError, PendingReplies, ReplyKey, TaskContext};

/// Offer jitter as a fraction of the nominal validity window.
const OFFER_JITTER: f64 = 0.2;

struct OpenOffer {
    task_type: String,
    valid_until: Instant,
}

enum LocalTask {
    /// Accepted, waiting for settings.
    Accepted,
    Running { cancel: CancellationToken },
}

/// Runner side of one broker connection.
pub struct Runner {
    config: Arc<Config>,
    executor: Arc<dyn Executor>,
    outbound: mpsc::Sender<RunnerToBroker>,
    replies: Arc<PendingReplies>,
    open_offers: HashMap<OfferId, OpenOffer>,
    tasks: HashMap<TaskId, LocalTask>,
    done_tx: mpsc::UnboundedSender<TaskId>,
    registered: bool,
    next_type: usize,
}

impl Runner {
    pub fn new(
        config: Arc<Config>,
        executor: Arc<dyn Executor>,
        outbound: mpsc::Sender<RunnerToBroker>,
    ) -> (Self, mpsc::UnboundedReceiver<TaskId>) {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let runner = Self {
            config,
            executor,
            outbound,
            replies: Arc::new(PendingReplies::new()),
            open_offers: HashMap::new(),
            tasks: HashMap::new(),
            done_tx,
            registered: false,
            next_type: 0,
        };
        (runner, done_rx)
    }

    /// Process broker messages until the connection closes or `shutdown`
    /// fires.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<BrokerToRunner>,
        mut done_rx: mpsc::UnboundedReceiver<TaskId>,
        shutdown: CancellationToken,
    ) {
        let mut refresh = tokio::time::interval(self.config.offer_refresh_interval());
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.shut_down().await;
                    break;
                }
                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle_broker_message(msg).await,
                    None => {
                        info!("Broker connection closed");
                        self.abandon_tasks();
                        break;
                    }
                },
                Some(task_id) = done_rx.recv() => {
                    self.tasks.remove(&task_id);
                    self.replies.forget_task(&task_id).await;
                    debug!(task_id = %task_id, active = self.tasks.len(), "Slot freed");
                    self.refresh_offers().await;
                }
                _ = refresh.tick(), if self.registered => {
                    self.refresh_offers().await;
                }
            }
        }
    }

    async fn handle_broker_message(&mut self, msg: BrokerToRunner) {
        match msg {
            BrokerToRunner::InfoRequest => {
                self.send(RunnerToBroker::Info {
                    name: self.config.name.clone(),
                    types: self.config.task_types.clone(),
                })
                .await;
            }
            BrokerToRunner::RunnerRegistered => {
                info!(runner_id = %self.config.runner_id, "Registered with broker");
                self.registered = true;
                self.refresh_offers().await;
            }
            BrokerToRunner::TaskOfferAccept { task_id, offer_id } => {
                self.offer_accepted(task_id, offer_id).await;
            }
            BrokerToRunner::TaskSettings { task_id, settings } => {
                self.start_task(task_id, settings);
            }
            BrokerToRunner::TaskCancel { task_id, reason } => {
                info!(task_id = %task_id, reason = %reason, "Task cancelled by broker");
                match self.tasks.get(&task_id) {
                    Some(LocalTask::Running { cancel }) => cancel.cancel(),
                    Some(LocalTask::Accepted) => {
                        self.tasks.remove(&task_id);
                        self.refresh_offers().await;
                    }
                    None => debug!(task_id = %task_id, "Cancel for unknown task"),
                }
            }
            BrokerToRunner::RpcResponse {
                call_id,
                task_id,
                status,
                data,
            } => {
                let reply = match status {
                    RpcStatus::Success => Ok(data),
                    RpcStatus::Error => Err(ExecutorError::Remote(data)),
                };
                if !self
                    .replies
                    .resolve(&task_id, ReplyKey::Call(call_id.clone()), reply)
                    .await
                {
                    debug!(task_id = %task_id, call_id = %call_id, "No call waiting for response");
                }
            }
            BrokerToRunner::TaskDataResponse {
                task_id,
                request_id,
                data,
            } => {
                if !self
                    .replies
                    .resolve(&task_id, ReplyKey::Data(request_id.clone()), Ok(data))
                    .await
                {
                    debug!(task_id = %task_id, request_id = %request_id, "No request waiting for data");
                }
            }
            BrokerToRunner::NodeTypes { node_types } => {
                let count = node_types.as_array().map(Vec::len).unwrap_or(0);
                debug!(count, "Received node types");
            }
        }
    }

    async fn offer_accepted(&mut self, task_id: TaskId, offer_id: OfferId) {
        let offer = self.open_offers.remove(&offer_id);
        let reason = match offer {
            None => Some("Offer expired - not accepted"),
            Some(offer) if offer.valid_until <= Instant::now() => {
                Some("Offer expired - not accepted")
            }
            Some(_) if self.tasks.len() >= self.config.max_concurrency => {
                Some("No open task slots")
            }
            Some(offer) => {
                debug!(task_id = %task_id, task_type = %offer.task_type, "Offer accepted");
                None
            }
        };

        match reason {
            Some(reason) => {
                info!(task_id = %task_id, offer_id = %offer_id, reason, "Rejecting task");
                self.send(RunnerToBroker::TaskRejected {
                    task_id,
                    reason: reason.to_string(),
                })
                .await;
            }
            None => {
                self.tasks.insert(task_id.clone(), LocalTask::Accepted);
                info!(task_id = %task_id, active = self.tasks.len(), "Task accepted");
                self.send(RunnerToBroker::TaskAccepted { task_id }).await;
            }
        }
    }

    fn start_task(&mut self, task_id: TaskId, settings: serde_json::Value) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            warn!(task_id = %task_id, "Settings for unknown task");
            return;
        };
        if !matches!(task, LocalTask::Accepted) {
            warn!(task_id = %task_id, "Settings for task already running");
            return;
        }

        let cancel = CancellationToken::new();
        *task = LocalTask::Running {
            cancel: cancel.clone(),
        };

        let ctx = TaskContext::new(
            task_id.clone(),
            settings,
            self.outbound.clone(),
            self.replies.clone(),
            cancel.clone(),
            self.config.rpc_timeout(),
        );
        let executor = self.executor.clone();
        let outbound = self.outbound.clone();
        let done_tx = self.done_tx.clone();

        info!(task_id = %task_id, "Starting task");
        tokio::spawn(async move {
            let result = executor.execute(ctx).await;

            let report = if cancel.is_cancelled() {
                None
            } else {
                match result {
                    Ok(data) => Some(RunnerToBroker::TaskDone {
                        task_id: task_id.clone(),
                        data,
                    }),
                    Err(ExecutorError::Cancelled) => None,
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "Task failed");
                        Some(RunnerToBroker::TaskError {
                            task_id: task_id.clone(),
                            error: e.to_payload(),
                        })
                    }
                }
            };

            if let Some(report) = report {
                if outbound.send(report).await.is_err() {
                    warn!(task_id = %task_id, "Connection lost before reporting task result");
                }
            }
            let _ = done_tx.send(task_id);
        });
    }

    /// Drop expired offers and open new ones until every free slot is
    /// covered.
    async fn refresh_offers(&mut self) {
        if !self.registered || self.config.task_types.is_empty() {
            return;
        }

        let now = Instant::now();
        self.open_offers.retain(|_, offer| offer.valid_until > now);

        let wanted = self
            .config
            .max_concurrency
            .saturating_sub(self.tasks.len() + self.open_offers.len());
        if wanted == 0 {
            return;
        }

        let offers: Vec<(OfferId, String, u64)> = {
            let mut rng = rand::thread_rng();
            (0..wanted)
                .map(|_| {
                    let task_type =
                        self.config.task_types[self.next_type % self.config.task_types.len()]
                            .clone();
                    self.next_type = self.next_type.wrapping_add(1);
                    let factor = rng.gen_range((1.0 - OFFER_JITTER)..=(1.0 + OFFER_JITTER));
                    let valid_for = (self.config.offer_valid_for_ms as f64 * factor) as u64;
                    (OfferId::generate(), task_type, valid_for)
                })
                .collect()
        };

        for (offer_id, task_type, valid_for) in offers {
            self.open_offers.insert(
                offer_id.clone(),
                OpenOffer {
                    task_type: task_type.clone(),
                    valid_until: now + std::time::Duration::from_millis(valid_for),
                },
            );
            self.send(RunnerToBroker::TaskOffer {
                offer_id,
                task_type,
                valid_for: valid_for as i64,
            })
            .await;
        }
    }

    async fn shut_down(&mut self) {
        info!(active = self.tasks.len(), "Runner shutting down");
        let tasks: Vec<TaskId> = self.tasks.keys().cloned().collect();
        for task_id in tasks {
            self.send(RunnerToBroker::TaskCancel {
                task_id,
                reason: "runner shutting down".to_string(),
            })
            .await;
        }
        self.abandon_tasks();
    }

    fn abandon_tasks(&mut self) {
        for (_, task) in self.tasks.drain() {
            if let LocalTask::Running { cancel } = task {
                cancel.cancel();
            }
        }
        self.open_offers.clear();
    }

    async fn send(&self, msg: RunnerToBroker) {
        let kind = msg.kind();
        if self.outbound.send(msg).await.is_err() {
            debug!(kind, "Outbound channel closed, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::EchoExecutor;
    use serde_json::json;
    use std::time::Duration;
    use taskbroker_core::RunnerId;

    struct Harness {
        inbound: mpsc::Sender<BrokerToRunner>,
        outbound: mpsc::Receiver<RunnerToBroker>,
        shutdown: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(max_concurrency: usize) -> Harness {
        let config = Arc::new(Config {
            runner_id: RunnerId::new("runner-test"),
            name: "test".to_string(),
            task_types: vec!["code".to_string()],
            max_concurrency,
            offer_valid_for_ms: 60_000,
            offer_refresh_interval_ms: 20,
            ..Config::default()
        });
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let (runner, done_rx) = Runner::new(config, Arc::new(EchoExecutor), out_tx);
        let handle = tokio::spawn(runner.run(in_rx, done_rx, shutdown.clone()));
        Harness {
            inbound: in_tx,
            outbound: out_rx,
            shutdown,
            handle,
        }
    }

    impl Harness {
        async fn push(&self, msg: BrokerToRunner) {
            self.inbound.send(msg).await.unwrap();
        }

        async fn next(&mut self) -> RunnerToBroker {
            tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
                .await
                .expect("timed out waiting for runner message")
                .expect("runner closed its outbound channel")
        }

        /// Register and collect the initial offers.
        async fn register(&mut self, expected_offers: usize) -> Vec<OfferId> {
            self.push(BrokerToRunner::RunnerRegistered).await;
            let mut offers = Vec::new();
            for _ in 0..expected_offers {
                match self.next().await {
                    RunnerToBroker::TaskOffer { offer_id, .. } => offers.push(offer_id),
                    other => panic!("Expected offer, got {other:?}"),
                }
            }
            offers
        }

        async fn accept(&mut self, offer_id: OfferId, task_id: &str) {
            self.push(BrokerToRunner::TaskOfferAccept {
                task_id: TaskId::new(task_id),
                offer_id,
            })
            .await;
            assert_eq!(
                self.next().await,
                RunnerToBroker::TaskAccepted {
                    task_id: TaskId::new(task_id)
                }
            );
        }
    }

    #[tokio::test]
    async fn test_info_request_answered() {
        let mut h = start(1);
        h.push(BrokerToRunner::InfoRequest).await;
        assert_eq!(
            h.next().await,
            RunnerToBroker::Info {
                name: "test".to_string(),
                types: vec!["code".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn test_registration_opens_offer_per_slot() {
        let mut h = start(3);
        h.push(BrokerToRunner::RunnerRegistered).await;

        for _ in 0..3 {
            match h.next().await {
                RunnerToBroker::TaskOffer {
                    task_type,
                    valid_for,
                    ..
                } => {
                    assert_eq!(task_type, "code");
                    assert!((48_000..=72_000).contains(&valid_for));
                }
                other => panic!("Expected offer, got {other:?}"),
            }
        }

        // All slots are covered, so refresh ticks send nothing more.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_task_runs_to_completion() {
        let mut h = start(1);
        let offers = h.register(1).await;
        h.accept(offers[0].clone(), "t1").await;

        h.push(BrokerToRunner::TaskSettings {
            task_id: TaskId::new("t1"),
            settings: json!({"code": "return 1"}),
        })
        .await;

        let request_id = match h.next().await {
            RunnerToBroker::TaskDataRequest { request_id, .. } => request_id,
            other => panic!("Expected data request, got {other:?}"),
        };
        h.push(BrokerToRunner::TaskDataResponse {
            task_id: TaskId::new("t1"),
            request_id,
            data: json!({"items": [1, 2]}),
        })
        .await;

        match h.next().await {
            RunnerToBroker::TaskDone { task_id, data } => {
                assert_eq!(task_id, TaskId::new("t1"));
                assert_eq!(data["input"]["items"][1], 2);
            }
            other => panic!("Expected done, got {other:?}"),
        }

        // The freed slot gets a fresh offer.
        assert!(matches!(h.next().await, RunnerToBroker::TaskOffer { .. }));
    }

    #[tokio::test]
    async fn test_unknown_offer_rejected() {
        let mut h = start(1);
        let offers = h.register(1).await;
        h.accept(offers[0].clone(), "t1").await;

        // The same offer cannot be accepted twice.
        h.push(BrokerToRunner::TaskOfferAccept {
            task_id: TaskId::new("t2"),
            offer_id: offers[0].clone(),
        })
        .await;
        match h.next().await {
            RunnerToBroker::TaskRejected { task_id, .. } => assert_eq!(task_id, TaskId::new("t2")),
            other => panic!("Expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_task_reports_nothing() {
        let mut h = start(1);
        let offers = h.register(1).await;
        h.accept(offers[0].clone(), "t1").await;
        h.push(BrokerToRunner::TaskSettings {
            task_id: TaskId::new("t1"),
            settings: json!({}),
        })
        .await;
        assert!(matches!(
            h.next().await,
            RunnerToBroker::TaskDataRequest { .. }
        ));

        h.push(BrokerToRunner::TaskCancel {
            task_id: TaskId::new("t1"),
            reason: "requester gone".to_string(),
        })
        .await;

        // No result is reported; the slot is offered again instead.
        assert!(matches!(h.next().await, RunnerToBroker::TaskOffer { .. }));
    }

    #[tokio::test]
    async fn test_rpc_error_fails_task() {
        let mut h = start(1);
        let offers = h.register(1).await;
        h.accept(offers[0].clone(), "t1").await;
        h.push(BrokerToRunner::TaskSettings {
            task_id: TaskId::new("t1"),
            settings: json!({"rpc": {"name": "helpers.httpRequest", "params": []}}),
        })
        .await;

        let request_id = match h.next().await {
            RunnerToBroker::TaskDataRequest { request_id, .. } => request_id,
            other => panic!("Expected data request, got {other:?}"),
        };
        h.push(BrokerToRunner::TaskDataResponse {
            task_id: TaskId::new("t1"),
            request_id,
            data: json!(null),
        })
        .await;

        let call_id = match h.next().await {
            RunnerToBroker::Rpc { call_id, name, .. } => {
                assert_eq!(name, "helpers.httpRequest");
                call_id
            }
            other => panic!("Expected rpc, got {other:?}"),
        };
        h.push(BrokerToRunner::RpcResponse {
            call_id,
            task_id: TaskId::new("t1"),
            status: RpcStatus::Error,
            data: json!({"error": "not allowed"}),
        })
        .await;

        match h.next().await {
            RunnerToBroker::TaskError { error, .. } => {
                assert_eq!(error["details"]["error"], "not allowed");
            }
            other => panic!("Expected task error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_cancels_active_tasks() {
        let mut h = start(2);
        let offers = h.register(2).await;
        h.accept(offers[0].clone(), "t1").await;

        h.shutdown.cancel();
        assert_eq!(
            h.next().await,
            RunnerToBroker::TaskCancel {
                task_id: TaskId::new("t1"),
                reason: "runner shutting down".to_string(),
            }
        );
        h.handle.await.unwrap();
    }
}
