//! Task lifecycle after the match: settings, completion, cancellation and
//! the cleanup that follows a disconnect.

use serde_json::Value;
use tracing::{info, warn};

use taskbroker_core::{FailureCode, RequesterId, RunnerId, TaskFailure, TaskId, TaskState};
use taskbroker_proto::{BrokerToRequester, BrokerToRunner};

use crate::error::BrokerError;
use crate::registry::SessionId;
use crate::state::Broker;

impl Broker {
    /// Requester sent settings; the task starts running on the runner.
    pub async fn task_settings(
        &self,
        requester_id: &RequesterId,
        task_id: &TaskId,
        settings: Value,
    ) -> Result<(), BrokerError> {
        let slot = self.requester_task(requester_id, task_id).await?;
        slot.lock().await.task.transition(TaskState::Running)?;
        info!(task_id = %task_id, runner_id = %slot.runner_id, "Task running");

        let msg = BrokerToRunner::TaskSettings {
            task_id: task_id.clone(),
            settings,
        };
        if !self.send_to_runner(&slot.runner_id, msg).await {
            let failed = {
                let mut entry = slot.lock().await;
                let failed = entry.task.fail(FailureCode::RunnerUnavailable.message());
                entry.clear_pending();
                failed
            };
            if failed.is_ok() {
                warn!(task_id = %task_id, runner_id = %slot.runner_id, "Runner unavailable for settings");
                let failure = TaskFailure::new(FailureCode::RunnerUnavailable, slot.request_id.clone());
                self.send_to_requester(
                    requester_id,
                    BrokerToRequester::failure(task_id.clone(), &failure),
                )
                .await;
            }
        }
        Ok(())
    }

    /// Runner finished the task.
    pub async fn task_done(
        &self,
        runner_id: &RunnerId,
        task_id: &TaskId,
        data: Value,
    ) -> Result<(), BrokerError> {
        let slot = self.runner_task(runner_id, task_id).await?;
        {
            let mut entry = slot.lock().await;
            entry.task.transition(TaskState::Done)?;
            entry.clear_pending();
        }
        info!(task_id = %task_id, runner_id = %runner_id, "Task done");

        self.send_to_requester(
            &slot.requester_id,
            BrokerToRequester::TaskDone {
                task_id: task_id.clone(),
                data,
            },
        )
        .await;
        Ok(())
    }

    /// Runner reported an execution error, forwarded verbatim.
    pub async fn task_failed(
        &self,
        runner_id: &RunnerId,
        task_id: &TaskId,
        error: Value,
    ) -> Result<(), BrokerError> {
        let slot = self.runner_task(runner_id, task_id).await?;
        {
            let mut entry = slot.lock().await;
            if entry.task.state != TaskState::Running {
                return Err(BrokerError::TaskNotRunning {
                    task_id: task_id.clone(),
                    state: entry.task.state,
                });
            }
            entry.task.fail(error_reason(&error))?;
            entry.clear_pending();
        }
        info!(task_id = %task_id, runner_id = %runner_id, "Task errored");

        self.send_to_requester(
            &slot.requester_id,
            BrokerToRequester::TaskError {
                task_id: task_id.clone(),
                error,
            },
        )
        .await;
        Ok(())
    }

    /// Requester cancelled the task; the runner is told to stop.
    pub async fn cancel_by_requester(
        &self,
        requester_id: &RequesterId,
        task_id: &TaskId,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let slot = self.requester_task(requester_id, task_id).await?;
        {
            let mut entry = slot.lock().await;
            entry.task.cancel(reason)?;
            entry.clear_pending();
        }
        info!(task_id = %task_id, requester_id = %requester_id, reason, "Task cancelled by requester");

        self.send_to_runner(
            &slot.runner_id,
            BrokerToRunner::TaskCancel {
                task_id: task_id.clone(),
                reason: reason.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Runner cancelled the task; the requester sees a task error.
    pub async fn cancel_by_runner(
        &self,
        runner_id: &RunnerId,
        task_id: &TaskId,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let slot = self.runner_task(runner_id, task_id).await?;
        {
            let mut entry = slot.lock().await;
            entry.task.cancel(reason)?;
            entry.clear_pending();
        }
        info!(task_id = %task_id, runner_id = %runner_id, reason, "Task cancelled by runner");

        let failure = TaskFailure::new(FailureCode::CancelledByRunner, slot.request_id.clone())
            .with_message(reason);
        self.send_to_requester(
            &slot.requester_id,
            BrokerToRequester::failure(task_id.clone(), &failure),
        )
        .await;
        Ok(())
    }

    /// Handle a runner connection closing.
    pub async fn runner_disconnected(&self, runner_id: &RunnerId, session: SessionId) {
        if self.state.runners.remove(runner_id, session).await.is_some() {
            info!(runner_id = %runner_id, "Runner disconnected");
            self.release_runner(runner_id).await;
        }
    }

    /// Invalidate a runner's offers and fail every task assigned to it.
    pub(crate) async fn release_runner(&self, runner_id: &RunnerId) {
        let offers = self.state.offers.remove_runner_offers(runner_id).await;

        let mut failed = Vec::new();
        for slot in self.state.tasks.owned_by_runner(runner_id).await {
            let mut entry = slot.lock().await;
            if !entry.task.state.has_runner() {
                continue;
            }
            if entry
                .task
                .fail(FailureCode::RunnerDisconnected.message())
                .is_ok()
            {
                entry.clear_pending();
                failed.push(slot.clone());
            }
        }

        info!(
            runner_id = %runner_id,
            offers = offers.len(),
            tasks = failed.len(),
            "Released runner"
        );

        for slot in failed {
            warn!(task_id = %slot.id, runner_id = %runner_id, "Task failed: runner disconnected");
            let failure = TaskFailure::new(FailureCode::RunnerDisconnected, slot.request_id.clone());
            self.send_to_requester(
                &slot.requester_id,
                BrokerToRequester::failure(slot.id.clone(), &failure),
            )
            .await;
        }
    }

    /// Handle a requester connection closing.
    pub async fn requester_disconnected(&self, requester_id: &RequesterId, session: SessionId) {
        if self.state.requesters.remove(requester_id, session).await {
            info!(requester_id = %requester_id, "Requester disconnected");
            self.release_requester(requester_id).await;
        }
    }

    /// Withdraw a requester's queued requests and cancel its tasks.
    pub(crate) async fn release_requester(&self, requester_id: &RequesterId) {
        let withdrawn = self
            .state
            .offers
            .remove_requester_requests(requester_id)
            .await;

        let reason = FailureCode::RequesterDisconnected.message();
        let mut cancelled = Vec::new();
        for slot in self.state.tasks.owned_by_requester(requester_id).await {
            let mut entry = slot.lock().await;
            if entry.task.is_terminal() {
                continue;
            }
            if entry.task.cancel(reason).is_ok() {
                entry.clear_pending();
                cancelled.push(slot.clone());
            }
        }

        info!(
            requester_id = %requester_id,
            requests = withdrawn.len(),
            tasks = cancelled.len(),
            "Released requester"
        );

        for slot in cancelled {
            self.send_to_runner(
                &slot.runner_id,
                BrokerToRunner::TaskCancel {
                    task_id: slot.id.clone(),
                    reason: reason.to_string(),
                },
            )
            .await;
        }
    }
}

/// Short description of a runner-reported error for the task record.
fn error_reason(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::Utc;
    use serde_json::json;
    use taskbroker_core::{OfferId, RequestId, RunnerInfo, TaskOffer};
    use tokio::sync::mpsc::{self, Receiver};

    struct Fixture {
        broker: Broker,
        runner: Receiver<BrokerToRunner>,
        requester: Receiver<BrokerToRequester>,
        runner_session: SessionId,
        requester_session: SessionId,
        task_id: TaskId,
    }

    fn runner_id() -> RunnerId {
        RunnerId::new("r1")
    }

    fn requester_id() -> RequesterId {
        RequesterId::new("rq")
    }

    /// A broker with one task matched and accepted (READY).
    async fn ready_task() -> Fixture {
        let broker = Broker::new(Config::default());

        let (runner_tx, mut runner) = mpsc::channel::<BrokerToRunner>(16);
        let runner_session = broker.state().next_session();
        let info = RunnerInfo::new(runner_id(), "test").with_task_type("code");
        broker.register_runner(info, runner_session, runner_tx).await;
        assert_eq!(runner.recv().await, Some(BrokerToRunner::RunnerRegistered));

        let (requester_tx, mut requester) = mpsc::channel::<BrokerToRequester>(16);
        let requester_session = broker.state().next_session();
        broker
            .state()
            .requesters
            .register(requester_id(), requester_session, requester_tx)
            .await;

        let offer = TaskOffer::valid_for(OfferId::new("o1"), runner_id(), "code", 10_000, Utc::now());
        broker.record_offer(offer).await.unwrap();
        broker
            .submit_request(requester_id(), RequestId::new("req"), "code".into())
            .await
            .unwrap();

        let task_id = match runner.recv().await {
            Some(BrokerToRunner::TaskOfferAccept { task_id, .. }) => task_id,
            other => panic!("Expected offer accept, got {other:?}"),
        };
        broker.task_accepted(&runner_id(), &task_id).await.unwrap();
        assert!(matches!(
            requester.recv().await,
            Some(BrokerToRequester::TaskReady { .. })
        ));

        Fixture {
            broker,
            runner,
            requester,
            runner_session,
            requester_session,
            task_id,
        }
    }

    async fn state_of(f: &Fixture) -> TaskState {
        f.broker.state().tasks.get(&f.task_id).await.unwrap().state().await
    }

    #[tokio::test]
    async fn test_settings_then_done() {
        let mut f = ready_task().await;
        f.broker
            .task_settings(&requester_id(), &f.task_id, json!({"code": "return 1"}))
            .await
            .unwrap();
        assert!(matches!(
            f.runner.recv().await,
            Some(BrokerToRunner::TaskSettings { .. })
        ));

        f.broker
            .task_done(&runner_id(), &f.task_id, json!({"result": 1}))
            .await
            .unwrap();
        match f.requester.recv().await {
            Some(BrokerToRequester::TaskDone { task_id, data }) => {
                assert_eq!(task_id, f.task_id);
                assert_eq!(data["result"], 1);
            }
            other => panic!("Expected task done, got {other:?}"),
        }

        let task = f.broker.state().tasks.get(&f.task_id).await.unwrap().snapshot().await;
        assert_eq!(
            task.state_path(),
            vec![
                TaskState::PendingRequest,
                TaskState::OfferAccepted,
                TaskState::Ready,
                TaskState::Running,
                TaskState::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_done_before_settings_is_refused() {
        let f = ready_task().await;
        let result = f.broker.task_done(&runner_id(), &f.task_id, json!(null)).await;
        assert!(result.is_err());
        assert_eq!(state_of(&f).await, TaskState::Ready);
    }

    #[tokio::test]
    async fn test_error_forwarded_verbatim() {
        let mut f = ready_task().await;
        f.broker
            .task_settings(&requester_id(), &f.task_id, json!({}))
            .await
            .unwrap();
        let error = json!({"message": "boom", "stack": "at line 1"});
        f.broker
            .task_failed(&runner_id(), &f.task_id, error.clone())
            .await
            .unwrap();

        match f.requester.recv().await {
            Some(BrokerToRequester::TaskError { error: got, .. }) => assert_eq!(got, error),
            other => panic!("Expected task error, got {other:?}"),
        }
        let task = f.broker.state().tasks.get(&f.task_id).await.unwrap().snapshot().await;
        assert_eq!(task.reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_requester_cancel_reaches_runner() {
        let mut f = ready_task().await;
        f.broker
            .cancel_by_requester(&requester_id(), &f.task_id, "user abort")
            .await
            .unwrap();

        assert_eq!(
            f.runner.recv().await,
            Some(BrokerToRunner::TaskCancel {
                task_id: f.task_id.clone(),
                reason: "user abort".to_string(),
            })
        );
        assert_eq!(state_of(&f).await, TaskState::Cancelled);

        // Terminal: nothing moves it again.
        assert!(f
            .broker
            .cancel_by_runner(&runner_id(), &f.task_id, "again")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_runner_cancel_reaches_requester() {
        let mut f = ready_task().await;
        f.broker
            .cancel_by_runner(&runner_id(), &f.task_id, "shutting down")
            .await
            .unwrap();

        match f.requester.recv().await {
            Some(BrokerToRequester::TaskError { error, .. }) => {
                assert_eq!(error["code"], "cancelled_by_runner");
                assert_eq!(error["message"], "shutting down");
            }
            other => panic!("Expected task error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_runner_disconnect_fails_task_once() {
        let mut f = ready_task().await;
        f.broker
            .task_settings(&requester_id(), &f.task_id, json!({}))
            .await
            .unwrap();

        f.broker.runner_disconnected(&runner_id(), f.runner_session).await;
        // A second close of the same session is a no-op.
        f.broker.runner_disconnected(&runner_id(), f.runner_session).await;

        match f.requester.recv().await {
            Some(BrokerToRequester::TaskError { error, .. }) => {
                assert_eq!(error["code"], "runner_disconnected");
                assert_eq!(error["requestId"], "req");
            }
            other => panic!("Expected task error, got {other:?}"),
        }
        assert!(f.requester.try_recv().is_err());
        assert_eq!(state_of(&f).await, TaskState::Errored);
    }

    #[tokio::test]
    async fn test_requester_disconnect_cancels_task() {
        let mut f = ready_task().await;
        f.broker
            .requester_disconnected(&requester_id(), f.requester_session)
            .await;

        match f.runner.recv().await {
            Some(BrokerToRunner::TaskCancel { reason, .. }) => {
                assert_eq!(reason, FailureCode::RequesterDisconnected.message());
            }
            other => panic!("Expected task cancel, got {other:?}"),
        }
        assert_eq!(state_of(&f).await, TaskState::Cancelled);
    }

    #[test]
    fn test_error_reason_prefers_message() {
        assert_eq!(error_reason(&json!("plain")), "plain");
        assert_eq!(error_reason(&json!({"message": "m"})), "m");
        assert_eq!(error_reason(&json!(42)), "42");
    }
}
