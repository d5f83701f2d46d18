//! Relay of data requests and RPC calls between a running task and its requester.
//!
//! Correlation ids are preserved in both directions. The broker never
//! synthesizes a response and applies no timeout; runners bound their own
//! waits.

use serde_json::{json, Value};
use tracing::{debug, warn};

use taskbroker_core::{CallId, RequestId, RequesterId, RpcStatus, RunnerId, TaskId, TaskState};
use taskbroker_proto::{BrokerToRequester, BrokerToRunner};

use crate::error::BrokerError;
use crate::state::Broker;

impl Broker {
    /// Forward a runner's data request to the requester.
    pub async fn forward_data_request(
        &self,
        runner_id: &RunnerId,
        task_id: &TaskId,
        request_id: RequestId,
        request_params: Value,
    ) -> Result<(), BrokerError> {
        let slot = self.runner_task(runner_id, task_id).await?;
        {
            let mut entry = slot.lock().await;
            ensure_running(task_id, entry.task.state)?;
            if !entry.pending_data.insert(request_id.clone()) {
                return Err(BrokerError::DuplicateCorrelation {
                    task_id: task_id.clone(),
                    id: request_id.to_string(),
                });
            }
        }
        debug!(task_id = %task_id, request_id = %request_id, "Forwarding data request");

        self.send_to_requester(
            &slot.requester_id,
            BrokerToRequester::TaskDataRequest {
                task_id: task_id.clone(),
                request_id,
                request_params,
            },
        )
        .await;
        Ok(())
    }

    /// Forward a runner's RPC call to the requester.
    ///
    /// Calls outside the allow-list are answered with an error status and
    /// never reach the requester. Only a running task may call at all.
    pub async fn forward_rpc(
        &self,
        runner_id: &RunnerId,
        task_id: &TaskId,
        call_id: CallId,
        name: String,
        params: Vec<Value>,
    ) -> Result<(), BrokerError> {
        let slot = self.runner_task(runner_id, task_id).await?;
        let allowed = self.state.config.rpc_allow_list.check(&name);
        {
            let mut entry = slot.lock().await;
            ensure_running(task_id, entry.task.state)?;
            if allowed.is_ok() && !entry.pending_calls.insert(call_id.clone()) {
                return Err(BrokerError::DuplicateCorrelation {
                    task_id: task_id.clone(),
                    id: call_id.to_string(),
                });
            }
        }

        if let Err(e) = allowed {
            warn!(task_id = %task_id, call_id = %call_id, name = %name, "RPC rejected: not allowed");
            self.send_to_runner(
                runner_id,
                BrokerToRunner::RpcResponse {
                    call_id,
                    task_id: task_id.clone(),
                    status: RpcStatus::Error,
                    data: json!({ "error": e.to_string() }),
                },
            )
            .await;
            return Ok(());
        }
        debug!(task_id = %task_id, call_id = %call_id, name = %name, "Forwarding RPC");

        self.send_to_requester(
            &slot.requester_id,
            BrokerToRequester::Rpc {
                call_id,
                task_id: task_id.clone(),
                name,
                params,
            },
        )
        .await;
        Ok(())
    }

    /// Relay a requester's data response back to the runner.
    pub async fn relay_data_response(
        &self,
        requester_id: &RequesterId,
        task_id: &TaskId,
        request_id: RequestId,
        data: Value,
    ) -> Result<(), BrokerError> {
        let Some(slot) = self.state.tasks.get(task_id).await else {
            debug!(task_id = %task_id, request_id = %request_id, "Dropping data response for unknown task");
            return Ok(());
        };
        if &slot.requester_id != requester_id {
            return Err(BrokerError::NotOwner {
                task_id: task_id.clone(),
                party: requester_id.to_string(),
            });
        }
        {
            let mut entry = slot.lock().await;
            if entry.task.is_terminal() {
                debug!(task_id = %task_id, request_id = %request_id, "Dropping data response for finished task");
                return Ok(());
            }
            if !entry.pending_data.remove(&request_id) {
                return Err(BrokerError::UnknownCorrelation {
                    task_id: task_id.clone(),
                    id: request_id.to_string(),
                });
            }
        }

        self.send_to_runner(
            &slot.runner_id,
            BrokerToRunner::TaskDataResponse {
                task_id: task_id.clone(),
                request_id,
                data,
            },
        )
        .await;
        Ok(())
    }

    /// Relay a requester's RPC response back to the runner.
    pub async fn relay_rpc_response(
        &self,
        requester_id: &RequesterId,
        task_id: &TaskId,
        call_id: CallId,
        status: RpcStatus,
        data: Value,
    ) -> Result<(), BrokerError> {
        let Some(slot) = self.state.tasks.get(task_id).await else {
            debug!(task_id = %task_id, call_id = %call_id, "Dropping RPC response for unknown task");
            return Ok(());
        };
        if &slot.requester_id != requester_id {
            return Err(BrokerError::NotOwner {
                task_id: task_id.clone(),
                party: requester_id.to_string(),
            });
        }
        {
            let mut entry = slot.lock().await;
            if entry.task.is_terminal() {
                debug!(task_id = %task_id, call_id = %call_id, "Dropping RPC response for finished task");
                return Ok(());
            }
            if !entry.pending_calls.remove(&call_id) {
                return Err(BrokerError::UnknownCorrelation {
                    task_id: task_id.clone(),
                    id: call_id.to_string(),
                });
            }
        }

        self.send_to_runner(
            &slot.runner_id,
            BrokerToRunner::RpcResponse {
                call_id,
                task_id: task_id.clone(),
                status,
                data,
            },
        )
        .await;
        Ok(())
    }
}

fn ensure_running(task_id: &TaskId, state: TaskState) -> Result<(), BrokerError> {
    if state == TaskState::Running {
        Ok(())
    } else {
        Err(BrokerError::TaskNotRunning {
            task_id: task_id.clone(),
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::SessionId;
    use chrono::Utc;
    use taskbroker_core::{OfferId, RunnerInfo, TaskOffer};
    use tokio::sync::mpsc::{self, Receiver};

    struct Running {
        broker: Broker,
        runner: Receiver<BrokerToRunner>,
        requester: Receiver<BrokerToRequester>,
        requester_session: SessionId,
        task_id: TaskId,
    }

    fn runner_id() -> RunnerId {
        RunnerId::new("r1")
    }

    fn requester_id() -> RequesterId {
        RequesterId::new("rq")
    }

    async fn running_task() -> Running {
        running_task_with(16).await
    }

    async fn running_task_with(requester_capacity: usize) -> Running {
        let broker = Broker::new(Config::default());
        let (runner_tx, mut runner) = mpsc::channel::<BrokerToRunner>(16);
        let info = RunnerInfo::new(runner_id(), "test").with_task_type("code");
        broker
            .register_runner(info, broker.state().next_session(), runner_tx)
            .await;
        runner.recv().await;

        let (requester_tx, mut requester) = mpsc::channel::<BrokerToRequester>(requester_capacity);
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
        requester.recv().await;
        broker
            .task_settings(&requester_id(), &task_id, json!({}))
            .await
            .unwrap();
        runner.recv().await;

        Running {
            broker,
            runner,
            requester,
            requester_session,
            task_id,
        }
    }

    #[tokio::test]
    async fn test_rpc_round_trip_preserves_ids() {
        let mut t = running_task().await;
        t.broker
            .forward_rpc(
                &runner_id(),
                &t.task_id,
                CallId::new("c1"),
                "helpers.httpRequest".into(),
                vec![json!({"url": "https://example.com"})],
            )
            .await
            .unwrap();

        match t.requester.recv().await {
            Some(BrokerToRequester::Rpc {
                call_id, task_id, ..
            }) => {
                assert_eq!(call_id.as_str(), "c1");
                assert_eq!(task_id, t.task_id);
            }
            other => panic!("Expected rpc, got {other:?}"),
        }

        t.broker
            .relay_rpc_response(
                &requester_id(),
                &t.task_id,
                CallId::new("c1"),
                RpcStatus::Success,
                json!({"status": 200}),
            )
            .await
            .unwrap();
        assert_eq!(
            t.runner.recv().await,
            Some(BrokerToRunner::RpcResponse {
                call_id: CallId::new("c1"),
                task_id: t.task_id.clone(),
                status: RpcStatus::Success,
                data: json!({"status": 200}),
            })
        );

        // Resolved at most once.
        let again = t
            .broker
            .relay_rpc_response(
                &requester_id(),
                &t.task_id,
                CallId::new("c1"),
                RpcStatus::Success,
                json!(null),
            )
            .await;
        assert!(matches!(again, Err(BrokerError::UnknownCorrelation { .. })));
    }

    #[tokio::test]
    async fn test_disallowed_rpc_answered_with_error() {
        let mut t = running_task().await;
        t.broker
            .forward_rpc(
                &runner_id(),
                &t.task_id,
                CallId::new("c1"),
                "process.exit".into(),
                vec![],
            )
            .await
            .unwrap();

        match t.runner.recv().await {
            Some(BrokerToRunner::RpcResponse { status, call_id, .. }) => {
                assert_eq!(status, RpcStatus::Error);
                assert_eq!(call_id.as_str(), "c1");
            }
            other => panic!("Expected rpc response, got {other:?}"),
        }
        assert!(t.requester.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_data_request_round_trip() {
        let mut t = running_task().await;
        t.broker
            .forward_data_request(&runner_id(), &t.task_id, RequestId::new("d1"), json!({"input": true}))
            .await
            .unwrap();
        assert!(matches!(
            t.requester.recv().await,
            Some(BrokerToRequester::TaskDataRequest { .. })
        ));

        let duplicate = t
            .broker
            .forward_data_request(&runner_id(), &t.task_id, RequestId::new("d1"), json!({}))
            .await;
        assert!(matches!(duplicate, Err(BrokerError::DuplicateCorrelation { .. })));

        t.broker
            .relay_data_response(&requester_id(), &t.task_id, RequestId::new("d1"), json!([1, 2]))
            .await
            .unwrap();
        match t.runner.recv().await {
            Some(BrokerToRunner::TaskDataResponse { request_id, data, .. }) => {
                assert_eq!(request_id.as_str(), "d1");
                assert_eq!(data, json!([1, 2]));
            }
            other => panic!("Expected data response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_late_response_after_cancel_is_dropped() {
        let mut t = running_task().await;
        t.broker
            .forward_data_request(&runner_id(), &t.task_id, RequestId::new("d1"), json!({}))
            .await
            .unwrap();
        t.requester.recv().await;

        t.broker
            .requester_disconnected(&requester_id(), t.requester_session)
            .await;
        t.runner.recv().await;

        t.broker
            .relay_data_response(&requester_id(), &t.task_id, RequestId::new("d1"), json!({}))
            .await
            .unwrap();
        assert!(t.runner.try_recv().is_err());

        // Unknown tasks are dropped silently too.
        t.broker
            .relay_rpc_response(
                &requester_id(),
                &TaskId::new("nope"),
                CallId::new("c"),
                RpcStatus::Success,
                json!(null),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rpc_needs_running_task() {
        let t = running_task().await;
        t.broker
            .task_done(&runner_id(), &t.task_id, json!(null))
            .await
            .unwrap();

        let result = t
            .broker
            .forward_rpc(
                &runner_id(),
                &t.task_id,
                CallId::new("c1"),
                "logNodeOutput".into(),
                vec![],
            )
            .await;
        assert!(matches!(result, Err(BrokerError::TaskNotRunning { .. })));
    }

    #[tokio::test]
    async fn test_disallowed_rpc_needs_running_task() {
        let mut t = running_task().await;
        t.broker
            .task_done(&runner_id(), &t.task_id, json!(null))
            .await
            .unwrap();
        t.requester.recv().await;

        let result = t
            .broker
            .forward_rpc(
                &runner_id(),
                &t.task_id,
                CallId::new("c1"),
                "process.exit".into(),
                vec![],
            )
            .await;
        assert!(matches!(result, Err(BrokerError::TaskNotRunning { .. })));
        assert!(t.runner.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_nothing_relayed_after_requester_cancel() {
        let mut t = running_task().await;
        t.broker
            .cancel_by_requester(&requester_id(), &t.task_id, "no longer needed")
            .await
            .unwrap();
        assert!(matches!(
            t.runner.recv().await,
            Some(BrokerToRunner::TaskCancel { .. })
        ));

        let rpc = t
            .broker
            .forward_rpc(
                &runner_id(),
                &t.task_id,
                CallId::new("c1"),
                "logNodeOutput".into(),
                vec![],
            )
            .await;
        assert!(matches!(
            rpc,
            Err(BrokerError::TaskNotRunning {
                state: TaskState::Cancelled,
                ..
            })
        ));

        let data = t
            .broker
            .forward_data_request(&runner_id(), &t.task_id, RequestId::new("d1"), json!({}))
            .await;
        assert!(matches!(data, Err(BrokerError::TaskNotRunning { .. })));

        assert!(t.requester.try_recv().is_err());
        assert!(t.runner.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_requester_that_stops_reading_is_dropped() {
        let mut t = running_task_with(1).await;
        let peer = t
            .broker
            .state()
            .requesters
            .sender(&requester_id())
            .await
            .unwrap();

        // The requester never reads again; relaying must not wait on it.
        let relay = async {
            t.broker
                .forward_data_request(&runner_id(), &t.task_id, RequestId::new("d1"), json!({}))
                .await
                .unwrap();
            t.broker
                .forward_rpc(
                    &runner_id(),
                    &t.task_id,
                    CallId::new("c1"),
                    "logNodeOutput".into(),
                    vec![],
                )
                .await
                .unwrap();
        };
        tokio::time::timeout(std::time::Duration::from_secs(1), relay)
            .await
            .expect("relay must not wait on a full queue");
        assert!(peer.closer.is_cancelled());

        // Dropping the connection cancels its task on the runner.
        t.broker
            .requester_disconnected(&requester_id(), t.requester_session)
            .await;
        assert!(matches!(
            t.runner.recv().await,
            Some(BrokerToRunner::TaskCancel { .. })
        ));
        assert!(!t.broker.state().requesters.contains(&requester_id()).await);
    }
}
