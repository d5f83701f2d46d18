//! Runner connection service.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use taskbroker_core::RunnerId;
use taskbroker_proto::{BrokerToRunner, RunnerToBroker};

use crate::error::BrokerError;
use crate::registry::{PeerHandle, SessionId};
use crate::service::PeerConnection;
use crate::state::Broker;

/// A runner's connection to the broker.
pub struct RunnerConnection {
    broker: Broker,
    runner_id: RunnerId,
    session: SessionId,
    peer: PeerHandle<BrokerToRunner>,
}

impl RunnerConnection {
    /// Accept a runner connection and ask it to describe itself.
    pub async fn open(broker: Broker, runner_id: RunnerId, tx: mpsc::Sender<BrokerToRunner>) -> Self {
        let session = broker.state().next_session();
        info!(runner_id = %runner_id, session, "Runner connected");
        let peer = PeerHandle::new(tx, CancellationToken::new());
        peer.deliver(BrokerToRunner::InfoRequest);
        Self {
            broker,
            runner_id,
            session,
            peer,
        }
    }

    pub fn runner_id(&self) -> &RunnerId {
        &self.runner_id
    }
}

#[async_trait]
impl PeerConnection for RunnerConnection {
    type Inbound = RunnerToBroker;
    type Outbound = BrokerToRunner;

    fn peer(&self) -> String {
        format!("runner {}", self.runner_id)
    }

    fn closer(&self) -> CancellationToken {
        self.peer.closer.clone()
    }

    async fn handle(&mut self, msg: RunnerToBroker) -> Result<(), BrokerError> {
        let broker = &self.broker;
        let runner_id = &self.runner_id;

        if let Some(info) = msg.runner_info(runner_id) {
            broker
                .register_runner(info, self.session, self.peer.clone())
                .await;
            return Ok(());
        }

        if !broker.state().runners.is_registered(runner_id, self.session).await {
            return Err(BrokerError::NotRegistered(msg.kind()));
        }
        debug!(runner_id = %runner_id, kind = msg.kind(), "Runner message");

        match msg {
            RunnerToBroker::Info { .. } => Ok(()),
            RunnerToBroker::TaskOffer { .. } => match msg.task_offer(runner_id, Utc::now()) {
                Some(offer) => broker.record_offer(offer).await,
                None => Ok(()),
            },
            RunnerToBroker::TaskAccepted { task_id } => {
                broker.task_accepted(runner_id, &task_id).await
            }
            RunnerToBroker::TaskRejected { task_id, reason } => {
                broker.task_rejected(runner_id, &task_id, &reason).await
            }
            RunnerToBroker::TaskDone { task_id, data } => {
                broker.task_done(runner_id, &task_id, data).await
            }
            RunnerToBroker::TaskError { task_id, error } => {
                broker.task_failed(runner_id, &task_id, error).await
            }
            RunnerToBroker::TaskCancel { task_id, reason } => {
                broker.cancel_by_runner(runner_id, &task_id, &reason).await
            }
            RunnerToBroker::TaskDataRequest {
                task_id,
                request_id,
                request_params,
            } => {
                broker
                    .forward_data_request(runner_id, &task_id, request_id, request_params)
                    .await
            }
            RunnerToBroker::Rpc {
                call_id,
                task_id,
                name,
                params,
            } => {
                broker
                    .forward_rpc(runner_id, &task_id, call_id, name, params)
                    .await
            }
        }
    }

    async fn close(self) {
        self.broker
            .runner_disconnected(&self.runner_id, self.session)
            .await;
    }
}
