//! Requester connection service.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskbroker_core::RequesterId;
use taskbroker_proto::{BrokerToRequester, RequesterToBroker};

use crate::error::BrokerError;
use crate::registry::{PeerHandle, SessionId};
use crate::service::PeerConnection;
use crate::state::Broker;

/// A requester's connection to the broker.
pub struct RequesterConnection {
    broker: Broker,
    requester_id: RequesterId,
    session: SessionId,
    closer: CancellationToken,
}

impl RequesterConnection {
    /// Register a requester connection.
    ///
    /// A previous connection under the same id is treated as disconnected.
    pub async fn open(
        broker: Broker,
        requester_id: RequesterId,
        tx: mpsc::Sender<BrokerToRequester>,
    ) -> Self {
        let session = broker.state().next_session();
        info!(requester_id = %requester_id, session, "Requester connected");

        let closer = CancellationToken::new();
        let previous = broker
            .state()
            .requesters
            .register(requester_id.clone(), session, PeerHandle::new(tx, closer.clone()))
            .await;
        if let Some(previous) = previous {
            warn!(
                requester_id = %requester_id,
                previous_session = previous.session,
                "Requester reconnected, releasing previous connection"
            );
            previous.peer.closer.cancel();
            broker.release_requester(&requester_id).await;
        }

        Self {
            broker,
            requester_id,
            session,
            closer,
        }
    }

    pub fn requester_id(&self) -> &RequesterId {
        &self.requester_id
    }
}

#[async_trait]
impl PeerConnection for RequesterConnection {
    type Inbound = RequesterToBroker;
    type Outbound = BrokerToRequester;

    fn peer(&self) -> String {
        format!("requester {}", self.requester_id)
    }

    fn closer(&self) -> CancellationToken {
        self.closer.clone()
    }

    async fn handle(&mut self, msg: RequesterToBroker) -> Result<(), BrokerError> {
        let broker = &self.broker;
        let requester_id = &self.requester_id;

        if !broker
            .state()
            .requesters
            .is_registered(requester_id, self.session)
            .await
        {
            return Err(BrokerError::NotRegistered(msg.kind()));
        }
        debug!(requester_id = %requester_id, kind = msg.kind(), "Requester message");

        match msg {
            RequesterToBroker::TaskRequest {
                request_id,
                task_type,
            } => {
                broker
                    .submit_request(requester_id.clone(), request_id, task_type)
                    .await
            }
            RequesterToBroker::TaskSettings { task_id, settings } => {
                broker.task_settings(requester_id, &task_id, settings).await
            }
            RequesterToBroker::TaskCancel { task_id, reason } => {
                broker
                    .cancel_by_requester(requester_id, &task_id, &reason)
                    .await
            }
            RequesterToBroker::RequestCancel { request_id, reason } => {
                broker
                    .withdraw_request(requester_id, &request_id, &reason)
                    .await
            }
            RequesterToBroker::TaskDataResponse {
                task_id,
                request_id,
                data,
            } => {
                broker
                    .relay_data_response(requester_id, &task_id, request_id, data)
                    .await
            }
            RequesterToBroker::RpcResponse {
                task_id,
                call_id,
                status,
                data,
            } => {
                broker
                    .relay_rpc_response(requester_id, &task_id, call_id, status, data)
                    .await
            }
        }
    }

    async fn close(self) {
        self.broker
            .requester_disconnected(&self.requester_id, self.session)
            .await;
    }
}
