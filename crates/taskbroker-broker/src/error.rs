//! Broker errors.

use thiserror::Error;

use taskbroker_core::{CoreError, OfferId, RequestId, RunnerId, TaskId, TaskState};

/// Errors raised while routing a message.
///
/// None of these are fatal to the broker: the connection that sent the
/// offending message logs the error and carries on.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Task {task_id} is not owned by {party}")]
    NotOwner { task_id: TaskId, party: String },

    #[error("Task {task_id} is {state}, expected running")]
    TaskNotRunning { task_id: TaskId, state: TaskState },

    #[error("Runner not registered: {0}")]
    RunnerNotRegistered(RunnerId),

    #[error("Offer {0} was already used")]
    DuplicateOffer(OfferId),

    #[error("Request {0} is already pending")]
    DuplicateRequest(RequestId),

    #[error("Correlation id {id} is already in use on task {task_id}")]
    DuplicateCorrelation { task_id: TaskId, id: String },

    #[error("Correlation id {id} is not pending on task {task_id}")]
    UnknownCorrelation { task_id: TaskId, id: String },

    #[error("Message {0} not allowed before registration")]
    NotRegistered(&'static str),
}
