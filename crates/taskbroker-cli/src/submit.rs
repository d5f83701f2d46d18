//! Requester side of a single task submission.

use serde_json::{json, Value};

use taskbroker_core::{RequestId, RpcStatus, TaskId};
use taskbroker_proto::{BrokerToRequester, RequesterToBroker};

/// How a submission ended.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    Done(Value),
    Failed(Value),
}

/// What to do after a broker message.
#[derive(Debug, PartialEq)]
pub enum Step {
    Reply(RequesterToBroker),
    Wait,
    Finished(Outcome),
}

/// Tracks one request from submission to its result.
pub struct Submission {
    request_id: RequestId,
    task_type: String,
    settings: Value,
    data: Value,
    task_id: Option<TaskId>,
}

impl Submission {
    pub fn new(task_type: impl Into<String>, settings: Value, data: Value) -> Self {
        Self {
            request_id: RequestId::generate(),
            task_type: task_type.into(),
            settings,
            data,
            task_id: None,
        }
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        self.task_id.as_ref()
    }

    /// The opening `requester:taskrequest`.
    pub fn request(&self) -> RequesterToBroker {
        RequesterToBroker::TaskRequest {
            request_id: self.request_id.clone(),
            task_type: self.task_type.clone(),
        }
    }

    /// Message that abandons the submission in its current phase.
    pub fn cancel(&self, reason: &str) -> RequesterToBroker {
        match &self.task_id {
            Some(task_id) => RequesterToBroker::TaskCancel {
                task_id: task_id.clone(),
                reason: reason.to_string(),
            },
            None => RequesterToBroker::RequestCancel {
                request_id: self.request_id.clone(),
                reason: reason.to_string(),
            },
        }
    }

    fn is_ours(&self, task_id: &TaskId) -> bool {
        self.task_id.as_ref() == Some(task_id)
    }

    pub fn on_message(&mut self, msg: BrokerToRequester) -> Step {
        match msg {
            BrokerToRequester::TaskReady {
                request_id,
                task_id,
            } if request_id == self.request_id => {
                self.task_id = Some(task_id.clone());
                Step::Reply(RequesterToBroker::TaskSettings {
                    task_id,
                    settings: self.settings.clone(),
                })
            }
            BrokerToRequester::RequestError { request_id, error } if request_id == self.request_id => {
                Step::Finished(Outcome::Failed(error))
            }
            BrokerToRequester::TaskDone { task_id, data } if self.is_ours(&task_id) => {
                Step::Finished(Outcome::Done(data))
            }
            BrokerToRequester::TaskError { task_id, error } if self.is_ours(&task_id) => {
                Step::Finished(Outcome::Failed(error))
            }
            BrokerToRequester::TaskDataRequest {
                task_id,
                request_id,
                ..
            } if self.is_ours(&task_id) => Step::Reply(RequesterToBroker::TaskDataResponse {
                task_id,
                request_id,
                data: self.data.clone(),
            }),
            BrokerToRequester::Rpc {
                call_id,
                task_id,
                name,
                ..
            } if self.is_ours(&task_id) => Step::Reply(RequesterToBroker::RpcResponse {
                task_id,
                call_id,
                status: RpcStatus::Error,
                data: json!({ "error": format!("{name} is not supported by the cli") }),
            }),
            _ => Step::Wait,
        }
    }
}
