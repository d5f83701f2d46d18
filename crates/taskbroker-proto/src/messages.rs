//! The four protocol message families.
//!
//! Each family is a closed enum tagged by `type`, so every dispatch site
//! matches exhaustively and a new message kind is a compile-checked change.
//! Payloads the broker only forwards (`settings`, `data`, RPC `params`,
//! errors) are kept as opaque JSON values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskbroker_core::{CallId, OfferId, RequestId, RpcStatus, TaskId};

/// Messages sent by the broker to a runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BrokerToRunner {
    /// Ask a freshly connected runner to describe itself.
    #[serde(rename = "broker:inforequest")]
    InfoRequest,

    /// Registration acknowledged.
    #[serde(rename = "broker:runnerregistered")]
    RunnerRegistered,

    /// One of the runner's offers was matched to a request.
    #[serde(rename = "broker:taskofferaccept", rename_all = "camelCase")]
    TaskOfferAccept { task_id: TaskId, offer_id: OfferId },

    /// Stop working on a task.
    #[serde(rename = "broker:taskcancel", rename_all = "camelCase")]
    TaskCancel { task_id: TaskId, reason: String },

    /// Settings pushed by the requester.
    #[serde(rename = "broker:tasksettings", rename_all = "camelCase")]
    TaskSettings { task_id: TaskId, settings: Value },

    /// Requester's answer to an RPC call.
    #[serde(rename = "broker:rpcresponse", rename_all = "camelCase")]
    RpcResponse {
        call_id: CallId,
        task_id: TaskId,
        status: RpcStatus,
        data: Value,
    },

    /// Requester's answer to a data request.
    #[serde(rename = "broker:taskdataresponse", rename_all = "camelCase")]
    TaskDataResponse {
        task_id: TaskId,
        request_id: RequestId,
        data: Value,
    },

    /// Node type descriptions the runner may need.
    #[serde(rename = "broker:nodetypes", rename_all = "camelCase")]
    NodeTypes { node_types: Value },
}

/// Messages sent by the broker to a requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BrokerToRequester {
    /// A runner accepted the request; settings may now be sent.
    #[serde(rename = "broker:taskready", rename_all = "camelCase")]
    TaskReady { request_id: RequestId, task_id: TaskId },

    /// The task finished.
    #[serde(rename = "broker:taskdone", rename_all = "camelCase")]
    TaskDone { task_id: TaskId, data: Value },

    /// The task failed, either on the runner or in the broker.
    #[serde(rename = "broker:taskerror", rename_all = "camelCase")]
    TaskError { task_id: TaskId, error: Value },

    /// The runner needs data for the task.
    #[serde(rename = "broker:taskdatarequest", rename_all = "camelCase")]
    TaskDataRequest {
        task_id: TaskId,
        request_id: RequestId,
        request_params: Value,
    },

    /// The runner is calling a procedure on the requester.
    #[serde(rename = "broker:rpc", rename_all = "camelCase")]
    Rpc {
        call_id: CallId,
        task_id: TaskId,
        name: String,
        params: Vec<Value>,
    },

    /// A request failed before it was matched to any runner.
    #[serde(rename = "broker:requesterror", rename_all = "camelCase")]
    RequestError { request_id: RequestId, error: Value },
}

/// Messages sent by a runner to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunnerToBroker {
    /// Answer to the info request.
    #[serde(rename = "runner:info")]
    Info { name: String, types: Vec<String> },

    /// Capacity for one task of `task_type`, valid for `valid_for` ms.
    #[serde(rename = "runner:taskoffer", rename_all = "camelCase")]
    TaskOffer {
        offer_id: OfferId,
        task_type: String,
        valid_for: i64,
    },

    #[serde(rename = "runner:taskaccepted", rename_all = "camelCase")]
    TaskAccepted { task_id: TaskId },

    #[serde(rename = "runner:taskrejected", rename_all = "camelCase")]
    TaskRejected { task_id: TaskId, reason: String },

    #[serde(rename = "runner:taskdone", rename_all = "camelCase")]
    TaskDone { task_id: TaskId, data: Value },

    #[serde(rename = "runner:taskerror", rename_all = "camelCase")]
    TaskError { task_id: TaskId, error: Value },

    #[serde(rename = "runner:taskcancel", rename_all = "camelCase")]
    TaskCancel { task_id: TaskId, reason: String },

    #[serde(rename = "runner:taskdatarequest", rename_all = "camelCase")]
    TaskDataRequest {
        task_id: TaskId,
        request_id: RequestId,
        request_params: Value,
    },

    #[serde(rename = "runner:rpc", rename_all = "camelCase")]
    Rpc {
        call_id: CallId,
        task_id: TaskId,
        name: String,
        params: Vec<Value>,
    },
}

/// Messages sent by a requester to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RequesterToBroker {
    #[serde(rename = "requester:taskrequest", rename_all = "camelCase")]
    TaskRequest {
        request_id: RequestId,
        task_type: String,
    },

    #[serde(rename = "requester:tasksettings", rename_all = "camelCase")]
    TaskSettings { task_id: TaskId, settings: Value },

    #[serde(rename = "requester:taskcancel", rename_all = "camelCase")]
    TaskCancel { task_id: TaskId, reason: String },

    /// Withdraw a request that may not have been matched yet.
    #[serde(rename = "requester:requestcancel", rename_all = "camelCase")]
    RequestCancel { request_id: RequestId, reason: String },

    #[serde(rename = "requester:taskdataresponse", rename_all = "camelCase")]
    TaskDataResponse {
        task_id: TaskId,
        request_id: RequestId,
        data: Value,
    },

    #[serde(rename = "requester:rpcresponse", rename_all = "camelCase")]
    RpcResponse {
        task_id: TaskId,
        call_id: CallId,
        status: RpcStatus,
        data: Value,
    },
}

impl BrokerToRunner {
    /// Wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InfoRequest => "broker:inforequest",
            Self::RunnerRegistered => "broker:runnerregistered",
            Self::TaskOfferAccept { .. } => "broker:taskofferaccept",
            Self::TaskCancel { .. } => "broker:taskcancel",
            Self::TaskSettings { .. } => "broker:tasksettings",
            Self::RpcResponse { .. } => "broker:rpcresponse",
            Self::TaskDataResponse { .. } => "broker:taskdataresponse",
            Self::NodeTypes { .. } => "broker:nodetypes",
        }
    }
}

impl BrokerToRequester {
    /// Wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskReady { .. } => "broker:taskready",
            Self::TaskDone { .. } => "broker:taskdone",
            Self::TaskError { .. } => "broker:taskerror",
            Self::TaskDataRequest { .. } => "broker:taskdatarequest",
            Self::Rpc { .. } => "broker:rpc",
            Self::RequestError { .. } => "broker:requesterror",
        }
    }

    /// Task this message is about, if it concerns a matched task.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::TaskReady { task_id, .. }
            | Self::TaskDone { task_id, .. }
            | Self::TaskError { task_id, .. }
            | Self::TaskDataRequest { task_id, .. }
            | Self::Rpc { task_id, .. } => Some(task_id),
            Self::RequestError { .. } => None,
        }
    }
}

impl RunnerToBroker {
    /// Wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Info { .. } => "runner:info",
            Self::TaskOffer { .. } => "runner:taskoffer",
            Self::TaskAccepted { .. } => "runner:taskaccepted",
            Self::TaskRejected { .. } => "runner:taskrejected",
            Self::TaskDone { .. } => "runner:taskdone",
            Self::TaskError { .. } => "runner:taskerror",
            Self::TaskCancel { .. } => "runner:taskcancel",
            Self::TaskDataRequest { .. } => "runner:taskdatarequest",
            Self::Rpc { .. } => "runner:rpc",
        }
    }
}

impl RequesterToBroker {
    /// Wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskRequest { .. } => "requester:taskrequest",
            Self::TaskSettings { .. } => "requester:tasksettings",
            Self::TaskCancel { .. } => "requester:taskcancel",
            Self::RequestCancel { .. } => "requester:requestcancel",
            Self::TaskDataResponse { .. } => "requester:taskdataresponse",
            Self::RpcResponse { .. } => "requester:rpcresponse",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_runner_offer_parsing() {
        let json = r#"{"type":"runner:taskoffer","offerId":"o-1","taskType":"code","validFor":5000}"#;
        let msg: RunnerToBroker = serde_json::from_str(json).unwrap();

        assert_eq!(
            msg,
            RunnerToBroker::TaskOffer {
                offer_id: OfferId::new("o-1"),
                task_type: "code".to_string(),
                valid_for: 5000,
            }
        );
    }

    #[test]
    fn test_unit_variant_serialization() {
        let json = serde_json::to_string(&BrokerToRunner::InfoRequest).unwrap();
        assert_eq!(json, r#"{"type":"broker:inforequest"}"#);
    }

    #[test]
    fn test_rpc_response_field_names() {
        let msg = BrokerToRunner::RpcResponse {
            call_id: CallId::new("c-1"),
            task_id: TaskId::new("t-1"),
            status: RpcStatus::Error,
            data: json!("nope"),
        };
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], "broker:rpcresponse");
        assert_eq!(value["callId"], "c-1");
        assert_eq!(value["taskId"], "t-1");
        assert_eq!(value["status"], "error");
    }

    #[test]
    fn test_requester_data_response_parsing() {
        let json = r#"{"type":"requester:taskdataresponse","taskId":"t","requestId":"d-1","data":{"items":[1,2]}}"#;
        let msg: RequesterToBroker = serde_json::from_str(json).unwrap();

        if let RequesterToBroker::TaskDataResponse {
            task_id,
            request_id,
            data,
        } = msg
        {
            assert_eq!(task_id.as_str(), "t");
            assert_eq!(request_id.as_str(), "d-1");
            assert_eq!(data["items"][1], 2);
        } else {
            panic!("Expected data response");
        }
    }

    #[test]
    fn test_tag_from_other_family_rejected() {
        let json = r#"{"type":"broker:taskready","requestId":"r","taskId":"t"}"#;
        assert!(serde_json::from_str::<RequesterToBroker>(json).is_err());
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let msg = RunnerToBroker::Rpc {
            call_id: CallId::new("c"),
            task_id: TaskId::new("t"),
            name: "logNodeOutput".to_string(),
            params: vec![json!("hi")],
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], msg.kind());
    }
}
