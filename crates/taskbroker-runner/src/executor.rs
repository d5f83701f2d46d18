//! Task execution.
//!
//! The runner hands each task to an [`Executor`] together with a
//! [`TaskContext`]. The context is the task's only way back to the
//! requester: it fetches input data and calls allow-listed procedures,
//! both relayed by the broker and bounded by the RPC timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use taskbroker_core::{CallId, RequestId, TaskId};
use taskbroker_proto::RunnerToBroker;

/// Errors that can occur during task execution.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Task cancelled")]
    Cancelled,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Requester returned an error: {0}")]
    Remote(Value),

    #[error("Connection to broker lost")]
    Disconnected,

    #[error("Invalid task settings: {0}")]
    InvalidSettings(String),
}

impl ExecutorError {
    /// Error payload reported in `runner:taskerror`.
    pub fn to_payload(&self) -> Value {
        match self {
            Self::Remote(data) => json!({ "message": self.to_string(), "details": data }),
            _ => json!({ "message": self.to_string() }),
        }
    }
}

/// Correlation key of an outstanding reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReplyKey {
    Data(RequestId),
    Call(CallId),
}

type Reply = Result<Value, ExecutorError>;

/// Replies awaited by running tasks, keyed by task and correlation id.
#[derive(Default)]
pub struct PendingReplies {
    waiting: Mutex<HashMap<(TaskId, ReplyKey), oneshot::Sender<Reply>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, task_id: TaskId, key: ReplyKey) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().await.insert((task_id, key), tx);
        rx
    }

    async fn forget(&self, task_id: &TaskId, key: &ReplyKey) {
        self.waiting
            .lock()
            .await
            .remove(&(task_id.clone(), key.clone()));
    }

    /// Deliver a reply. Returns false if nothing was waiting for it.
    pub async fn resolve(&self, task_id: &TaskId, key: ReplyKey, reply: Reply) -> bool {
        let waiter = self.waiting.lock().await.remove(&(task_id.clone(), key));
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop every reply a task is still waiting for.
    pub async fn forget_task(&self, task_id: &TaskId) {
        self.waiting.lock().await.retain(|(t, _), _| t != task_id);
    }

    pub async fn len(&self) -> usize {
        self.waiting.lock().await.len()
    }
}

/// Everything a task may use while it runs.
pub struct TaskContext {
    pub task_id: TaskId,
    pub settings: Value,
    outbound: mpsc::Sender<RunnerToBroker>,
    replies: Arc<PendingReplies>,
    cancel: CancellationToken,
    rpc_timeout: Duration,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        settings: Value,
        outbound: mpsc::Sender<RunnerToBroker>,
        replies: Arc<PendingReplies>,
        cancel: CancellationToken,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            task_id,
            settings,
            outbound,
            replies,
            cancel,
            rpc_timeout,
        }
    }

    /// Check whether the broker cancelled this task.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fetch task data from the requester.
    pub async fn fetch_data(&self, request_params: Value) -> Result<Value, ExecutorError> {
        let request_id = RequestId::generate();
        let key = ReplyKey::Data(request_id.clone());
        let rx = self.replies.register(self.task_id.clone(), key.clone()).await;

        debug!(task_id = %self.task_id, request_id = %request_id, "Requesting task data");
        let msg = RunnerToBroker::TaskDataRequest {
            task_id: self.task_id.clone(),
            request_id: request_id.clone(),
            request_params,
        };
        self.send_and_wait(msg, key, rx, format!("data request {request_id}"))
            .await
    }

    /// Call a procedure on the requester.
    pub async fn call(&self, name: &str, params: Vec<Value>) -> Result<Value, ExecutorError> {
        let call_id = CallId::generate();
        let key = ReplyKey::Call(call_id.clone());
        let rx = self.replies.register(self.task_id.clone(), key.clone()).await;

        debug!(task_id = %self.task_id, call_id = %call_id, name, "Calling RPC");
        let msg = RunnerToBroker::Rpc {
            call_id: call_id.clone(),
            task_id: self.task_id.clone(),
            name: name.to_string(),
            params,
        };
        self.send_and_wait(msg, key, rx, format!("rpc {name}"))
            .await
    }

    async fn send_and_wait(
        &self,
        msg: RunnerToBroker,
        key: ReplyKey,
        rx: oneshot::Receiver<Reply>,
        what: String,
    ) -> Result<Value, ExecutorError> {
        if self.outbound.send(msg).await.is_err() {
            self.replies.forget(&self.task_id, &key).await;
            return Err(ExecutorError::Disconnected);
        }

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(ExecutorError::Cancelled),
            reply = tokio::time::timeout(self.rpc_timeout, rx) => match reply {
                Ok(Ok(reply)) => return reply,
                Ok(Err(_)) => Err(ExecutorError::Disconnected),
                Err(_) => Err(ExecutorError::Timeout(what)),
            },
        };
        self.replies.forget(&self.task_id, &key).await;
        outcome
    }
}

/// Executes one task.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run the task to completion and return its result data.
    async fn execute(&self, ctx: TaskContext) -> Result<Value, ExecutorError>;
}

/// Executor that returns its settings and the task's input data.
///
/// Settings may carry `"rpc": { "name": ..., "params": [...] }` to make one
/// call on the requester; its result is included in the output.
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, ctx: TaskContext) -> Result<Value, ExecutorError> {
        if !ctx.settings.is_object() && !ctx.settings.is_null() {
            return Err(ExecutorError::InvalidSettings(
                "settings must be an object".to_string(),
            ));
        }

        let input = ctx.fetch_data(json!({ "dataOfNodes": "all" })).await?;

        let rpc = match ctx.settings.get("rpc") {
            Some(rpc) => {
                let name = rpc
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ExecutorError::InvalidSettings("rpc.name missing".into()))?;
                let params = rpc
                    .get("params")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                Some(ctx.call(name, params).await?)
            }
            None => None,
        };

        info!(task_id = %ctx.task_id, "Echo task complete");
        Ok(json!({
            "settings": ctx.settings,
            "input": input,
            "rpc": rpc,
        }))
    }
}
