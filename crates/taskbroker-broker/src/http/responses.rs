//! HTTP request and response types.

use serde::{Deserialize, Serialize};

use taskbroker_core::Task;

use crate::registry::RunnerSummary;

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// WebSocket connect parameters
// ============================================================================

/// Query string of the WebSocket routes.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Runner or requester id.
    pub id: Option<String>,
}

// ============================================================================
// Runner list types
// ============================================================================

/// Response for a single runner.
#[derive(Debug, Serialize)]
pub struct RunnerResponse {
    #[serde(flatten)]
    pub runner: RunnerSummary,

    /// Non-terminal tasks assigned to the runner.
    pub active_tasks: usize,
}

// ============================================================================
// Task list types
// ============================================================================

/// State entered by a task, and when.
#[derive(Debug, Serialize)]
pub struct StateEntryResponse {
    pub state: String,
    pub at: String,
}

/// Response for a single task.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub request_id: String,
    pub offer_id: String,
    pub runner_id: String,
    pub requester_id: String,
    pub task_type: String,
    pub state: String,
    pub reason: Option<String>,
    pub history: Vec<StateEntryResponse>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id.into_inner(),
            request_id: task.request_id.into_inner(),
            offer_id: task.offer_id.into_inner(),
            runner_id: task.runner_id.into_inner(),
            requester_id: task.requester_id.into_inner(),
            task_type: task.task_type,
            state: task.state.as_str().to_string(),
            reason: task.reason,
            history: task
                .history
                .into_iter()
                .map(|c| StateEntryResponse {
                    state: c.state.as_str().to_string(),
                    at: c.at.to_rfc3339(),
                })
                .collect(),
        }
    }
}
