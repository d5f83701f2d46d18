//! Runner information types.

use serde::{Deserialize, Serialize};

use crate::RunnerId;

/// Information a runner declares when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerInfo {
    /// Runner identifier, taken from the connection.
    pub runner_id: RunnerId,

    /// Human-readable runner name.
    pub name: String,

    /// Task types this runner can execute.
    pub task_types: Vec<String>,
}

impl RunnerInfo {
    /// Create a new RunnerInfo.
    pub fn new(runner_id: RunnerId, name: impl Into<String>) -> Self {
        Self {
            runner_id,
            name: name.into(),
            task_types: Vec::new(),
        }
    }

    /// Check if this runner declared a given task type.
    pub fn supports(&self, task_type: &str) -> bool {
        self.task_types.iter().any(|t| t == task_type)
    }

    /// Builder method to add a task type.
    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_types.push(task_type.into());
        self
    }
}
