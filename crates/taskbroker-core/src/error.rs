//! Core domain errors.

use thiserror::Error;

use crate::status::TaskState;

/// Core domain errors for the task broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Runner not found.
    #[error("Runner not found: {0}")]
    RunnerNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: TaskState, to: TaskState },

    /// Task type not declared by the runner.
    #[error("Task type '{task_type}' not declared by runner '{runner}'")]
    TaskTypeNotDeclared { task_type: String, runner: String },

    /// RPC procedure not in the allow-list.
    #[error("RPC procedure '{0}' is not allowed")]
    RpcNotAllowed(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
