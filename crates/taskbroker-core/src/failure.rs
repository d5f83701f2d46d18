//! Failures the broker reports on behalf of a task.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::RequestId;

/// Reason code of a broker-synthesized task error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// The runner executing the task went away.
    RunnerDisconnected,
    /// The requester owning the task went away.
    RequesterDisconnected,
    /// No offer arrived before the request timed out.
    NoRunnerAvailable,
    /// The runner cancelled the task.
    CancelledByRunner,
    /// The matched runner could not be reached.
    RunnerUnavailable,
}

impl FailureCode {
    /// Default human-readable message for this code.
    pub fn message(&self) -> &'static str {
        match self {
            Self::RunnerDisconnected => "runner disconnected",
            Self::RequesterDisconnected => "requester disconnected",
            Self::NoRunnerAvailable => "no runner available",
            Self::CancelledByRunner => "task cancelled by runner",
            Self::RunnerUnavailable => "runner unavailable",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Error payload the broker sends in place of a runner-reported error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub code: FailureCode,
    pub message: String,
    pub request_id: RequestId,
}

impl TaskFailure {
    /// Create a failure with the code's default message.
    pub fn new(code: FailureCode, request_id: RequestId) -> Self {
        Self {
            code,
            message: code.message().to_string(),
            request_id,
        }
    }

    /// Builder method to replace the message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_serialization() {
        let failure = TaskFailure::new(FailureCode::RunnerDisconnected, RequestId::new("req-9"));
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["code"], "runner_disconnected");
        assert_eq!(json["message"], "runner disconnected");
        assert_eq!(json["requestId"], "req-9");
    }
}
