//! Task lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of a task in the broker.
///
/// ```text
/// PENDING_REQUEST -> OFFER_ACCEPTED -> READY -> RUNNING -> DONE | ERRORED
/// ```
///
/// Any non-terminal state may move to `CANCELLED`; `OFFER_ACCEPTED`, `READY`
/// and `RUNNING` may move to `ERRORED` when the owning runner disconnects,
/// and a rejected offer sends `OFFER_ACCEPTED` back to `PENDING_REQUEST`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Request queued, waiting for an offer.
    #[default]
    PendingRequest,
    /// Offer consumed, waiting for the runner to accept or reject.
    OfferAccepted,
    /// Runner accepted, waiting for the requester's settings.
    Ready,
    /// Settings delivered, runner is executing.
    Running,
    /// Runner reported success.
    Done,
    /// Runner reported an error, or disconnected.
    Errored,
    /// Cancelled by either side.
    Cancelled,
}

impl TaskState {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Errored | Self::Cancelled)
    }

    /// Returns true if the task is still active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns true if the task has a runner assigned.
    pub fn has_runner(&self) -> bool {
        matches!(self, Self::OfferAccepted | Self::Ready | Self::Running)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;

        match (self, next) {
            (PendingRequest, OfferAccepted) => true,
            (OfferAccepted, Ready) => true,
            (OfferAccepted, PendingRequest) => true,
            (Ready, Running) => true,
            (Running, Done) => true,
            (OfferAccepted | Ready | Running, Errored) => true,
            (PendingRequest | OfferAccepted | Ready | Running, Cancelled) => true,
            _ => false,
        }
    }

    /// Lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingRequest => "pending_request",
            Self::OfferAccepted => "offer_accepted",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Done => "done",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        }
    }

    /// All states, in lifecycle order.
    pub const ALL: [TaskState; 7] = [
        Self::PendingRequest,
        Self::OfferAccepted,
        Self::Ready,
        Self::Running,
        Self::Done,
        Self::Errored,
        Self::Cancelled,
    ];
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
