//! Task record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    CoreError, OfferId, RequestId, RequesterId, RunnerId, TaskId, TaskOffer, TaskRequest,
    TaskState,
};

/// A state the task entered, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: TaskState,
    pub at: DateTime<Utc>,
}

/// A unit of work from match through completion, error or cancellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Broker-generated task identifier.
    pub id: TaskId,

    /// Request this task was created for.
    pub request_id: RequestId,

    /// Offer consumed by this task.
    pub offer_id: OfferId,

    /// Runner executing the task.
    pub runner_id: RunnerId,

    /// Requester owning the task data.
    pub requester_id: RequesterId,

    /// Task type.
    pub task_type: String,

    /// Current state.
    pub state: TaskState,

    /// Every state entered, oldest first.
    pub history: Vec<StateChange>,

    /// Reason recorded on error or cancellation.
    pub reason: Option<String>,
}

impl Task {
    /// Create a task for a request matched to an offer, in `OFFER_ACCEPTED`.
    pub fn matched(request: &TaskRequest, offer: &TaskOffer) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            request_id: request.request_id.clone(),
            offer_id: offer.offer_id.clone(),
            runner_id: offer.runner_id.clone(),
            requester_id: request.requester_id.clone(),
            task_type: request.task_type.clone(),
            state: TaskState::OfferAccepted,
            history: vec![
                StateChange {
                    state: TaskState::PendingRequest,
                    at: request.received_at,
                },
                StateChange {
                    state: TaskState::OfferAccepted,
                    at: now,
                },
            ],
            reason: None,
        }
    }

    /// Move to `next`, failing if the lifecycle graph has no such edge.
    pub fn transition(&mut self, next: TaskState) -> Result<(), CoreError> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(StateChange {
            state: next,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Move to `ERRORED`, recording the reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), CoreError> {
        self.transition(TaskState::Errored)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    /// Move to `CANCELLED`, recording the reason.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), CoreError> {
        self.transition(TaskState::Cancelled)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// When the current state was entered.
    pub fn state_entered_at(&self) -> Option<DateTime<Utc>> {
        self.history.last().map(|c| c.at)
    }

    /// When the task reached a terminal state, if it has.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        if self.is_terminal() {
            self.state_entered_at()
        } else {
            None
        }
    }

    /// The sequence of states entered, oldest first.
    pub fn state_path(&self) -> Vec<TaskState> {
        self.history.iter().map(|c| c.state).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matched_task() -> Task {
        let request = TaskRequest::new(RequestId::new("req-1"), "code", RequesterId::new("rq"));
        let offer = TaskOffer::valid_for(
            OfferId::new("offer-1"),
            RunnerId::new("runner-1"),
            "code",
            1000,
            Utc::now(),
        );
        Task::matched(&request, &offer)
    }

    #[test]
    fn test_matched_task_starts_offer_accepted() {
        let task = matched_task();
        assert_eq!(task.state, TaskState::OfferAccepted);
        assert_eq!(
            task.state_path(),
            vec![TaskState::PendingRequest, TaskState::OfferAccepted]
        );
        assert_eq!(task.runner_id, RunnerId::new("runner-1"));
    }

    #[test]
    fn test_full_lifecycle() {
        let mut task = matched_task();
        task.transition(TaskState::Ready).unwrap();
        task.transition(TaskState::Running).unwrap();
        task.transition(TaskState::Done).unwrap();
        assert!(task.is_terminal());
        assert!(task.finished_at().is_some());
    }

    #[test]
    fn test_done_before_running_is_rejected() {
        let mut task = matched_task();
        task.transition(TaskState::Ready).unwrap();
        let err = task.transition(TaskState::Done).unwrap_err();
        assert_eq!(
            err,
            CoreError::InvalidStateTransition {
                from: TaskState::Ready,
                to: TaskState::Done
            }
        );
        assert_eq!(task.state, TaskState::Ready);
    }

    #[test]
    fn test_no_exit_from_cancelled() {
        let mut task = matched_task();
        task.cancel("user").unwrap();
        assert!(task.fail("late").is_err());
        assert_eq!(task.state, TaskState::Cancelled);
        assert_eq!(task.reason.as_deref(), Some("user"));
    }
}
