//! Converters between messages and domain types.

use chrono::{DateTime, Utc};
use serde_json::Value;

use taskbroker_core::{RunnerId, RunnerInfo, TaskFailure, TaskId, TaskOffer};

use crate::messages::{BrokerToRequester, RunnerToBroker};

impl BrokerToRequester {
    /// Task error carrying a broker-synthesized failure.
    pub fn failure(task_id: TaskId, failure: &TaskFailure) -> Self {
        let error = serde_json::to_value(failure)
            .unwrap_or_else(|_| Value::from(failure.message.clone()));
        Self::TaskError { task_id, error }
    }

    /// Request error carrying a broker-synthesized failure.
    pub fn request_failure(failure: &TaskFailure) -> Self {
        let error = serde_json::to_value(failure)
            .unwrap_or_else(|_| Value::from(failure.message.clone()));
        Self::RequestError {
            request_id: failure.request_id.clone(),
            error,
        }
    }
}

impl RunnerToBroker {
    /// Build an offer message from a domain offer, relative to `now`.
    pub fn from_offer(offer: &TaskOffer, now: DateTime<Utc>) -> Self {
        Self::TaskOffer {
            offer_id: offer.offer_id.clone(),
            task_type: offer.task_type.clone(),
            valid_for: (offer.valid_until - now).num_milliseconds(),
        }
    }

    /// Domain info for a `runner:info` message, or `None` for other kinds.
    pub fn runner_info(&self, runner_id: &RunnerId) -> Option<RunnerInfo> {
        match self {
            Self::Info { name, types } => Some(RunnerInfo {
                runner_id: runner_id.clone(),
                name: name.clone(),
                task_types: types.clone(),
            }),
            _ => None,
        }
    }

    /// Domain offer for a `runner:taskoffer` message received at `now`.
    pub fn task_offer(&self, runner_id: &RunnerId, now: DateTime<Utc>) -> Option<TaskOffer> {
        match self {
            Self::TaskOffer {
                offer_id,
                task_type,
                valid_for,
            } => Some(TaskOffer::valid_for(
                offer_id.clone(),
                runner_id.clone(),
                task_type.clone(),
                *valid_for,
                now,
            )),
            _ => None,
        }
    }
}
