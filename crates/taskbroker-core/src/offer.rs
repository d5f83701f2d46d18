//! Offers of runner capacity and requests for it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{OfferId, RequestId, RequesterId, RunnerId};

/// A runner's advertisement of capacity for one task of a given type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOffer {
    /// Runner-chosen offer identifier.
    pub offer_id: OfferId,

    /// Runner that made the offer.
    pub runner_id: RunnerId,

    /// Task type the runner can execute.
    pub task_type: String,

    /// The offer may not be matched at or after this instant.
    pub valid_until: DateTime<Utc>,
}

impl TaskOffer {
    /// Create a new offer with an absolute deadline.
    pub fn new(
        offer_id: OfferId,
        runner_id: RunnerId,
        task_type: impl Into<String>,
        valid_until: DateTime<Utc>,
    ) -> Self {
        Self {
            offer_id,
            runner_id,
            task_type: task_type.into(),
            valid_until,
        }
    }

    /// Create an offer valid for `valid_for_ms` milliseconds from `now`.
    ///
    /// Zero or negative windows produce an offer that is already expired.
    /// Windows too large to represent are clamped to the latest instant.
    pub fn valid_for(
        offer_id: OfferId,
        runner_id: RunnerId,
        task_type: impl Into<String>,
        valid_for_ms: i64,
        now: DateTime<Utc>,
    ) -> Self {
        let valid_until = Duration::try_milliseconds(valid_for_ms)
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(if valid_for_ms > 0 {
                DateTime::<Utc>::MAX_UTC
            } else {
                now
            });
        Self::new(offer_id, runner_id, task_type, valid_until)
    }

    /// Check whether the offer has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until <= now
    }
}

/// A requester's request for a task of a given type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Requester-chosen request identifier.
    pub request_id: RequestId,

    /// Task type to run.
    pub task_type: String,

    /// Requester that owns the request.
    pub requester_id: RequesterId,

    /// When the broker first received the request.
    pub received_at: DateTime<Utc>,
}

impl TaskRequest {
    /// Create a new request received now.
    pub fn new(
        request_id: RequestId,
        task_type: impl Into<String>,
        requester_id: RequesterId,
    ) -> Self {
        Self {
            request_id,
            task_type: task_type.into(),
            requester_id,
            received_at: Utc::now(),
        }
    }
}
