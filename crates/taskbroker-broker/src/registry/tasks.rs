//! Registry of matched tasks.
//!
//! Each task lives in its own slot with its own lock. The parties a task
//! belongs to never change after the match, so they sit outside the lock
//! and ownership checks do not contend with state updates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, RwLock};

use taskbroker_core::{CallId, RequestId, RequesterId, RunnerId, Task, TaskId, TaskState};

use crate::registry::offers::PendingRequest;

/// Mutable part of a task.
#[derive(Debug)]
pub struct TaskEntry {
    pub task: Task,

    /// Data requests forwarded to the requester and not yet answered.
    pub pending_data: HashSet<RequestId>,

    /// RPC calls forwarded to the requester and not yet answered.
    pub pending_calls: HashSet<CallId>,
}

impl TaskEntry {
    fn new(task: Task) -> Self {
        Self {
            task,
            pending_data: HashSet::new(),
            pending_calls: HashSet::new(),
        }
    }

    /// Clear correlation state once the task can no longer be relayed.
    pub fn clear_pending(&mut self) {
        self.pending_data.clear();
        self.pending_calls.clear();
    }
}

/// A task and the parties it belongs to.
#[derive(Debug)]
pub struct TaskSlot {
    pub id: TaskId,
    pub request_id: RequestId,
    pub runner_id: RunnerId,
    pub requester_id: RequesterId,

    /// The request as it was queued, kept until the runner accepts.
    pub origin: PendingRequest,

    entry: Mutex<TaskEntry>,
}

impl TaskSlot {
    pub async fn lock(&self) -> MutexGuard<'_, TaskEntry> {
        self.entry.lock().await
    }

    /// Current state of the task.
    pub async fn state(&self) -> TaskState {
        self.entry.lock().await.task.state
    }

    /// Copy of the task record.
    pub async fn snapshot(&self) -> Task {
        self.entry.lock().await.task.clone()
    }
}

/// All tasks known to the broker, including finished ones until pruned.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Arc<TaskSlot>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly matched task.
    pub async fn insert(&self, task: Task, origin: PendingRequest) -> Arc<TaskSlot> {
        let slot = Arc::new(TaskSlot {
            id: task.id.clone(),
            request_id: task.request_id.clone(),
            runner_id: task.runner_id.clone(),
            requester_id: task.requester_id.clone(),
            origin,
            entry: Mutex::new(TaskEntry::new(task)),
        });
        self.tasks
            .write()
            .await
            .insert(slot.id.clone(), slot.clone());
        slot
    }

    pub async fn get(&self, task_id: &TaskId) -> Option<Arc<TaskSlot>> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn remove(&self, task_id: &TaskId) -> Option<Arc<TaskSlot>> {
        self.tasks.write().await.remove(task_id)
    }

    /// Tasks executed by a runner.
    pub async fn owned_by_runner(&self, runner_id: &RunnerId) -> Vec<Arc<TaskSlot>> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|slot| &slot.runner_id == runner_id)
            .cloned()
            .collect()
    }

    /// Tasks owned by a requester.
    pub async fn owned_by_requester(&self, requester_id: &RequesterId) -> Vec<Arc<TaskSlot>> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|slot| &slot.requester_id == requester_id)
            .cloned()
            .collect()
    }

    /// Non-terminal task created for a request.
    pub async fn find_active_by_request(
        &self,
        requester_id: &RequesterId,
        request_id: &RequestId,
    ) -> Option<Arc<TaskSlot>> {
        for slot in self.owned_by_requester(requester_id).await {
            if &slot.request_id == request_id && !slot.state().await.is_terminal() {
                return Some(slot);
            }
        }
        None
    }

    /// Copies of every task, newest first.
    pub async fn snapshot(&self) -> Vec<Task> {
        let slots: Vec<Arc<TaskSlot>> = self.tasks.read().await.values().cloned().collect();
        let mut tasks = Vec::with_capacity(slots.len());
        for slot in slots {
            tasks.push(slot.snapshot().await);
        }
        tasks.sort_by(|a, b| {
            let a_at = a.history.first().map(|c| c.at);
            let b_at = b.history.first().map(|c| c.at);
            b_at.cmp(&a_at).then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }

    /// Drop tasks that finished before `cutoff`. Returns the number removed.
    pub async fn prune_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let slots: Vec<Arc<TaskSlot>> = self.tasks.read().await.values().cloned().collect();
        let mut expired = Vec::new();
        for slot in slots {
            let entry = slot.lock().await;
            if entry.task.finished_at().is_some_and(|at| at < cutoff) {
                expired.push(slot.id.clone());
            }
        }

        if expired.is_empty() {
            return 0;
        }
        let mut tasks = self.tasks.write().await;
        for id in &expired {
            tasks.remove(id);
        }
        expired.len()
    }

    /// Number of tasks in each state, in lifecycle order.
    pub async fn count_by_state(&self) -> Vec<(TaskState, usize)> {
        let slots: Vec<Arc<TaskSlot>> = self.tasks.read().await.values().cloned().collect();
        let mut counts: HashMap<TaskState, usize> = HashMap::new();
        for slot in slots {
            *counts.entry(slot.state().await).or_default() += 1;
        }
        TaskState::ALL
            .iter()
            .map(|state| (*state, counts.get(state).copied().unwrap_or(0)))
            .collect()
    }
}
