//! Runner list handler.

use axum::{extract::State, response::IntoResponse, Json};

use crate::http::responses::RunnerResponse;
use crate::state::Broker;

/// List registered runners as JSON.
pub async fn list_runners(State(broker): State<Broker>) -> impl IntoResponse {
    let state = broker.state();
    let mut response = Vec::new();
    for runner in state.runners.summaries().await {
        let runner_id = taskbroker_core::RunnerId::new(runner.runner_id.clone());
        let mut active_tasks = 0;
        for slot in state.tasks.owned_by_runner(&runner_id).await {
            if !slot.state().await.is_terminal() {
                active_tasks += 1;
            }
        }
        response.push(RunnerResponse {
            runner,
            active_tasks,
        });
    }
    Json(response)
}
