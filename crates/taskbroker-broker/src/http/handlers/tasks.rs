//! Task list handler.

use axum::{extract::State, response::IntoResponse, Json};

use crate::http::responses::TaskResponse;
use crate::state::Broker;

/// List known tasks as JSON, newest first.
pub async fn list_tasks(State(broker): State<Broker>) -> impl IntoResponse {
    let tasks: Vec<TaskResponse> = broker
        .state()
        .tasks
        .snapshot()
        .await
        .into_iter()
        .map(TaskResponse::from)
        .collect();
    Json(tasks)
}
