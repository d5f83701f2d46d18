//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;

use crate::state::AppState;

/// Collect all metrics from AppState and format as Prometheus text.
pub async fn collect_metrics(state: &AppState) -> String {
    let mut output = String::new();

    collect_connection_metrics(state, &mut output).await;
    collect_queue_metrics(state, &mut output).await;
    collect_task_metrics(state, &mut output).await;

    output
}

/// Connected runners and requesters.
async fn collect_connection_metrics(state: &AppState, output: &mut String) {
    let runners = state.runners.count().await;
    let requesters = state.requesters.count().await;

    writeln!(
        output,
        "# HELP taskbroker_runners_connected Number of registered runners"
    )
    .ok();
    writeln!(output, "# TYPE taskbroker_runners_connected gauge").ok();
    writeln!(output, "taskbroker_runners_connected {runners}").ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskbroker_requesters_connected Number of connected requesters"
    )
    .ok();
    writeln!(output, "# TYPE taskbroker_requesters_connected gauge").ok();
    writeln!(output, "taskbroker_requesters_connected {requesters}").ok();
}

/// Open offers and queued requests by task type.
async fn collect_queue_metrics(state: &AppState, output: &mut String) {
    let depths = state.offers.depths().await;

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskbroker_offers_open Open runner offers by task type"
    )
    .ok();
    writeln!(output, "# TYPE taskbroker_offers_open gauge").ok();
    for (task_type, depth) in &depths {
        writeln!(
            output,
            "taskbroker_offers_open{{task_type=\"{}\"}} {}",
            escape_label(task_type),
            depth.offers
        )
        .ok();
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskbroker_requests_queued Task requests waiting for an offer by task type"
    )
    .ok();
    writeln!(output, "# TYPE taskbroker_requests_queued gauge").ok();
    for (task_type, depth) in &depths {
        writeln!(
            output,
            "taskbroker_requests_queued{{task_type=\"{}\"}} {}",
            escape_label(task_type),
            depth.requests
        )
        .ok();
    }
}

/// Tasks by lifecycle state.
async fn collect_task_metrics(state: &AppState, output: &mut String) {
    let counts = state.tasks.count_by_state().await;

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskbroker_tasks Tasks known to the broker by state"
    )
    .ok();
    writeln!(output, "# TYPE taskbroker_tasks gauge").ok();
    for (task_state, count) in counts {
        writeln!(
            output,
            "taskbroker_tasks{{state=\"{}\"}} {count}",
            task_state.as_str()
        )
        .ok();
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
