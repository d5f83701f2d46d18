//! Task Broker CLI - Command line interface for a task broker.

use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use taskbroker_proto::{decode, encode, BrokerToRequester};

mod submit;

use submit::{Outcome, Step, Submission};

/// Task Broker CLI - submit tasks and inspect a broker
#[derive(Parser)]
#[command(name = "taskbroker")]
#[command(about = "CLI for a task broker", long_about = None)]
struct Cli {
    /// Broker address
    #[arg(short, long, default_value = "ws://127.0.0.1:5679")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a task and wait for its result
    Submit {
        /// Task type to request
        #[arg(short, long)]
        task_type: String,

        /// Settings JSON sent once a runner is ready
        #[arg(short, long, default_value = "{}")]
        settings: String,

        /// Data JSON returned for every data request
        #[arg(short, long, default_value = "null")]
        data: String,
    },

    /// List registered runners
    Runners,

    /// List known tasks
    Tasks,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            task_type,
            settings,
            data,
        } => {
            let settings: Value = serde_json::from_str(&settings)?;
            let data: Value = serde_json::from_str(&data)?;
            let succeeded = submit(&cli.addr, task_type, settings, data).await?;
            if !succeeded {
                std::process::exit(1);
            }
        }
        Commands::Runners => {
            list_runners(&cli.addr).await?;
        }
        Commands::Tasks => {
            list_tasks(&cli.addr).await?;
        }
    }

    Ok(())
}

async fn submit(
    addr: &str,
    task_type: String,
    settings: Value,
    data: Value,
) -> Result<bool, Box<dyn std::error::Error>> {
    let url = format!("{}/requesters/_ws", addr.trim_end_matches('/'));
    let (socket, _) = connect_async(url.as_str()).await?;
    let (mut sink, mut stream) = socket.split();

    let mut submission = Submission::new(task_type, settings, data);
    sink.send(Message::Text(encode(&submission.request())?)).await?;

    let outcome = loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = tokio::signal::ctrl_c() => {
                sink.send(Message::Text(encode(&submission.cancel("interrupted"))?)).await?;
                eprintln!("Interrupted");
                let _ = sink.close().await;
                return Ok(false);
            }
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return Err("Broker closed the connection".into()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };

        let msg: BrokerToRequester = match decode(&text) {
            Ok(msg) => msg,
            Err(e) => {
                eprintln!("Ignoring malformed message: {e}");
                continue;
            }
        };

        match submission.on_message(msg) {
            Step::Reply(reply) => sink.send(Message::Text(encode(&reply)?)).await?,
            Step::Wait => {}
            Step::Finished(outcome) => break outcome,
        }
    };
    let _ = sink.close().await;

    let task_id = submission
        .task_id()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    match outcome {
        Outcome::Done(data) => {
            println!("Task {task_id} done:");
            println!("{}", serde_json::to_string_pretty(&data)?);
            Ok(true)
        }
        Outcome::Failed(error) => {
            eprintln!("Task {task_id} failed:");
            eprintln!("{}", serde_json::to_string_pretty(&error)?);
            Ok(false)
        }
    }
}

#[derive(Deserialize)]
struct RunnerRow {
    runner_id: String,
    name: String,
    task_types: Vec<String>,
    open_offers: usize,
    active_tasks: usize,
}

#[derive(Deserialize)]
struct TaskRow {
    task_id: String,
    task_type: String,
    state: String,
    runner_id: String,
    history: Vec<HistoryRow>,
}

#[derive(Deserialize)]
struct HistoryRow {
    at: String,
}

async fn list_runners(addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/v1/runners", http_base(addr));
    let runners: Vec<RunnerRow> = reqwest::get(url).await?.error_for_status()?.json().await?;

    println!("Runners ({}):", runners.len());
    println!("{:<36}  {:<16}  {:<8}  {:<8}  {}", "ID", "NAME", "OFFERS", "TASKS", "TYPES");
    println!("{}", "-".repeat(90));

    for runner in runners {
        println!(
            "{:<36}  {:<16}  {:<8}  {:<8}  {}",
            runner.runner_id,
            runner.name,
            runner.open_offers,
            runner.active_tasks,
            runner.task_types.join(", ")
        );
    }

    Ok(())
}

async fn list_tasks(addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/v1/tasks", http_base(addr));
    let tasks: Vec<TaskRow> = reqwest::get(url).await?.error_for_status()?.json().await?;

    println!("Tasks ({}):", tasks.len());
    println!("{:<36}  {:<18}  {:<12}  {:<20}  {}", "ID", "STATE", "TYPE", "CREATED", "RUNNER");
    println!("{}", "-".repeat(110));

    for task in tasks {
        let created = task
            .history
            .first()
            .map(|entry| format_timestamp(&entry.at))
            .unwrap_or_default();
        println!(
            "{:<36}  {:<18}  {:<12}  {:<20}  {}",
            task.task_id, task.state, task.task_type, created, task.runner_id
        );
    }

    Ok(())
}

/// HTTP base URL for a broker WebSocket address.
fn http_base(addr: &str) -> String {
    let addr = addr.trim_end_matches('/');
    if let Some(rest) = addr.strip_prefix("ws://") {
        format!("http://{rest}")
    } else if let Some(rest) = addr.strip_prefix("wss://") {
        format!("https://{rest}")
    } else {
        addr.to_string()
    }
}

fn format_timestamp(rfc3339: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(rfc3339)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| rfc3339.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_base() {
        assert_eq!(http_base("ws://127.0.0.1:5679"), "http://127.0.0.1:5679");
        assert_eq!(http_base("wss://broker.example/"), "https://broker.example");
        assert_eq!(http_base("http://localhost:1"), "http://localhost:1");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(
            format_timestamp("2026-01-02T03:04:05+00:00"),
            "2026-01-02 03:04:05"
        );
        assert_eq!(format_timestamp("garbage"), "garbage");
    }
}
