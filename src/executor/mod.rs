// Copilot MCP executor modules
mod agent;
pub mod config;
mod contract;
mod conversation;
mod dashboard;
mod error;
mod format;
mod llm;
mod mcp;
mod preflight;
mod prompt;
mod server;
mod session;
mod sinks;
mod task_handler;
mod uploads;

use anyhow::{Context, Result};
use std::fs;
use std::process;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use config::ExecutorConfig;
use contract::TaskRequest;
use conversation::InMemoryConversationStore;
use sinks::{JsonLinesSink, ProgressEvent};
use task_handler::{TaskHandler, TaskOutcome};

const PID_FILE: &str = "/tmp/copilot_executor.pid";

/// Executes one task request read from `source` (a path, or `-` for stdin)
/// and writes progress, output and the result as JSON lines to stdout.
pub async fn run_once(config: ExecutorConfig, source: &str) -> Result<()> {
    let raw = if source == "-" {
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .context("failed to read task request from stdin")?;
        buf
    } else {
        tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("failed to read task request from {}", source))?
    };
    let request: TaskRequest =
        serde_json::from_str(&raw).context("failed to parse task request JSON")?;

    let store = Arc::new(InMemoryConversationStore::new(config.eviction_policy()));
    let handler = TaskHandler::from_config(config, store)?;
    let sink = JsonLinesSink::new(std::io::stdout());

    let outcome = handler
        .execute(&request.context, &request.operators, &sink)
        .await;
    if let TaskOutcome::Failed(message) = &outcome {
        warn!("Task finished with an error: {}", message);
    }
    sink.emit(&ProgressEvent::Result {
        result: outcome.to_result_value(),
    });
    Ok(())
}

pub async fn run_server(config: ExecutorConfig, host: &str, port: u16) -> Result<()> {
    let pid = process::id();
    if let Err(e) = fs::write(PID_FILE, pid.to_string()) {
        warn!("Could not write PID file: {}", e);
    }

    let pid_file_cleanup = PID_FILE.to_string();
    ctrlc::set_handler(move || {
        info!("Shutting down copilot executor...");
        let _ = fs::remove_file(&pid_file_cleanup);
        std::process::exit(0);
    })?;

    info!("Starting copilot executor service (PID: {})", pid);
    preflight::run(&config);

    let store = Arc::new(InMemoryConversationStore::new(config.eviction_policy()));
    let handler = TaskHandler::from_config(config, store)?;
    let app = server::create_router(Arc::new(server::ServerState::new(handler)));

    let bind_addr = format!("{host}:{port}");
    info!("Binding to: {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Task endpoint: http://{}/api/v0/tasks/execute", bind_addr);

    axum::serve(listener, app).await?;

    let _ = fs::remove_file(PID_FILE);
    Ok(())
}
