//! Entry point for one task invocation from the host.

use super::agent::AgentRunner;
use super::config::ExecutorConfig;
use super::contract::{OperatorCatalog, ProgressSink, TaskContext};
use super::conversation::{has_system_prompt, ChatMessage, ConversationStore};
use super::dashboard::{handoff, DashboardPayload, DASHBOARD_TASK_ID};
use super::error::Result;
use super::llm::{build_chat_model, ChatModel};
use super::mcp::{HttpToolConnector, ToolConnector, ToolProvider};
use super::preflight;
use super::prompt::{file_context_preamble, system_prompt};
use super::session::{linked_schema, UserSession};
use super::uploads::read_uploaded_files;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};

/// What the host stores as the task result.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Markdown(String),
    Dashboard(DashboardPayload),
    Empty,
    Failed(String),
}

impl TaskOutcome {
    pub fn to_result_value(&self) -> Value {
        match self {
            TaskOutcome::Markdown(text) | TaskOutcome::Failed(text) => Value::String(text.clone()),
            TaskOutcome::Dashboard(payload) => {
                serde_json::to_value(payload).unwrap_or(Value::Null)
            }
            TaskOutcome::Empty => Value::Null,
        }
    }
}

/// Runs tasks against a shared model, tool connector and conversation
/// store. Invocations for the same session must not overlap; the caller
/// serializes them.
pub struct TaskHandler {
    config: ExecutorConfig,
    model: Arc<dyn ChatModel>,
    connector: Arc<dyn ToolConnector>,
    store: Arc<dyn ConversationStore>,
}

impl TaskHandler {
    pub fn new(
        config: ExecutorConfig,
        model: Arc<dyn ChatModel>,
        connector: Arc<dyn ToolConnector>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            config,
            model,
            connector,
            store,
        }
    }

    pub fn from_config(config: ExecutorConfig, store: Arc<dyn ConversationStore>) -> Result<Self> {
        let model = build_chat_model(&config.provider_settings()?)?;
        let connector = Arc::new(HttpToolConnector::new(config.request_timeout())?);
        Ok(Self::new(config, model, connector, store))
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Never fails: errors become `TaskOutcome::Failed`.
    pub async fn execute(
        &self,
        ctx: &TaskContext,
        catalog: &OperatorCatalog,
        sink: &dyn ProgressSink,
    ) -> TaskOutcome {
        preflight::run(&self.config);
        match self.try_execute(ctx, catalog, sink).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Error in executor: {}", e);
                TaskOutcome::Failed(format!("Error: {}", e))
            }
        }
    }

    async fn try_execute(
        &self,
        ctx: &TaskContext,
        catalog: &OperatorCatalog,
        sink: &dyn ProgressSink,
    ) -> Result<TaskOutcome> {
        ctx.validate()?;
        let task = ctx.current_task()?;
        info!(
            "Executing task {} (operator: {})",
            task.id,
            task.operator.as_deref().unwrap_or("unknown")
        );

        if task.id == DASHBOARD_TASK_ID {
            return Ok(match handoff(ctx) {
                Some(payload) => TaskOutcome::Dashboard(payload),
                None => TaskOutcome::Empty,
            });
        }

        info!("Task {}: Starting MCP agent execution", task.id);
        sink.update_progress("Initializing MCP connection...");

        let session = UserSession::resolve(ctx, catalog, &self.config.session);
        let schema = linked_schema(ctx, catalog);
        let file_contents = read_uploaded_files(&ctx.uploaded_file_paths).await;

        let headers = session.mcp_headers();
        info!(
            "MCP headers configured: {:?}",
            headers.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>()
        );
        let tools = self
            .connector
            .connect(&session.mcp_server_url, &headers)
            .await?;

        let result = self
            .run_agent(tools.as_ref(), ctx, &session, schema, file_contents, sink)
            .await;
        tools.close().await;
        result
    }

    async fn run_agent(
        &self,
        tools: &dyn ToolProvider,
        ctx: &TaskContext,
        session: &UserSession,
        schema: Option<String>,
        file_contents: Option<String>,
        sink: &dyn ProgressSink,
    ) -> Result<TaskOutcome> {
        sink.update_progress("Retrieving available tools...");
        let specs = tools.list_tools().await?;
        info!("Retrieved {} tools from MCP server", specs.len());

        sink.update_progress("Initializing AI agent...");
        let mut messages = self.store.load(&session.session_id).await;
        if has_system_prompt(&messages) {
            info!("System prompt already in history, reusing it");
        } else {
            info!("Adding system prompt (first message in conversation)");
            messages.push(ChatMessage::system_cached(system_prompt(schema.as_deref())));
        }
        if let Some(contents) = file_contents {
            messages.push(ChatMessage::system(file_context_preamble(&contents)));
        }

        sink.update_progress("Analyzing your query...");
        let answer = AgentRunner::new(
            self.model.as_ref(),
            tools,
            &specs,
            self.config.max_iterations,
        )
        .run(&mut messages, &ctx.user_query, sink)
        .await?;

        info!("Saved conversation history ({} messages)", messages.len());
        self.store.save(&session.session_id, messages).await;
        sink.update_progress("Analysis complete");

        Ok(TaskOutcome::Markdown(answer))
    }
}
