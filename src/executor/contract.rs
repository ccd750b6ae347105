//! Data the host runtime hands to the executor for one task invocation.
//!
//! The host owns tasks, operators and the progress UI. Everything the
//! executor reads from it is declared here so that a missing field becomes
//! a serde default instead of a runtime check.

use super::error::{ExecutorError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

pub const CONTRACT_VERSION: u32 = 1;
pub const TASK_STATUS_DONE: &str = "DONE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub operator: Option<String>,
}

impl TaskEntry {
    pub fn is_done(&self) -> bool {
        self.status.as_deref() == Some(TASK_STATUS_DONE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default = "default_version")]
    pub version: u32,
    pub task_index: usize,
    pub tasks: Vec<TaskEntry>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_context: Option<HashMap<String, String>>,
    #[serde(default)]
    pub server_context: Option<HashMap<String, String>>,
    #[serde(default)]
    pub user_query: String,
    /// Uploaded files the user selected for this query
    #[serde(default)]
    pub uploaded_file_paths: Vec<PathBuf>,
}

fn default_version() -> u32 {
    CONTRACT_VERSION
}

impl TaskContext {
    pub fn validate(&self) -> Result<()> {
        if self.version != CONTRACT_VERSION {
            return Err(ExecutorError::Context(format!(
                "unsupported task context version {} (expected {})",
                self.version, CONTRACT_VERSION
            )));
        }
        Ok(())
    }

    pub fn current_task(&self) -> Result<&TaskEntry> {
        self.tasks.get(self.task_index).ok_or_else(|| {
            ExecutorError::Context(format!(
                "task index {} out of range ({} tasks)",
                self.task_index,
                self.tasks.len()
            ))
        })
    }

    pub fn current_operator(&self) -> Option<&str> {
        self.tasks
            .get(self.task_index)
            .and_then(|task| task.operator.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorMeta {
    #[serde(default)]
    pub linked_schema: Option<String>,
    #[serde(default)]
    pub executor_args: HashMap<String, Value>,
}

/// Operator metadata keyed by operator name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatorCatalog {
    operators: HashMap<String, OperatorMeta>,
}

impl OperatorCatalog {
    pub fn get(&self, name: &str) -> Option<&OperatorMeta> {
        self.operators.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, meta: OperatorMeta) {
        self.operators.insert(name.into(), meta);
    }
}

/// Body of a single execution request (CLI input file or HTTP body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub context: TaskContext,
    #[serde(default)]
    pub operators: OperatorCatalog,
}

/// Progress reporting callbacks provided by the host.
pub trait ProgressSink: Send + Sync {
    fn update_progress(&self, description: &str);

    fn append_intermediate_output(&self, text: &str);
}
