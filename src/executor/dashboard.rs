//! Second-stage hand-off: the HTML renderer task reuses the dashboard that
//! the analysis task already embedded in its markdown result.

use super::contract::TaskContext;
use super::format::extract_html_dashboard;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

pub const ANALYSIS_TASK_ID: i64 = 1;
pub const DASHBOARD_TASK_ID: i64 = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardPayload {
    pub content: String,
    pub aspect_ratio: String,
    pub title: String,
    pub html_type: String,
}

impl DashboardPayload {
    pub fn new(content: String) -> Self {
        Self {
            content,
            aspect_ratio: "16/9".to_string(),
            title: "Interactive Dashboard".to_string(),
            html_type: "dashboard".to_string(),
        }
    }
}

/// Dashboard extracted from the finished analysis task, if any. Never
/// triggers a new analysis run.
pub fn handoff(ctx: &TaskContext) -> Option<DashboardPayload> {
    let analysis = ctx
        .tasks
        .iter()
        .find(|task| task.id == ANALYSIS_TASK_ID && task.is_done());

    let Some(analysis) = analysis else {
        warn!("Task {} not found or not DONE yet", ANALYSIS_TASK_ID);
        return None;
    };

    let Some(markdown) = analysis.result.as_ref().and_then(result_text) else {
        error!(
            "Task {} has no result; not re-running the analysis",
            ANALYSIS_TASK_ID
        );
        return None;
    };

    info!(
        "Reusing task {} result ({} characters) to extract HTML",
        ANALYSIS_TASK_ID,
        markdown.len()
    );
    let html = extract_html_dashboard(&markdown);
    if html.is_empty() {
        info!("No HTML dashboard found in task {} result", ANALYSIS_TASK_ID);
        return None;
    }

    info!("HTML dashboard extracted ({} characters)", html.len());
    Some(DashboardPayload::new(html))
}

fn result_text(result: &Value) -> Option<String> {
    match result {
        Value::Null => None,
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::contract::TaskEntry;
    use serde_json::json;

    const DOC: &str = "<html>\n<head></head>\n<body><h1>Revenue</h1></body>\n</html>";

    fn ctx(first: Option<TaskEntry>) -> TaskContext {
        let mut tasks: Vec<TaskEntry> = first.into_iter().collect();
        tasks.push(TaskEntry {
            id: DASHBOARD_TASK_ID,
            status: Some("RUNNING".to_string()),
            result: None,
            operator: Some("renderer".to_string()),
        });
        TaskContext {
            version: 1,
            task_index: tasks.len() - 1,
            tasks,
            session_id: None,
            user_context: None,
            server_context: None,
            user_query: String::new(),
            uploaded_file_paths: Vec::new(),
        }
    }

    fn analysis(status: &str, result: Option<Value>) -> TaskEntry {
        TaskEntry {
            id: ANALYSIS_TASK_ID,
            status: Some(status.to_string()),
            result,
            operator: Some("analyst".to_string()),
        }
    }

    #[test]
    fn done_task_with_dashboard_yields_payload() {
        let markdown = format!("## Revenue\n\n```html\n{}\n```\n", DOC);
        let payload = handoff(&ctx(Some(analysis("DONE", Some(json!(markdown)))))).unwrap();
        assert_eq!(payload.content, DOC);
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "content": DOC,
                "aspect_ratio": "16/9",
                "title": "Interactive Dashboard",
                "html_type": "dashboard"
            })
        );
    }

    #[test]
    fn unfinished_or_missing_task_yields_none() {
        let markdown = json!(format!("```html\n{}\n```", DOC));
        assert!(handoff(&ctx(Some(analysis("RUNNING", Some(markdown))))).is_none());
        assert!(handoff(&ctx(None)).is_none());
    }

    #[test]
    fn empty_or_html_free_result_yields_none() {
        assert!(handoff(&ctx(Some(analysis("DONE", None)))).is_none());
        assert!(handoff(&ctx(Some(analysis("DONE", Some(json!("")))))).is_none());
        assert!(handoff(&ctx(Some(analysis("DONE", Some(json!("Just a table.")))))).is_none());
    }

    #[test]
    fn incomplete_document_yields_none() {
        let markdown = json!("```html\n<html><body>cut off\n```");
        assert!(handoff(&ctx(Some(analysis("DONE", Some(markdown))))).is_none());
    }
}
