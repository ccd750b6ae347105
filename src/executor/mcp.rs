//! Thin MCP client over streamable HTTP: JSON-RPC requests posted to a
//! single endpoint, answered either as JSON or as a short SSE stream.

use super::error::{ExecutorError, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2025-03-26";
const SESSION_HEADER: &str = "Mcp-Session-Id";
const MAX_TOOL_PAGES: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

/// An open tool session.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpTool>>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput>;

    async fn close(&self) {}
}

/// Opens tool sessions for a given server and header set.
#[async_trait]
pub trait ToolConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Box<dyn ToolProvider>>;
}

pub struct HttpToolConnector {
    http: reqwest::Client,
}

impl HttpToolConnector {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExecutorError::Mcp(format!("Failed to create client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ToolConnector for HttpToolConnector {
    async fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Box<dyn ToolProvider>> {
        let session = McpSession::connect(self.http.clone(), url, headers.to_vec()).await?;
        Ok(Box::new(session))
    }
}

pub struct McpSession {
    http: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
    session_id: Option<String>,
    next_id: AtomicU64,
}

impl McpSession {
    pub async fn connect(
        http: reqwest::Client,
        url: &str,
        headers: Vec<(String, String)>,
    ) -> Result<Self> {
        let mut session = Self {
            http,
            url: url.to_string(),
            headers,
            session_id: None,
            next_id: AtomicU64::new(1),
        };

        info!("Initializing MCP session at {}", session.url);
        let (result, session_id) = session
            .send(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }),
            )
            .await?;
        session.session_id = session_id;

        let server = result
            .get("serverInfo")
            .and_then(|info| info.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(
            "MCP session initialized with server {} (session id: {})",
            server,
            session.session_id.as_deref().unwrap_or("none")
        );

        session.notify("notifications/initialized").await?;
        Ok(session)
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, &self.url)
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json");
        for (key, value) in &self.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(id) = self.session_id.as_deref() {
            builder = builder.header(SESSION_HEADER, id);
        }
        builder
    }

    /// Sends one JSON-RPC request and returns its `result` along with the
    /// session id the server assigned, if any.
    async fn send(&self, method: &str, params: Value) -> Result<(Value, Option<String>)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        debug!("MCP request {} ({})", method, id);

        let resp = self
            .request(reqwest::Method::POST)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ExecutorError::Mcp(format!("failed to reach MCP server: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ExecutorError::Mcp(format!(
                "{} failed: status {}, body: {}",
                method, status, text
            )));
        }

        let session_id = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_lowercase();
        let body = resp
            .text()
            .await
            .map_err(|e| ExecutorError::Mcp(format!("failed to read {} response: {}", method, e)))?;

        let envelope = if content_type.contains("text/event-stream") {
            parse_sse_result(&body).ok_or_else(|| {
                ExecutorError::Mcp(format!("failed to parse SSE response for {}", method))
            })?
        } else {
            serde_json::from_str(&body)?
        };

        Ok((rpc_result(envelope)?, session_id))
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let payload = json!({"jsonrpc": "2.0", "method": method});
        let resp = self
            .request(reqwest::Method::POST)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ExecutorError::Mcp(format!("failed to reach MCP server: {}", e)))?;
        if !resp.status().is_success() {
            return Err(ExecutorError::Mcp(format!(
                "{} rejected: status {}",
                method,
                resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ToolProvider for McpSession {
    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = match cursor.as_deref() {
                Some(c) => json!({"cursor": c}),
                None => json!({}),
            };
            let (result, _) = self.send("tools/list", params).await?;
            let page: ToolsPage = serde_json::from_value(result)?;
            tools.extend(page.tools);
            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => {
                    info!("Loaded {} MCP tools", tools.len());
                    return Ok(tools);
                }
            }
        }
        warn!("Stopped listing tools after {} pages", MAX_TOOL_PAGES);
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        info!("Invoking MCP tool {}", name);
        let (result, _) = self
            .send("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        Ok(tool_output(&result))
    }

    async fn close(&self) {
        let Some(id) = self.session_id.as_deref() else {
            return;
        };
        match self.request(reqwest::Method::DELETE).send().await {
            Ok(resp) => debug!("Closed MCP session {} ({})", id, resp.status()),
            Err(e) => debug!("Failed to close MCP session {}: {}", id, e),
        }
    }
}

#[derive(Deserialize)]
struct ToolsPage {
    #[serde(default)]
    tools: Vec<McpTool>,
    #[serde(rename = "nextCursor", default)]
    next_cursor: Option<String>,
}

fn rpc_result(envelope: Value) -> Result<Value> {
    if let Some(error) = envelope.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(ExecutorError::Mcp(format!("JSON-RPC error {}: {}", code, message)));
    }
    Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
}

/// Flattens a `tools/call` result: text parts joined by newlines, anything
/// else rendered as JSON.
pub fn tool_output(result: &Value) -> ToolOutput {
    let parts: Vec<String> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| match item.get("type").and_then(Value::as_str) {
                    Some("text") => item
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    _ => item.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    let text = if parts.is_empty() {
        result
            .get("structuredContent")
            .map(Value::to_string)
            .unwrap_or_default()
    } else {
        parts.join("\n")
    };

    ToolOutput {
        text,
        is_error: result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

fn parse_sse_result(body: &str) -> Option<Value> {
    let mut last = None;
    for line in body.lines() {
        if let Some(stripped) = line.strip_prefix("data:") {
            let json_str = stripped.trim();
            if json_str.is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(json_str) {
                last = Some(value);
            }
        }
    }
    last
}
