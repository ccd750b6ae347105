use super::{
    ensure_success, parse_arguments, ChatModel, LineBuffer, ModelRequest, ModelTurn, Provider,
    ProviderSettings, TextSink, ToolCall, TurnMessage,
};
use crate::executor::conversation::{ChatMessage, MessageContent, Role};
use crate::executor::error::{ExecutorError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const PROMPT_CACHING_BETA: &str = "prompt-caching-2024-07-31";

/// Messages API client with prompt caching enabled.
pub struct AnthropicChatModel {
    client: reqwest::Client,
    settings: ProviderSettings,
    api_key: String,
}

impl AnthropicChatModel {
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        Ok(Self {
            client: settings.http_client()?,
            api_key: settings.require_api_key()?,
            settings: settings.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/messages", self.settings.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, request: &ModelRequest<'_>) -> Value {
        let (system, messages) = convert_messages(request.messages);
        let mut body = json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
            "messages": messages,
            "stream": true
        });
        if !system.is_empty() {
            body["system"] = Value::Array(system);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description.clone().unwrap_or_default(),
                        "input_schema": tool.input_schema
                    })
                })
                .collect();
        }
        body
    }
}

#[async_trait]
impl ChatModel for AnthropicChatModel {
    fn describe(&self) -> String {
        format!("{}/{}", Provider::Anthropic, self.settings.model)
    }

    async fn stream_turn(
        &self,
        request: &ModelRequest<'_>,
        on_text: &TextSink<'_>,
    ) -> Result<ModelTurn> {
        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", PROMPT_CACHING_BETA)
            .header("content-type", "application/json")
            .json(&self.build_body(request))
            .send()
            .await?;
        let response = ensure_success(response, Provider::Anthropic).await?;

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut state = StreamState::default();
        while let Some(chunk) = stream.next().await {
            for line in lines.push(&chunk?) {
                state.handle_line(&line, on_text)?;
            }
        }
        if let Some(line) = lines.finish() {
            state.handle_line(&line, on_text)?;
        }
        state.finish()
    }
}

/// Splits out system blocks and merges consecutive same-role messages,
/// which the Messages API requires to alternate.
fn convert_messages(messages: &[TurnMessage]) -> (Vec<Value>, Vec<Value>) {
    let mut system = Vec::new();
    let mut converted: Vec<(Role, Vec<Value>)> = Vec::new();

    let mut push = |role: Role, blocks: Vec<Value>| {
        if blocks.is_empty() {
            return;
        }
        match converted.last_mut() {
            Some((last_role, content)) if *last_role == role => content.extend(blocks),
            _ => converted.push((role, blocks)),
        }
    };

    for message in messages {
        match message {
            TurnMessage::Chat(chat) if chat.role == Role::System => {
                system.extend(content_blocks(chat));
            }
            TurnMessage::Chat(chat) => push(chat.role, content_blocks(chat)),
            TurnMessage::AssistantToolCalls { text, calls } => {
                let mut blocks = Vec::new();
                if !text.is_empty() {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                blocks.extend(calls.iter().map(|call| {
                    json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments
                    })
                }));
                push(Role::Assistant, blocks);
            }
            TurnMessage::ToolResult {
                call_id,
                content,
                is_error,
                ..
            } => push(
                Role::User,
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": content,
                    "is_error": is_error
                })],
            ),
        }
    }

    let messages = converted
        .into_iter()
        .map(|(role, content)| json!({"role": role.as_str(), "content": content}))
        .collect();
    (system, messages)
}

fn content_blocks(message: &ChatMessage) -> Vec<Value> {
    match &message.content {
        MessageContent::Text(text) if text.is_empty() => Vec::new(),
        MessageContent::Text(text) => vec![json!({"type": "text", "text": text})],
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| serde_json::to_value(block).ok())
            .filter(|value| !matches!(value.get("text"), Some(Value::String(t)) if t.is_empty()))
            .collect(),
    }
}

#[derive(Default)]
struct PendingToolUse {
    id: String,
    name: String,
    input_json: String,
}

#[derive(Default)]
struct StreamState {
    turn: ModelTurn,
    pending: BTreeMap<u64, PendingToolUse>,
}

impl StreamState {
    fn handle_line(&mut self, line: &str, on_text: &TextSink<'_>) -> Result<()> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(());
        }
        let event: Value = serde_json::from_str(data)?;
        self.handle_event(&event, on_text)
    }

    fn handle_event(&mut self, event: &Value, on_text: &TextSink<'_>) -> Result<()> {
        let index = event.get("index").and_then(Value::as_u64).unwrap_or_default();
        match event.get("type").and_then(Value::as_str).unwrap_or_default() {
            "content_block_start" => {
                let block = &event["content_block"];
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        self.pending.insert(
                            index,
                            PendingToolUse {
                                id: block["id"].as_str().unwrap_or_default().to_string(),
                                name: block["name"].as_str().unwrap_or_default().to_string(),
                                input_json: String::new(),
                            },
                        );
                    }
                    Some("text") => {
                        if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                            self.push_text(text, on_text);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta["text"].as_str() {
                            self.push_text(text, on_text);
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(tool) = self.pending.get_mut(&index) {
                            tool.input_json
                                .push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(tool) = self.pending.remove(&index) {
                    self.turn.tool_calls.push(ToolCall {
                        id: tool.id,
                        name: tool.name,
                        arguments: parse_arguments(&tool.input_json)?,
                    });
                }
            }
            "message_delta" => {
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    debug!("Anthropic stop reason: {}", reason);
                }
            }
            "error" => {
                let message = event["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown stream error");
                return Err(ExecutorError::Model(format!("anthropic stream error: {}", message)));
            }
            _ => {}
        }
        Ok(())
    }

    fn push_text(&mut self, text: &str, on_text: &TextSink<'_>) {
        self.turn.text.push_str(text);
        on_text(text);
    }

    fn finish(mut self) -> Result<ModelTurn> {
        if !self.pending.is_empty() {
            warn!("Stream ended with {} unfinished tool call(s)", self.pending.len());
            for (_, tool) in std::mem::take(&mut self.pending) {
                self.turn.tool_calls.push(ToolCall {
                    id: tool.id,
                    name: tool.name,
                    arguments: parse_arguments(&tool.input_json)
                        .unwrap_or_else(|_| Value::Object(Map::new())),
                });
            }
        }
        Ok(self.turn)
    }
}
