use super::{
    ensure_success, ChatModel, LineBuffer, ModelRequest, ModelTurn, Provider, ProviderSettings,
    TextSink, ToolCall, TurnMessage,
};
use crate::executor::error::{ExecutorError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

/// Native Ollama chat client; the response is newline-delimited JSON.
pub struct OllamaChatModel {
    client: reqwest::Client,
    settings: ProviderSettings,
}

impl OllamaChatModel {
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        Ok(Self {
            client: settings.http_client()?,
            settings: settings.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.settings.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, request: &ModelRequest<'_>) -> Value {
        let mut body = json!({
            "model": self.settings.model,
            "messages": convert_messages(request.messages),
            "stream": true,
            "options": {
                "temperature": self.settings.temperature,
                "num_predict": self.settings.max_tokens
            }
        });
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description.clone().unwrap_or_default(),
                            "parameters": tool.input_schema
                        }
                    })
                })
                .collect();
        }
        body
    }
}

#[async_trait]
impl ChatModel for OllamaChatModel {
    fn describe(&self) -> String {
        format!("{}/{}", Provider::Ollama, self.settings.model)
    }

    async fn stream_turn(
        &self,
        request: &ModelRequest<'_>,
        on_text: &TextSink<'_>,
    ) -> Result<ModelTurn> {
        let response = self
            .client
            .post(self.endpoint())
            .json(&self.build_body(request))
            .send()
            .await?;
        let response = ensure_success(response, Provider::Ollama).await?;

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut turn = ModelTurn::default();
        while let Some(chunk) = stream.next().await {
            for line in lines.push(&chunk?) {
                handle_line(&mut turn, &line, on_text)?;
            }
        }
        if let Some(line) = lines.finish() {
            handle_line(&mut turn, &line, on_text)?;
        }
        Ok(turn)
    }
}

fn convert_messages(messages: &[TurnMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| match message {
            TurnMessage::Chat(chat) => json!({
                "role": chat.role.as_str(),
                "content": chat.text()
            }),
            TurnMessage::AssistantToolCalls { text, calls } => {
                let tool_calls: Vec<Value> = calls
                    .iter()
                    .map(|call| {
                        json!({"function": {"name": call.name, "arguments": call.arguments}})
                    })
                    .collect();
                json!({
                    "role": "assistant",
                    "content": text,
                    "tool_calls": tool_calls
                })
            }
            TurnMessage::ToolResult { name, content, .. } => json!({
                "role": "tool",
                "tool_name": name,
                "content": content
            }),
        })
        .collect()
}

fn handle_line(
    turn: &mut ModelTurn,
    line: &str,
    on_text: &TextSink<'_>,
) -> Result<()> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }
    let chunk: Value = serde_json::from_str(line)?;
    if let Some(error) = chunk["error"].as_str() {
        return Err(ExecutorError::Model(format!("ollama error: {}", error)));
    }

    let message = &chunk["message"];
    if let Some(text) = message["content"].as_str().filter(|t| !t.is_empty()) {
        turn.text.push_str(text);
        on_text(text);
    }
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            let function = &call["function"];
            // Ollama sends arguments as an object; tolerate a JSON string too
            let arguments = match &function["arguments"] {
                Value::String(raw) => super::parse_arguments(raw)?,
                Value::Null => json!({}),
                other => other.clone(),
            };
            turn.tool_calls.push(ToolCall {
                id: format!("call_{}", Uuid::new_v4().simple()),
                name: function["name"].as_str().unwrap_or_default().to_string(),
                arguments,
            });
        }
    }
    if chunk["done"].as_bool() == Some(true) {
        debug!(
            "Ollama turn finished: {}",
            chunk["done_reason"].as_str().unwrap_or("stop")
        );
    }
    Ok(())
}
