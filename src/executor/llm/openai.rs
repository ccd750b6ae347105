use super::{
    ensure_success, parse_arguments, ChatModel, LineBuffer, ModelRequest, ModelTurn,
    ProviderSettings, TextSink, ToolCall, TurnMessage,
};
use crate::executor::error::{ExecutorError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Chat-completions client shared by every OpenAI-compatible endpoint
/// (OpenAI-style gateways, Gemini's compatibility layer, Mistral).
pub struct OpenAiChatModel {
    client: reqwest::Client,
    settings: ProviderSettings,
    api_key: String,
}

impl OpenAiChatModel {
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        Ok(Self {
            client: settings.http_client()?,
            api_key: settings.require_api_key()?,
            settings: settings.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn build_body(&self, request: &ModelRequest<'_>) -> Value {
        let mut body = json!({
            "model": self.settings.model,
            "messages": convert_messages(request.messages),
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
            "stream": true
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
impl ChatModel for OpenAiChatModel {
    fn describe(&self) -> String {
        format!("{}/{}", self.settings.provider, self.settings.model)
    }

    async fn stream_turn(
        &self,
        request: &ModelRequest<'_>,
        on_text: &TextSink<'_>,
    ) -> Result<ModelTurn> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&self.build_body(request))
            .send()
            .await?;
        let response = ensure_success(response, self.settings.provider).await?;

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut state = StreamState::default();
        'read: while let Some(chunk) = stream.next().await {
            for line in lines.push(&chunk?) {
                if state.handle_line(&line, on_text)? == Flow::Done {
                    break 'read;
                }
            }
        }
        if let Some(line) = lines.finish() {
            state.handle_line(&line, on_text)?;
        }
        state.finish()
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
                let content = if text.is_empty() {
                    Value::Null
                } else {
                    Value::String(text.clone())
                };
                json!({
                    "role": "assistant",
                    "content": content,
                    "tool_calls": calls
                        .iter()
                        .map(|call| json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string()
                            }
                        }))
                        .collect::<Vec<_>>()
                })
            }
            TurnMessage::ToolResult {
                call_id,
                name,
                content,
                ..
            } => json!({
                "role": "tool",
                "tool_call_id": call_id,
                "name": name,
                "content": content
            }),
        })
        .collect()
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Done,
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Default)]
struct StreamState {
    text: String,
    calls: BTreeMap<u64, PartialCall>,
}

impl StreamState {
    fn handle_line(&mut self, line: &str, on_text: &TextSink<'_>) -> Result<Flow> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(Flow::Continue);
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(Flow::Continue);
        }
        if data == "[DONE]" {
            return Ok(Flow::Done);
        }

        let chunk: Value = serde_json::from_str(data)?;
        if let Some(error) = chunk.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(ExecutorError::Model(format!("stream error: {}", message)));
        }

        let Some(choice) = chunk["choices"].get(0) else {
            return Ok(Flow::Continue);
        };
        let delta = &choice["delta"];
        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            self.text.push_str(text);
            on_text(text);
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or_default();
                let partial = self.calls.entry(index).or_default();
                if let Some(id) = call["id"].as_str() {
                    partial.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    partial.name.push_str(name);
                }
                if let Some(args) = call["function"]["arguments"].as_str() {
                    partial.arguments.push_str(args);
                }
            }
        }
        if let Some(reason) = choice["finish_reason"].as_str() {
            debug!("Finish reason: {}", reason);
        }
        Ok(Flow::Continue)
    }

    fn finish(self) -> Result<ModelTurn> {
        let tool_calls = self
            .calls
            .into_iter()
            .map(|(index, call)| {
                Ok(ToolCall {
                    id: if call.id.is_empty() {
                        format!("call_{}", index)
                    } else {
                        call.id
                    },
                    name: call.name,
                    arguments: parse_arguments(&call.arguments)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ModelTurn {
            text: self.text,
            tool_calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::conversation::ChatMessage;
    use crate::executor::llm::Provider;
    use std::sync::Mutex;

    fn model(provider: Provider) -> OpenAiChatModel {
        let mut settings = ProviderSettings::for_provider(provider);
        settings.api_key = Some("key".to_string());
        OpenAiChatModel::new(&settings).unwrap()
    }

    #[test]
    fn endpoints_follow_provider_base_url() {
        assert_eq!(
            model(Provider::Mistral).endpoint(),
            "https://api.mistral.ai/v1/chat/completions"
        );
        assert_eq!(
            model(Provider::Google).endpoint(),
            "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
        );
    }

    #[test]
    fn body_omits_tools_when_none_and_flattens_system() {
        let messages = vec![
            TurnMessage::Chat(ChatMessage::system_cached("Be precise.")),
            TurnMessage::Chat(ChatMessage::user("hi")),
        ];
        let body = model(Provider::OpenAi).build_body(&ModelRequest {
            messages: &messages,
            tools: &[],
        });
        assert!(body.get("tools").is_none());
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(
            body["messages"][0],
            json!({"role": "system", "content": "Be precise."})
        );
    }

    #[test]
    fn tool_turns_use_function_call_shape() {
        let converted = convert_messages(&[
            TurnMessage::AssistantToolCalls {
                text: String::new(),
                calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    name: "query_data".to_string(),
                    arguments: json!({"limit": 5}),
                }],
            },
            TurnMessage::ToolResult {
                call_id: "call_1".to_string(),
                name: "query_data".to_string(),
                content: "5 rows".to_string(),
                is_error: false,
            },
        ]);
        assert_eq!(converted[0]["content"], Value::Null);
        assert_eq!(converted[0]["tool_calls"][0]["function"]["arguments"], "{\"limit\":5}");
        assert_eq!(converted[1]["role"], "tool");
        assert_eq!(converted[1]["tool_call_id"], "call_1");
    }

    #[test]
    fn stream_accumulates_text_and_indexed_tool_deltas() {
        let seen = Mutex::new(String::new());
        let on_text = |t: &str| seen.lock().unwrap().push_str(t);
        let mut state = StreamState::default();
        let lines = [
            r#"data: {"choices":[{"index":0,"delta":{"role":"assistant","content":"Looking"}}]}"#,
            r#"data: {"choices":[{"index":0,"delta":{"content":" it up"}}]}"#,
            r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_a","type":"function","function":{"name":"get_schema","arguments":""}}]}}]}"#,
            r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"name\":"}}]}}]}"#,
            r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"Sales\"}"}}]}}]}"#,
            r#"data: {"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
        ];
        for line in lines {
            assert_eq!(state.handle_line(line, &on_text).unwrap(), Flow::Continue);
        }
        assert_eq!(state.handle_line("data: [DONE]", &on_text).unwrap(), Flow::Done);

        let turn = state.finish().unwrap();
        assert_eq!(*seen.lock().unwrap(), "Looking it up");
        assert_eq!(turn.text, "Looking it up");
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].id, "call_a");
        assert_eq!(turn.tool_calls[0].arguments, json!({"name": "Sales"}));
    }

    #[test]
    fn error_chunk_fails_the_turn() {
        let mut state = StreamState::default();
        let result = state.handle_line(
            r#"data: {"error":{"message":"rate limited"}}"#,
            &|_: &str| {},
        );
        assert!(matches!(result, Err(ExecutorError::Model(m)) if m.contains("rate limited")));
    }
}
