//! Chat model clients for the supported providers.
//!
//! Each client speaks one wire protocol and streams a single assistant turn:
//! text deltas go to the caller as they arrive, tool calls are collected and
//! returned once the turn ends.

mod anthropic;
mod ollama;
mod openai;

pub use anthropic::AnthropicChatModel;
pub use ollama::OllamaChatModel;
pub use openai::OpenAiChatModel;

use super::conversation::ChatMessage;
use super::error::{ExecutorError, Result};
use super::mcp::McpTool;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Ollama,
    Google,
    Mistral,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Ollama => "ollama",
            Provider::Google => "google",
            Provider::Mistral => "mistral",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4",
            Provider::Anthropic => "claude-sonnet-4-20250514",
            Provider::Ollama => "llama2",
            Provider::Google => "gemini-2.5-flash-lite-preview-06-17",
            Provider::Mistral => "mistral-medium",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.together.xyz/v1",
            Provider::Anthropic => "https://api.anthropic.com/v1",
            Provider::Ollama => "http://localhost:11434",
            Provider::Google => "https://generativelanguage.googleapis.com/v1beta/openai",
            Provider::Mistral => "https://api.mistral.ai/v1",
        }
    }

    /// Environment variable holding the provider's API key.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("OPENAI_API_KEY"),
            Provider::Anthropic => Some("ANTHROPIC_API_KEY"),
            Provider::Ollama => None,
            Provider::Google => Some("GOOGLE_API_KEY"),
            Provider::Mistral => Some("MISTRAL_API_KEY"),
        }
    }

    pub fn requires_api_key(&self) -> bool {
        self.api_key_env().is_some()
    }
}

impl FromStr for Provider {
    type Err = ExecutorError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            "ollama" => Ok(Provider::Ollama),
            "google" => Ok(Provider::Google),
            "mistral" => Ok(Provider::Mistral),
            other => Err(ExecutorError::UnsupportedProvider(other.to_string())),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully resolved settings for one chat model client.
#[derive(Clone)]
pub struct ProviderSettings {
    pub provider: Provider,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub base_url: String,
    pub timeout: Duration,
}

impl ProviderSettings {
    pub fn for_provider(provider: Provider) -> Self {
        Self {
            provider,
            model: provider.default_model().to_string(),
            api_key: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            base_url: provider.default_base_url().to_string(),
            timeout: Duration::from_secs(300),
        }
    }

    fn require_api_key(&self) -> Result<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                ExecutorError::Config(format!(
                    "{} requires an API key ({})",
                    self.provider,
                    self.provider.api_key_env().unwrap_or("api_key")
                ))
            })
    }

    fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ExecutorError::Model(format!("Failed to create client: {}", e)))
    }
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("has_api_key", &self.api_key.is_some())
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Messages inside one agent run. Only `Chat` messages outlive the run.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnMessage {
    Chat(ChatMessage),
    AssistantToolCalls {
        text: String,
        calls: Vec<ToolCall>,
    },
    ToolResult {
        call_id: String,
        name: String,
        content: String,
        is_error: bool,
    },
}

pub struct ModelRequest<'a> {
    pub messages: &'a [TurnMessage],
    pub tools: &'a [McpTool],
}

/// Receives streamed text deltas.
pub type TextSink<'a> = dyn for<'s> Fn(&'s str) + Send + Sync + 'a;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Provider and model, for logs.
    fn describe(&self) -> String;

    /// Streams one assistant turn, passing text deltas to `on_text` in
    /// arrival order.
    async fn stream_turn(
        &self,
        request: &ModelRequest<'_>,
        on_text: &TextSink<'_>,
    ) -> Result<ModelTurn>;
}

pub fn build_chat_model(settings: &ProviderSettings) -> Result<Arc<dyn ChatModel>> {
    info!(
        "Creating chat model: provider={}, model={}",
        settings.provider, settings.model
    );
    let model: Arc<dyn ChatModel> = match settings.provider {
        Provider::Anthropic => Arc::new(AnthropicChatModel::new(settings)?),
        Provider::OpenAi | Provider::Google | Provider::Mistral => {
            Arc::new(OpenAiChatModel::new(settings)?)
        }
        Provider::Ollama => Arc::new(OllamaChatModel::new(settings)?),
    };
    Ok(model)
}

/// Splits a byte stream into lines without breaking multi-byte characters
/// that straddle chunk boundaries.
#[derive(Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Whatever is left after the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

pub(crate) async fn ensure_success(
    response: reqwest::Response,
    provider: Provider,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read response>".to_string());
    Err(ExecutorError::Model(format!(
        "{} chat error ({}): {}",
        provider, status, text
    )))
}

/// Tool arguments arrive as a JSON string; an empty string means no
/// arguments.
pub(crate) fn parse_arguments(raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw)
        .map_err(|e| ExecutorError::Model(format!("Invalid tool arguments {:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn provider_names_are_case_insensitive() {
        assert_eq!("Anthropic".parse::<Provider>().unwrap(), Provider::Anthropic);
        assert_eq!(" OPENAI ".parse::<Provider>().unwrap(), Provider::OpenAi);
        assert_eq!("google".parse::<Provider>().unwrap(), Provider::Google);
        assert!(matches!(
            "bedrock".parse::<Provider>(),
            Err(ExecutorError::UnsupportedProvider(name)) if name == "bedrock"
        ));
    }

    #[test]
    fn provider_defaults() {
        let settings = ProviderSettings::for_provider(Provider::Anthropic);
        assert_eq!(settings.model, "claude-sonnet-4-20250514");
        assert_eq!(settings.max_tokens, 8192);
        assert!((settings.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(
            ProviderSettings::for_provider(Provider::OpenAi).base_url,
            "https://api.together.xyz/v1"
        );
        assert!(!Provider::Ollama.requires_api_key());
        assert_eq!(Provider::Mistral.default_model(), "mistral-medium");
    }

    #[test]
    fn missing_api_key_fails_construction() {
        let settings = ProviderSettings::for_provider(Provider::Mistral);
        assert!(matches!(
            build_chat_model(&settings),
            Err(ExecutorError::Config(_))
        ));

        let ollama = ProviderSettings::for_provider(Provider::Ollama);
        let model = build_chat_model(&ollama).unwrap();
        assert_eq!(model.describe(), "ollama/llama2");
    }

    #[test]
    fn line_buffer_handles_split_chunks() {
        let mut buffer = LineBuffer::default();
        let text = "data: héllo\r\ndata: two\n";
        let bytes = text.as_bytes();
        // split inside the two-byte 'é'
        let cut = text.find('é').unwrap() + 1;
        assert!(buffer.push(&bytes[..cut]).is_empty());
        let lines = buffer.push(&bytes[cut..]);
        assert_eq!(lines, vec!["data: héllo", "data: two"]);
        assert!(buffer.finish().is_none());

        buffer.push(b"{\"done\":true}");
        assert_eq!(buffer.finish().as_deref(), Some("{\"done\":true}"));
    }

    #[test]
    fn empty_arguments_become_empty_object() {
        assert_eq!(parse_arguments("").unwrap(), json!({}));
        assert_eq!(parse_arguments("{\"a\":1}").unwrap(), json!({"a": 1}));
        assert!(parse_arguments("{oops").is_err());
    }
}
