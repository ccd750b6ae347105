use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use super::conversation::EvictionPolicy;
use super::llm::{Provider, ProviderSettings, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use super::session::SessionDefaults;

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub session: SessionDefaults,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

#[derive(Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("has_api_key", &self.api_key.is_some())
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Bounds for the in-memory conversation store; unset means unbounded.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryConfig {
    #[serde(default)]
    pub max_sessions: Option<usize>,
    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,
}

fn default_provider() -> String {
    Provider::Anthropic.as_str().to_string()
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_max_iterations() -> usize {
    25
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            base_url: None,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            session: SessionDefaults::default(),
            max_iterations: default_max_iterations(),
            request_timeout_secs: default_request_timeout_secs(),
            history: HistoryConfig::default(),
            log_dir: default_log_dir(),
        }
    }
}

impl ExecutorConfig {
    /// Reads the JSON file when given, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_path(&expand_path(path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config at {}: {}", path.display(), e))?;
        Self::from_json_str(&data)
            .map_err(|e| anyhow!("Failed to parse config JSON at {}: {}", path.display(), e))
    }

    pub fn from_json_str(data: &str) -> Result<Self> {
        let mut config: ExecutorConfig = serde_json::from_str(data)?;
        config.llm.provider = config.llm.provider.trim().to_string();
        if config.llm.provider.is_empty() {
            config.llm.provider = default_provider();
        }
        if config.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be at least 1"));
        }
        Ok(config)
    }

    /// Environment wins over the file. `lookup` is `std::env::var` outside
    /// of tests.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(provider) = get("COPILOT_LLM_PROVIDER") {
            self.llm.provider = provider;
        }
        if let Some(model) = get("COPILOT_LLM_MODEL") {
            self.llm.model = Some(model);
        }
        if let Some(base_url) = get("COPILOT_LLM_BASE_URL") {
            self.llm.base_url = Some(base_url);
        }
        if let Some(username) = get("COPILOT_DEFAULT_USERNAME") {
            self.session.username = username;
        }
        if let Some(tenant) = get("COPILOT_DEFAULT_TENANT") {
            self.session.tenant = tenant;
        }
        if let Some(password) = get("COPILOT_DEFAULT_PASSWORD") {
            self.session.password = Some(password);
        }
        if let Some(server_url) = get("COPILOT_DEFAULT_SERVER_URL") {
            self.session.server_url = server_url;
        }
        if let Some(mcp_url) = get("COPILOT_MCP_URL") {
            self.session.mcp_server_url = mcp_url;
        }
        if let Some(n) = get("COPILOT_MAX_ITERATIONS").and_then(|v| v.parse::<usize>().ok()) {
            if n > 0 {
                self.max_iterations = n;
            }
        }
        if let Some(secs) = get("COPILOT_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.request_timeout_secs = secs;
        }

        if self.llm.api_key.is_none() {
            let key_env = self
                .llm
                .provider
                .parse::<Provider>()
                .ok()
                .and_then(|p| p.api_key_env());
            if let Some(env_name) = key_env {
                self.llm.api_key = get(env_name);
            }
        }
    }

    pub fn provider_settings(&self) -> super::error::Result<ProviderSettings> {
        let provider: Provider = self.llm.provider.parse()?;
        let mut settings = ProviderSettings::for_provider(provider);
        if let Some(model) = self.llm.model.as_ref().filter(|m| !m.trim().is_empty()) {
            settings.model = model.trim().to_string();
        }
        if let Some(base_url) = self.llm.base_url.as_ref().filter(|u| !u.trim().is_empty()) {
            settings.base_url = base_url.trim().trim_end_matches('/').to_string();
        }
        settings.api_key = self.llm.api_key.clone();
        settings.temperature = self.llm.temperature;
        settings.max_tokens = self.llm.max_tokens;
        settings.timeout = self.request_timeout();
        Ok(settings)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            max_sessions: self.history.max_sessions,
            idle_ttl: self.history.idle_ttl_secs.map(Duration::from_secs),
        }
    }
}

fn expand_path(input: &Path) -> PathBuf {
    let Some(raw) = input.to_str() else {
        return input.to_path_buf();
    };
    if let Some(stripped) = raw.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    input.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::error::ExecutorError;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = ExecutorConfig::from_json_str("{}").unwrap();
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.max_iterations, 25);
        assert!(config.session.password.is_none());

        let settings = config.provider_settings().unwrap();
        assert_eq!(settings.provider, Provider::Anthropic);
        assert_eq!(settings.model, "claude-sonnet-4-20250514");
        assert_eq!(settings.timeout, Duration::from_secs(300));
    }

    #[test]
    fn file_values_are_read() {
        let config = ExecutorConfig::from_json_str(
            r#"{
                "llm": {"provider": "Mistral", "model": "mistral-large", "temperature": 0.2},
                "session": {"tenant": "acme", "mcp_server_url": "http://tools:8000/mcp/"},
                "max_iterations": 8,
                "history": {"max_sessions": 100, "idle_ttl_secs": 3600}
            }"#,
        )
        .unwrap();
        let settings = config.provider_settings().unwrap();
        assert_eq!(settings.provider, Provider::Mistral);
        assert_eq!(settings.model, "mistral-large");
        assert_eq!(settings.base_url, "https://api.mistral.ai/v1");
        assert_eq!(config.session.tenant, "acme");
        assert_eq!(config.session.username, "admin");
        assert_eq!(config.max_iterations, 8);

        let policy = config.eviction_policy();
        assert_eq!(policy.max_sessions, Some(100));
        assert_eq!(policy.idle_ttl, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn zero_iterations_is_rejected() {
        assert!(ExecutorConfig::from_json_str(r#"{"max_iterations": 0}"#).is_err());
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = ExecutorConfig::default();
        config.apply_overrides(env(&[
            ("COPILOT_LLM_PROVIDER", "openai"),
            ("COPILOT_LLM_MODEL", "gpt-4o"),
            ("OPENAI_API_KEY", "sk-openai"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("COPILOT_DEFAULT_PASSWORD", "from-env"),
            ("COPILOT_MCP_URL", "http://mcp.internal/mcp/"),
            ("COPILOT_MAX_ITERATIONS", "12"),
        ]));

        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-openai"));
        assert_eq!(config.session.password.as_deref(), Some("from-env"));
        assert_eq!(config.session.mcp_server_url, "http://mcp.internal/mcp/");
        assert_eq!(config.max_iterations, 12);
        assert_eq!(config.provider_settings().unwrap().model, "gpt-4o");
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let mut config = ExecutorConfig::default();
        config.apply_overrides(env(&[("COPILOT_MAX_ITERATIONS", "lots"), ("COPILOT_LLM_MODEL", "  ")]));
        assert_eq!(config.max_iterations, 25);
        assert!(config.llm.model.is_none());
    }

    #[test]
    fn unknown_provider_is_rejected_when_resolving() {
        let mut config = ExecutorConfig::default();
        config.llm.provider = "cohere".to_string();
        assert!(matches!(
            config.provider_settings(),
            Err(ExecutorError::UnsupportedProvider(_))
        ));
    }

    #[test]
    fn debug_hides_api_key() {
        let mut config = ExecutorConfig::default();
        config.llm.api_key = Some("sk-secret".to_string());
        assert!(!format!("{:?}", config).contains("sk-secret"));
    }
}
