use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Task context error: {0}")]
    Context(String),

    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
