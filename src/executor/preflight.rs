//! Runtime checks run before every task. Problems are logged and reported
//! but never stop the task; the failing call surfaces the real error later.

use super::config::ExecutorConfig;
use super::llm::Provider;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreflightIssue {
    UnknownProvider(String),
    MissingApiKey { provider: Provider, env: &'static str },
    InvalidUrl { name: &'static str, value: String },
    LogDirNotWritable(String),
}

impl fmt::Display for PreflightIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreflightIssue::UnknownProvider(name) => write!(f, "unknown LLM provider '{}'", name),
            PreflightIssue::MissingApiKey { provider, env } => {
                write!(f, "no API key for {} (set {})", provider, env)
            }
            PreflightIssue::InvalidUrl { name, value } => {
                write!(f, "{} is not a valid URL: {}", name, value)
            }
            PreflightIssue::LogDirNotWritable(dir) => write!(f, "log directory {} is not writable", dir),
        }
    }
}

#[derive(Debug, Default)]
pub struct PreflightReport {
    pub issues: Vec<PreflightIssue>,
}

impl PreflightReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

pub fn run(config: &ExecutorConfig) -> PreflightReport {
    let mut report = PreflightReport::default();

    match config.provider_settings() {
        Ok(settings) => {
            if let Some(env) = settings.provider.api_key_env() {
                if settings.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
                    report.issues.push(PreflightIssue::MissingApiKey {
                        provider: settings.provider,
                        env,
                    });
                }
            }
            check_url(&mut report, "LLM base URL", &settings.base_url);
            info!(
                "Runtime: {} {}, provider={}, model={}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                settings.provider,
                settings.model
            );
        }
        Err(_) => report
            .issues
            .push(PreflightIssue::UnknownProvider(config.llm.provider.clone())),
    }

    check_url(&mut report, "default MCP server URL", &config.session.mcp_server_url);
    check_url(&mut report, "default server URL", &config.session.server_url);

    if !log_dir_writable(Path::new(&config.log_dir)) {
        report
            .issues
            .push(PreflightIssue::LogDirNotWritable(config.log_dir.clone()));
    }

    for issue in &report.issues {
        warn!("Preflight: {}", issue);
    }
    report
}

fn check_url(report: &mut PreflightReport, name: &'static str, value: &str) {
    if Url::parse(value).is_err() {
        report.issues.push(PreflightIssue::InvalidUrl {
            name,
            value: value.to_string(),
        });
    }
}

fn log_dir_writable(dir: &Path) -> bool {
    let scratch = dir.join(".preflight_write");
    std::fs::create_dir_all(dir)
        .and_then(|_| std::fs::File::create(&scratch))
        .map(|_| std::fs::remove_file(&scratch))
        .is_ok()
}
