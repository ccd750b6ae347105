use super::contract::{OperatorCatalog, TaskContext};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};

pub const DEFAULT_SESSION_ID: &str = "default";

/// Values used when the host context leaves a credential field empty.
#[derive(Clone, Deserialize)]
pub struct SessionDefaults {
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_mcp_server_url")]
    pub mcp_server_url: String,
}

fn default_username() -> String {
    "admin".to_string()
}

fn default_tenant() -> String {
    "demo".to_string()
}

fn default_server_url() -> String {
    "http://localhost:8080/incorta".to_string()
}

fn default_mcp_server_url() -> String {
    "http://localhost:8000/mcp/".to_string()
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            username: default_username(),
            tenant: default_tenant(),
            password: None,
            server_url: default_server_url(),
            mcp_server_url: default_mcp_server_url(),
        }
    }
}

impl fmt::Debug for SessionDefaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDefaults")
            .field("username", &self.username)
            .field("tenant", &self.tenant)
            .field("has_password", &self.password.is_some())
            .field("server_url", &self.server_url)
            .field("mcp_server_url", &self.mcp_server_url)
            .finish()
    }
}

/// Identity and endpoints for the user behind one task invocation.
#[derive(Clone, PartialEq)]
pub struct UserSession {
    pub session_id: String,
    pub username: String,
    pub tenant: String,
    pub password: Option<String>,
    pub server_url: String,
    pub mcp_server_url: String,
}

impl fmt::Debug for UserSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSession")
            .field("session_id", &self.session_id)
            .field("username", &self.username)
            .field("tenant", &self.tenant)
            .field("has_password", &self.password.is_some())
            .field("server_url", &self.server_url)
            .field("mcp_server_url", &self.mcp_server_url)
            .finish()
    }
}

impl UserSession {
    pub fn resolve(
        ctx: &TaskContext,
        catalog: &OperatorCatalog,
        defaults: &SessionDefaults,
    ) -> Self {
        let user_value = |key: &str| non_blank(ctx.user_context.as_ref(), key);
        let server_value = |key: &str| non_blank(ctx.server_context.as_ref(), key);

        let mcp_server_url = executor_args(ctx, catalog)
            .get("mcp_server_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| defaults.mcp_server_url.clone());

        let session = Self {
            session_id: session_key(ctx.session_id.as_deref()),
            username: user_value("user").unwrap_or_else(|| defaults.username.clone()),
            tenant: user_value("tenant").unwrap_or_else(|| defaults.tenant.clone()),
            password: user_value("password").or_else(|| defaults.password.clone()),
            server_url: server_value("server_url")
                .map(|url| url.trim().to_string())
                .unwrap_or_else(|| defaults.server_url.clone()),
            mcp_server_url,
        };

        info!(
            "Resolved user session: session_id={}, username={}, tenant={}, has_password={}",
            session.session_id,
            session.username,
            session.tenant,
            session.password.is_some()
        );
        session
    }

    /// Connection headers understood by the tool server, in a fixed order.
    pub fn mcp_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        let mut push = |key: &str, value: &str| {
            if !value.is_empty() {
                headers.push((key.to_string(), value.to_string()));
            }
        };
        push("env-url", &self.server_url);
        push("tenant", &self.tenant);
        push("user", &self.username);
        if let Some(password) = self.password.as_deref() {
            push("password", password);
        }
        headers
    }
}

/// Conversation key for a host session id. Blank and missing ids share the
/// default history.
pub fn session_key(session_id: Option<&str>) -> String {
    session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or(DEFAULT_SESSION_ID)
        .to_string()
}

/// Blank values count as missing. Present values are passed on verbatim,
/// since credentials may legitimately carry spaces.
fn non_blank(map: Option<&HashMap<String, String>>, key: &str) -> Option<String> {
    map.and_then(|m| m.get(key))
        .filter(|value| !value.trim().is_empty())
        .cloned()
}

pub fn executor_args(ctx: &TaskContext, catalog: &OperatorCatalog) -> HashMap<String, Value> {
    let Some(operator) = ctx.current_operator() else {
        warn!("Current task has no operator name; executor args unavailable");
        return HashMap::new();
    };
    match catalog.get(operator) {
        Some(meta) => meta.executor_args.clone(),
        None => {
            warn!("Operator '{}' not found in catalog", operator);
            HashMap::new()
        }
    }
}

pub fn linked_schema(ctx: &TaskContext, catalog: &OperatorCatalog) -> Option<String> {
    let operator = ctx.current_operator()?;
    let schema = catalog
        .get(operator)
        .and_then(|meta| meta.linked_schema.clone())
        .filter(|schema| !schema.trim().is_empty());
    if schema.is_none() {
        info!("No linked schema configured for operator '{}'", operator);
    }
    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::contract::{OperatorMeta, TaskEntry};
    use serde_json::json;

    fn context(
        user_context: Option<HashMap<String, String>>,
        server_context: Option<HashMap<String, String>>,
    ) -> TaskContext {
        TaskContext {
            version: 1,
            task_index: 0,
            tasks: vec![TaskEntry {
                id: 1,
                status: None,
                result: None,
                operator: Some("analyst".to_string()),
            }],
            session_id: Some("sess-42".to_string()),
            user_context,
            server_context,
            user_query: "revenue by region".to_string(),
            uploaded_file_paths: Vec::new(),
        }
    }

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_contexts_fall_back_to_defaults() {
        let ctx = TaskContext {
            session_id: None,
            ..context(None, None)
        };
        let defaults = SessionDefaults::default();
        let session = UserSession::resolve(&ctx, &OperatorCatalog::default(), &defaults);

        assert_eq!(session.session_id, DEFAULT_SESSION_ID);
        assert_eq!(session.username, "admin");
        assert_eq!(session.tenant, "demo");
        assert_eq!(session.password, None);
        assert_eq!(session.server_url, defaults.server_url);
        assert_eq!(session.mcp_server_url, defaults.mcp_server_url);
    }

    #[test]
    fn host_values_and_operator_override_win() {
        let ctx = context(
            Some(map(&[("user", "maya"), ("tenant", "acme"), ("password", "s3cret")])),
            Some(map(&[("server_url", "https://analytics.acme.test/incorta")])),
        );
        let mut catalog = OperatorCatalog::default();
        let mut executor_args = HashMap::new();
        executor_args.insert(
            "mcp_server_url".to_string(),
            json!("https://tools.acme.test/mcp/"),
        );
        catalog.insert(
            "analyst",
            OperatorMeta {
                linked_schema: Some("SalesBusiness".to_string()),
                executor_args,
            },
        );

        let session = UserSession::resolve(&ctx, &catalog, &SessionDefaults::default());
        assert_eq!(session.session_id, "sess-42");
        assert_eq!(session.username, "maya");
        assert_eq!(session.tenant, "acme");
        assert_eq!(session.password.as_deref(), Some("s3cret"));
        assert_eq!(session.server_url, "https://analytics.acme.test/incorta");
        assert_eq!(session.mcp_server_url, "https://tools.acme.test/mcp/");
        assert_eq!(
            linked_schema(&ctx, &catalog).as_deref(),
            Some("SalesBusiness")
        );
    }

    #[test]
    fn headers_are_ordered_and_skip_missing_password() {
        let ctx = context(Some(map(&[("user", "maya")])), None);
        let session = UserSession::resolve(&ctx, &OperatorCatalog::default(), &SessionDefaults::default());
        let keys: Vec<String> = session.mcp_headers().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["env-url", "tenant", "user"]);

        let with_password = UserSession {
            password: Some("pw".to_string()),
            ..session
        };
        let keys: Vec<String> = with_password
            .mcp_headers()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["env-url", "tenant", "user", "password"]);
    }

    #[test]
    fn configured_default_password_is_used() {
        let defaults = SessionDefaults {
            password: Some("fallback".to_string()),
            ..SessionDefaults::default()
        };
        let session = UserSession::resolve(&context(None, None), &OperatorCatalog::default(), &defaults);
        assert_eq!(session.password.as_deref(), Some("fallback"));
    }

    #[test]
    fn debug_output_never_contains_password() {
        let ctx = context(Some(map(&[("password", "hunter2")])), None);
        let session = UserSession::resolve(&ctx, &OperatorCatalog::default(), &SessionDefaults::default());
        let rendered = format!("{:?}", session);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("has_password: true"));
    }

    #[test]
    fn credentials_are_passed_through_verbatim() {
        let ctx = context(
            Some(map(&[("user", " maya "), ("password", " pa ss "), ("tenant", "   ")])),
            None,
        );
        let session = UserSession::resolve(&ctx, &OperatorCatalog::default(), &SessionDefaults::default());
        assert_eq!(session.password.as_deref(), Some(" pa ss "));
        assert_eq!(session.username, " maya ");
        assert_eq!(session.tenant, "demo");
        let headers = session.mcp_headers();
        assert!(headers.contains(&("password".to_string(), " pa ss ".to_string())));
    }

    #[test]
    fn blank_and_missing_session_ids_share_a_key() {
        assert_eq!(session_key(None), DEFAULT_SESSION_ID);
        assert_eq!(session_key(Some("")), DEFAULT_SESSION_ID);
        assert_eq!(session_key(Some("  ")), DEFAULT_SESSION_ID);
        assert_eq!(session_key(Some("sess-42")), "sess-42");
    }
}
