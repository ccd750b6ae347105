//! Conversation messages and the per-session history store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheControl {
    Ephemeral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    /// System message marked for provider-side prompt caching.
    pub fn system_cached(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Blocks(vec![ContentBlock::Text {
                text: text.into(),
                cache_control: Some(CacheControl::Ephemeral),
            }]),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Concatenated plain text of the message.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text, .. } => text.as_str(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

pub fn has_system_prompt(messages: &[ChatMessage]) -> bool {
    messages.iter().any(|m| m.role == Role::System)
}

/// Session-keyed conversation history. Callers that run concurrent
/// invocations for the same session must serialize them; the store only
/// guarantees that each load/save is atomic.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// History for the session, empty when unseen.
    async fn load(&self, session_id: &str) -> Vec<ChatMessage>;

    async fn save(&self, session_id: &str, messages: Vec<ChatMessage>);

    async fn evict(&self, session_id: &str) -> bool;

    async fn session_count(&self) -> usize;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EvictionPolicy {
    pub max_sessions: Option<usize>,
    pub idle_ttl: Option<Duration>,
}

struct SessionEntry {
    messages: Vec<ChatMessage>,
    last_used: Instant,
}

pub struct InMemoryConversationStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    policy: EvictionPolicy,
}

impl InMemoryConversationStore {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            policy,
        }
    }

    fn drop_expired(&self, sessions: &mut HashMap<String, SessionEntry>) {
        let Some(ttl) = self.policy.idle_ttl else {
            return;
        };
        let before = sessions.len();
        sessions.retain(|_, entry| entry.last_used.elapsed() < ttl);
        let dropped = before - sessions.len();
        if dropped > 0 {
            info!("Dropped {} idle conversation(s)", dropped);
        }
    }

    fn enforce_capacity(&self, sessions: &mut HashMap<String, SessionEntry>) {
        let Some(max) = self.policy.max_sessions else {
            return;
        };
        while sessions.len() > max {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    sessions.remove(&id);
                    info!("Evicted least recently used conversation {}", id);
                }
                None => break,
            }
        }
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new(EvictionPolicy::default())
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, session_id: &str) -> Vec<ChatMessage> {
        let mut sessions = self.sessions.lock().await;
        self.drop_expired(&mut sessions);
        match sessions.get_mut(session_id) {
            Some(entry) => {
                entry.last_used = Instant::now();
                info!(
                    "Reusing conversation history for session {} ({} messages)",
                    session_id,
                    entry.messages.len()
                );
                entry.messages.clone()
            }
            None => {
                info!("Starting new conversation history for session {}", session_id);
                Vec::new()
            }
        }
    }

    async fn save(&self, session_id: &str, messages: Vec<ChatMessage>) {
        let mut sessions = self.sessions.lock().await;
        debug!(
            "Saving conversation history for session {} ({} messages)",
            session_id,
            messages.len()
        );
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                messages,
                last_used: Instant::now(),
            },
        );
        self.enforce_capacity(&mut sessions);
    }

    async fn evict(&self, session_id: &str) -> bool {
        self.sessions.lock().await.remove(session_id).is_some()
    }

    async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unseen_session_starts_empty() {
        let store = InMemoryConversationStore::default();
        assert!(store.load("nobody").await.is_empty());
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn saved_history_is_returned_per_session() {
        let store = InMemoryConversationStore::default();
        store
            .save("a", vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")])
            .await;
        store.save("b", vec![ChatMessage::user("other")]).await;

        let a = store.load("a").await;
        assert_eq!(a.len(), 2);
        assert_eq!(a[1].text(), "hello");
        assert_eq!(store.load("b").await.len(), 1);
        assert!(store.evict("a").await);
        assert!(!store.evict("a").await);
        assert!(store.load("a").await.is_empty());
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let store = InMemoryConversationStore::new(EvictionPolicy {
            max_sessions: Some(2),
            idle_ttl: None,
        });
        store.save("first", vec![ChatMessage::user("1")]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.save("second", vec![ChatMessage::user("2")]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        // touch "first" so "second" becomes the oldest
        store.load("first").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.save("third", vec![ChatMessage::user("3")]).await;

        assert_eq!(store.session_count().await, 2);
        assert!(store.load("second").await.is_empty());
        assert_eq!(store.load("first").await.len(), 1);
    }

    #[tokio::test]
    async fn idle_sessions_expire_on_access() {
        let store = InMemoryConversationStore::new(EvictionPolicy {
            max_sessions: None,
            idle_ttl: Some(Duration::ZERO),
        });
        store.save("s", vec![ChatMessage::user("1")]).await;
        assert!(store.load("s").await.is_empty());
    }

    #[test]
    fn cached_system_message_serializes_cache_control() {
        let message = ChatMessage::system_cached("prompt");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "role": "system",
                "content": [{
                    "type": "text",
                    "text": "prompt",
                    "cache_control": {"type": "ephemeral"}
                }]
            })
        );
        assert!(has_system_prompt(&[message]));
        assert!(!has_system_prompt(&[ChatMessage::user("q")]));
    }
}
