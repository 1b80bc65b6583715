//! LLM provider adapters.
//!
//! Every adapter wraps a vendor chat-completion endpoint behind the same
//! interface and returns the unified [`ChatOutcome`] shape.  Outbound
//! requests are checked against a shared origin allow-list before any
//! network I/O.
//!
//! Errors are plain strings: the failover router classifies them by
//! matching retriable markers (429, 5xx, connection/timeout) in the text.

pub mod adapters;
pub mod failover;
pub mod keys;
pub mod outbound;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Result<T> = std::result::Result<T, String>;

// ─── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Per-call options shared by every adapter.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Provider-native system prompt (set in addition to any leading
    /// role=system message so both adapter styles receive it).
    pub system: Option<String>,
}

/// Unified adapter response.
#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub content: String,
    pub model: String,
    pub usage: Value,
    pub provider: String,
}

// ─── Adapter interface ───────────────────────────────────────────────────────

#[async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Stable provider name (`openai`, `anthropic`, `ollama`, ...).
    fn name(&self) -> &str;

    /// Whether the adapter is usable right now (key present, etc.).
    fn is_available(&self) -> bool;

    async fn chat_complete(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome>;
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Immutable set of adapters assembled at boot.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ChatAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self { adapters: HashMap::new() }
    }

    pub fn register(&mut self, adapter: Arc<dyn ChatAdapter>) {
        self.adapters.insert(adapter.name().to_owned(), adapter);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ChatAdapter>> {
        self.adapters.get(provider).cloned()
    }

    /// Names of adapters that currently report available, sorted.
    pub fn available_providers(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .adapters
            .values()
            .filter(|a| a.is_available())
            .map(|a| a.name().to_owned())
            .collect();
        out.sort();
        out
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.adapters.keys().cloned().collect();
        out.sort();
        out
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubAdapter(&'static str, bool);

    #[async_trait]
    impl ChatAdapter for StubAdapter {
        fn name(&self) -> &str {
            self.0
        }
        fn is_available(&self) -> bool {
            self.1
        }
        async fn chat_complete(&self, _: &[ChatMessage], _: &ChatOptions) -> Result<ChatOutcome> {
            Err("stub".to_owned())
        }
    }

    #[test]
    fn registry_lookup_and_availability() {
        let mut reg = AdapterRegistry::new();
        reg.register(Arc::new(StubAdapter("openai", true)));
        reg.register(Arc::new(StubAdapter("ollama", false)));

        assert!(reg.get("openai").is_some());
        assert!(reg.get("missing").is_none());
        assert_eq!(reg.available_providers(), vec!["openai"]);
        assert_eq!(reg.provider_names(), vec!["ollama", "openai"]);
    }
}
