//! Concrete vendor adapters.
//!
//! Key resolution order: the provider key store, then the env aliases
//! listed per adapter.  Every request URL passes the outbound allow-list
//! before the client sends anything.
//!
//! Error strings deliberately embed the HTTP status (`HTTP 429`, `HTTP
//! 503`, ...) so the failover router can classify them as retriable.

use std::{env, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{
    ChatAdapter, ChatMessage, ChatOptions, ChatOutcome, Result, Role,
    keys::ProviderKeyStore,
    outbound::OutboundPolicy,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

fn resolve_key(
    keys: &ProviderKeyStore,
    provider: &str,
    env_aliases: &[&str],
) -> Option<String> {
    if let Some(key) = keys.get_key(provider) {
        return Some(key);
    }
    env_aliases.iter().find_map(|alias| {
        env::var(alias).ok().map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
    })
}

// ─── OpenAI-compatible ───────────────────────────────────────────────────────

/// Chat Completions adapter for OpenAI and OpenAI-compatible vendors
/// (OpenRouter uses the same wire shape on a different origin).
pub struct OpenAiCompatibleAdapter {
    name: String,
    base_url: String,
    env_aliases: Vec<&'static str>,
    default_model: String,
    keys: Arc<ProviderKeyStore>,
    outbound: Arc<OutboundPolicy>,
    client: reqwest::Client,
}

impl OpenAiCompatibleAdapter {
    pub fn openai(keys: Arc<ProviderKeyStore>, outbound: Arc<OutboundPolicy>) -> Self {
        Self {
            name: "openai".to_owned(),
            base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_owned()),
            env_aliases: vec!["PALISADE_OPENAI_KEY", "OPENAI_API_KEY"],
            default_model: "gpt-4o-mini".to_owned(),
            keys,
            outbound,
            client: reqwest::Client::new(),
        }
    }

    pub fn openrouter(keys: Arc<ProviderKeyStore>, outbound: Arc<OutboundPolicy>) -> Self {
        Self {
            name: "openrouter".to_owned(),
            base_url: "https://openrouter.ai/api/v1".to_owned(),
            env_aliases: vec!["PALISADE_OPENROUTER_KEY", "OPENROUTER_API_KEY"],
            default_model: "openai/gpt-4o-mini".to_owned(),
            keys,
            outbound,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChatAdapter for OpenAiCompatibleAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        resolve_key(&self.keys, &self.name, &self.env_aliases).is_some()
    }

    async fn chat_complete(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome> {
        let key = resolve_key(&self.keys, &self.name, &self.env_aliases)
            .ok_or_else(|| format!("{}: no API key configured", self.name))?;
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        self.outbound.check(&url)?;

        let model = opts.model.clone().unwrap_or_else(|| self.default_model.clone());
        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
        });
        let resp = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&key)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("{}: connection error: {e}", self.name))?;
        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| format!("{}: bad response body: {e}", self.name))?;
        if !status.is_success() {
            return Err(format!(
                "{}: HTTP {}: {}",
                self.name,
                status.as_u16(),
                payload["error"]["message"].as_str().unwrap_or("request failed"),
            ));
        }
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_owned();
        Ok(ChatOutcome {
            content,
            model: payload["model"].as_str().unwrap_or(&model).to_owned(),
            usage: payload.get("usage").cloned().unwrap_or_else(|| json!({})),
            provider: self.name.clone(),
        })
    }
}

// ─── Anthropic ───────────────────────────────────────────────────────────────

pub struct AnthropicAdapter {
    base_url: String,
    keys: Arc<ProviderKeyStore>,
    outbound: Arc<OutboundPolicy>,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    const ENV_ALIASES: &'static [&'static str] =
        &["PALISADE_ANTHROPIC_KEY", "ANTHROPIC_API_KEY"];
    const DEFAULT_MODEL: &'static str = "claude-3-5-haiku-20241022";

    pub fn new(keys: Arc<ProviderKeyStore>, outbound: Arc<OutboundPolicy>) -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_owned(),
            keys,
            outbound,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChatAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn is_available(&self) -> bool {
        resolve_key(&self.keys, "anthropic", Self::ENV_ALIASES).is_some()
    }

    async fn chat_complete(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome> {
        let key = resolve_key(&self.keys, "anthropic", Self::ENV_ALIASES)
            .ok_or_else(|| "anthropic: no API key configured".to_owned())?;
        let url = format!("{}/v1/messages", self.base_url);
        self.outbound.check(&url)?;

        // The Messages API takes the system prompt as a top-level field;
        // leading system messages are folded into it.
        let mut system = opts.system.clone().unwrap_or_default();
        let turns: Vec<Value> = messages
            .iter()
            .filter(|m| {
                if m.role == Role::System {
                    if system.is_empty() {
                        system = m.content.clone();
                    }
                    false
                } else {
                    true
                }
            })
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect();

        let model = opts
            .model
            .clone()
            .unwrap_or_else(|| Self::DEFAULT_MODEL.to_owned());
        let mut body = json!({
            "model": model,
            "max_tokens": opts.max_tokens,
            "temperature": opts.temperature,
            "messages": turns,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }

        let resp = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .header("x-api-key", &key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("anthropic: connection error: {e}"))?;
        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| format!("anthropic: bad response body: {e}"))?;
        if !status.is_success() {
            return Err(format!(
                "anthropic: HTTP {}: {}",
                status.as_u16(),
                payload["error"]["message"].as_str().unwrap_or("request failed"),
            ));
        }
        let content = payload["content"][0]["text"].as_str().unwrap_or_default().to_owned();
        Ok(ChatOutcome {
            content,
            model: payload["model"].as_str().unwrap_or(&model).to_owned(),
            usage: payload.get("usage").cloned().unwrap_or_else(|| json!({})),
            provider: "anthropic".to_owned(),
        })
    }
}

// ─── Ollama ──────────────────────────────────────────────────────────────────

/// Local Ollama REST adapter.  No key required.
pub struct OllamaAdapter {
    base_url: String,
    outbound: Arc<OutboundPolicy>,
    client: reqwest::Client,
}

impl OllamaAdapter {
    const DEFAULT_MODEL: &'static str = "llama3";

    pub fn new(outbound: Arc<OutboundPolicy>) -> Self {
        Self {
            base_url: env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_owned()),
            outbound,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChatAdapter for OllamaAdapter {
    fn name(&self) -> &str {
        "ollama"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn chat_complete(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        self.outbound.check(&url)?;

        let model = opts
            .model
            .clone()
            .unwrap_or_else(|| Self::DEFAULT_MODEL.to_owned());
        let body = json!({
            "model": model,
            "messages": messages,
            "stream": false,
            "options": { "temperature": opts.temperature, "num_predict": opts.max_tokens },
        });
        let resp = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("ollama: connection error: {e}"))?;
        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| format!("ollama: bad response body: {e}"))?;
        if !status.is_success() {
            return Err(format!("ollama: HTTP {}", status.as_u16()));
        }
        Ok(ChatOutcome {
            content: payload["message"]["content"].as_str().unwrap_or_default().to_owned(),
            model,
            usage: json!({}),
            provider: "ollama".to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn key_store_takes_precedence_over_env() {
        let dir = TempDir::new().unwrap();
        let keys = ProviderKeyStore::new(dir.path().join("keys.json"));
        keys.set_key("openai", "sk-from-store", None);
        let resolved = resolve_key(&keys, "openai", &["PALISADE_TEST_UNSET_ALIAS"]);
        assert_eq!(resolved.as_deref(), Some("sk-from-store"));
    }

    #[test]
    fn missing_key_makes_adapter_unavailable() {
        let dir = TempDir::new().unwrap();
        let keys = Arc::new(ProviderKeyStore::new(dir.path().join("keys.json")));
        let outbound = Arc::new(OutboundPolicy::new(None));
        let mut adapter = OpenAiCompatibleAdapter::openai(keys.clone(), outbound.clone());
        adapter.env_aliases = vec!["PALISADE_DEFINITELY_UNSET"];
        assert!(!adapter.is_available());

        keys.set_key("openai", "sk-x", None);
        assert!(adapter.is_available());
    }

    #[tokio::test]
    async fn blocked_origin_fails_before_network_io() {
        let dir = TempDir::new().unwrap();
        let keys = Arc::new(ProviderKeyStore::new(dir.path().join("keys.json")));
        keys.set_key("openai", "sk-x", None);
        let outbound = Arc::new(OutboundPolicy::new(Some(vec![
            "https://only-this.example".to_owned(),
        ])));
        let adapter = OpenAiCompatibleAdapter::openai(keys, outbound);
        let err = adapter
            .chat_complete(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap_err();
        assert!(err.contains("blocked"), "unexpected error: {err}");
    }

    #[test]
    fn ollama_is_always_available() {
        let outbound = Arc::new(OutboundPolicy::new(None));
        assert!(OllamaAdapter::new(outbound).is_available());
    }
}
