//! Outbound origin allow-list for provider traffic.
//!
//! Every provider request is checked before any network I/O.  The list
//! comes from `PALISADE_PROVIDER_OUTBOUND_ALLOWLIST` (comma-separated
//! origins); when the variable is unset (or set to whitespace) the
//! built-in vendor origins plus the local Ollama endpoint are used.  The
//! two fallback cases are deliberately equivalent.

use std::env;

/// Built-in origins allowed when no override is configured.
fn builtin_allowlist() -> Vec<String> {
    let raw = [
        env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_owned()),
        "https://api.anthropic.com".to_owned(),
        "https://openrouter.ai".to_owned(),
        env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| "http://localhost:11434".to_owned()),
    ];
    let mut out = Vec::new();
    for url in raw {
        if let Some(origin) = extract_origin(&url) {
            if !out.contains(&origin) {
                out.push(origin);
            }
        }
    }
    out
}

/// `scheme://host[:port]` of a URL, or `None` for unparseable input.
pub fn extract_origin(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let origin = match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    };
    Some(origin)
}

pub struct OutboundPolicy {
    allowlist: Vec<String>,
}

impl OutboundPolicy {
    /// `override_list: None` (unset or whitespace env) uses the built-ins.
    pub fn new(override_list: Option<Vec<String>>) -> Self {
        let allowlist = match override_list {
            Some(entries) if !entries.is_empty() => entries
                .into_iter()
                .map(|e| e.trim().trim_end_matches('/').to_owned())
                .filter(|e| !e.is_empty())
                .collect(),
            _ => builtin_allowlist(),
        };
        Self { allowlist }
    }

    /// Err when `url`'s origin is not covered by the allow-list.
    pub fn check(&self, url: &str) -> Result<(), String> {
        let Some(origin) = extract_origin(url) else {
            return Err(format!("unparseable outbound URL {url:?}"));
        };
        let allowed = self
            .allowlist
            .iter()
            .any(|a| origin == *a || origin.starts_with(&format!("{a}/")));
        if allowed {
            Ok(())
        } else {
            Err(format!(
                "outbound request to {origin:?} is blocked by the provider allow-list \
                 (allowed: {:?})",
                self.allowlist
            ))
        }
    }

    pub fn allowlist(&self) -> &[String] {
        &self.allowlist
    }
}
