//! Manifest-driven plugin loader.
//!
//! Plugins never load native code into the gateway.  A plugin is a JSON
//! manifest describing tools served by an external HTTP bridge (a sidecar
//! process, an MCP shim, anything that answers POSTs); the loader
//! registers one [`HttpBridgeTool`] per declared tool.  The bridge
//! boundary is the whole safety story: a misbehaving plugin can time out
//! or error, never crash the gateway.
//!
//! Manifest shape (one file per plugin under the plugins dir):
//!
//! ```json
//! {
//!   "name": "notes",
//!   "description": "Notes store bridge",
//!   "endpoint": "http://127.0.0.1:9301/invoke",
//!   "tools": [
//!     {"name": "notes_save", "description": "Save a note",
//!      "args": {"content": {"type": "string", "required": true}}}
//!   ]
//! }
//! ```

use std::{collections::BTreeMap, fs, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::tools::{ArgSpec, Tool, ToolRegistry};

const BRIDGE_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Manifest ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub endpoint: String,
    #[serde(default)]
    pub tools: Vec<PluginToolDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginToolDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub args: BTreeMap<String, ArgSpec>,
}

// ─── Bridge tool ─────────────────────────────────────────────────────────────

/// A tool whose execution is a POST to the plugin's bridge endpoint.
pub struct HttpBridgeTool {
    plugin: String,
    decl: PluginToolDecl,
    endpoint: String,
    client: reqwest::Client,
}

#[async_trait]
impl Tool for HttpBridgeTool {
    fn name(&self) -> &str {
        &self.decl.name
    }

    fn description(&self) -> &str {
        &self.decl.description
    }

    fn args(&self) -> BTreeMap<String, ArgSpec> {
        self.decl.args.clone()
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<Value, String> {
        let body = json!({ "tool": self.decl.name, "args": args });
        let resp = self
            .client
            .post(&self.endpoint)
            .timeout(BRIDGE_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("plugin {:?} bridge unreachable: {e}", self.plugin))?;
        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| format!("plugin {:?} returned a non-JSON body: {e}", self.plugin))?;
        if !status.is_success() {
            return Err(format!(
                "plugin {:?} bridge error HTTP {}: {}",
                self.plugin,
                status.as_u16(),
                payload["error"].as_str().unwrap_or("request failed"),
            ));
        }
        // Bridges may wrap the payload in {"result": ...} or answer bare.
        Ok(payload.get("result").cloned().unwrap_or(payload))
    }
}

// ─── Loader ──────────────────────────────────────────────────────────────────

pub struct PluginLoader {
    dir: PathBuf,
}

impl PluginLoader {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Parse every manifest under the plugins dir and register its tools.
    /// Returns the loaded manifests; broken files are skipped with a log
    /// line so one bad plugin cannot take the others down.
    pub fn load_all(&self, registry: &ToolRegistry) -> Vec<PluginManifest> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut loaded = Vec::new();
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|x| x == "json"))
            .collect();
        paths.sort();
        for path in paths {
            let manifest = match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str::<PluginManifest>(&raw).map_err(|e| e.to_string()))
            {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping broken plugin manifest");
                    continue;
                }
            };
            if !manifest.endpoint.starts_with("http://") && !manifest.endpoint.starts_with("https://")
            {
                tracing::warn!(plugin = %manifest.name, "plugin endpoint must be http(s); skipped");
                continue;
            }
            for decl in &manifest.tools {
                registry.register(Arc::new(HttpBridgeTool {
                    plugin: manifest.name.clone(),
                    decl: decl.clone(),
                    endpoint: manifest.endpoint.clone(),
                    client: reqwest::Client::new(),
                }));
            }
            tracing::info!(plugin = %manifest.name, tools = manifest.tools.len(), "plugin loaded");
            loaded.push(manifest);
        }
        loaded
    }
}
