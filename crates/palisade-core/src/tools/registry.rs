//! Central registry of available tools.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::traits::{ArgKind, ArgSpec, Tool, ToolInfo};

/// Thread-safe tool registry.  Plugins may register tools after startup,
/// so the map lives behind a lock.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: RwLock::new(HashMap::new()) }
    }

    /// Register a tool.  Overwrites any previous tool with the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.write().insert(tool.name().to_owned(), tool);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(name).cloned()
    }

    /// Sorted tool listing for the prompt block and admin endpoints.
    pub fn list(&self) -> Vec<ToolInfo> {
        let mut out: Vec<ToolInfo> = self
            .tools
            .read()
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_owned(),
                description: t.description().to_owned(),
                args: t.args(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.tools.read().keys().cloned().collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Built-in echo tool ──────────────────────────────────────────────────────

/// Minimal built-in used by smoke tests and as a wiring example.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back unchanged."
    }

    fn args(&self) -> BTreeMap<String, ArgSpec> {
        BTreeMap::from([(
            "text".to_owned(),
            ArgSpec::required(ArgKind::String, "Text to echo"),
        )])
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<Value, String> {
        Ok(args.get("text").cloned().unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct DummyTool(&'static str);

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "A test tool"
        }
        fn args(&self) -> BTreeMap<String, ArgSpec> {
            BTreeMap::new()
        }
        async fn execute(&self, _args: Map<String, Value>) -> Result<Value, String> {
            Ok(json!("done"))
        }
    }

    #[test]
    fn register_get_unregister() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("dummy")));
        assert!(reg.get("dummy").is_some());
        assert!(reg.get("nope").is_none());
        assert!(reg.unregister("dummy"));
        assert!(!reg.unregister("dummy"));
    }

    #[test]
    fn overwrite_same_name_keeps_one() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("dup")));
        reg.register(Arc::new(DummyTool("dup")));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn list_is_sorted() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("zeta")));
        reg.register(Arc::new(DummyTool("alpha")));
        let names: Vec<String> = reg.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn echo_tool_roundtrips() {
        let echo = EchoTool;
        let mut args = Map::new();
        args.insert("text".to_owned(), json!("hi"));
        assert_eq!(echo.execute(args).await.unwrap(), json!("hi"));
    }
}
