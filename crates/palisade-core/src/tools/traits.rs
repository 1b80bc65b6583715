//! The tool interface.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Declared type of one tool argument.  Integers are coerced from strings
/// by the loop before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    #[default]
    String,
    Integer,
    Boolean,
    Object,
}

/// Schema of one argument as advertised to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgSpec {
    #[serde(rename = "type")]
    pub kind: ArgKind,
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl ArgSpec {
    pub fn required(kind: ArgKind, description: &str) -> Self {
        Self { kind, required: true, description: description.to_owned() }
    }

    pub fn optional(kind: ArgKind, description: &str) -> Self {
        Self { kind, required: false, description: description.to_owned() }
    }
}

/// A capability the loop can invoke.
///
/// Implementations must be `Send + Sync`; they are held in a shared
/// `Arc<dyn Tool>` registry.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable machine identifier (snake_case), e.g. `"web_search"`.
    fn name(&self) -> &str;

    /// Human-readable description used in the tool-protocol prompt block.
    fn description(&self) -> &str;

    /// Ordered argument schema (ordering keeps the prompt stable).
    fn args(&self) -> BTreeMap<String, ArgSpec>;

    /// Execute with validated/coerced arguments.  The returned value is
    /// formatted by the loop: arrays are itemised, objects are
    /// pretty-printed, scalars are stringified.
    async fn execute(&self, args: Map<String, Value>) -> Result<Value, String>;
}

/// Summary of a registered tool for listings.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub args: BTreeMap<String, ArgSpec>,
}
