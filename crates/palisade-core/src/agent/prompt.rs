//! System-prompt assembly.
//!
//! The combined prompt is built from ordered blocks joined with a
//! horizontal-rule separator: persona, workspace, page context, caller
//! extra, relevant memories, and finally the tool-use protocol.  Persona,
//! workspace, and page providers are external collaborators; the engine
//! only consumes the rendered blocks.

/// Separator between prompt blocks.
const BLOCK_SEPARATOR: &str = "\n\n---\n\n";

/// Hook for the relevant-memory block: given the latest user message,
/// return labelled snippets from whatever memory backend the deployment
/// ships (vector store, notes bridge, nothing).
pub trait RelevantMemory: Send + Sync {
    fn context_for(&self, latest_user_message: &str) -> Option<String>;
}

/// Ordered prompt blocks.  Empty/absent blocks are skipped.
#[derive(Debug, Clone, Default)]
pub struct PromptParts {
    /// Persona soul text, framed first so it colours everything after.
    pub persona: Option<String>,
    /// Agent identity + workspace instructions.
    pub workspace: Option<String>,
    /// Last active-tab snapshot (HTML already truncated by the caller).
    pub page_context: Option<String>,
    /// Caller-supplied extra system text.
    pub extra: Option<String>,
    /// Relevant-memory block for the latest user message.
    pub memory: Option<String>,
    /// Tool-use protocol block (present when `use_tools` is set).
    pub tools_block: Option<String>,
}

impl PromptParts {
    /// Join non-empty blocks in order.  Returns `None` when every block
    /// is absent so callers can skip the system field entirely.
    pub fn assemble(&self) -> Option<String> {
        let parts: Vec<&str> = [
            self.persona.as_deref(),
            self.workspace.as_deref(),
            self.page_context.as_deref(),
            self.extra.as_deref(),
            self.memory.as_deref(),
            self.tools_block.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(BLOCK_SEPARATOR))
        }
    }
}

/// Truncate page HTML to the configured cap, at a char boundary.
pub fn truncate_page_html(html: &str, cap: usize) -> &str {
    if html.len() <= cap {
        return html;
    }
    let mut end = cap;
    while end > 0 && !html.is_char_boundary(end) {
        end -= 1;
    }
    &html[..end]
}
