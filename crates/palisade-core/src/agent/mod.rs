//! Chat/tool execution engine: the `TOOL_CALL:` parser, the in-loop
//! approval gate, the ReAct-style loop, and system-prompt assembly.

pub mod gate;
pub mod loop_;
pub mod prompt;
pub mod tool_parser;

pub use gate::ApprovalGate;
pub use loop_::{APPROVAL_TOOLS, LoopContext, LoopEvent, MAX_ROUNDS, ToolLoopEngine};
pub use prompt::{PromptParts, RelevantMemory};
pub use tool_parser::{ParsedToolCall, extract_tool_calls, strip_tool_call_lines};
