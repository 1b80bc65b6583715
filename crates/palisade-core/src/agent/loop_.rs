//! The chat/tool execution loop.
//!
//! ```text
//! router.chat_with_failover()
//!       │
//!       ▼
//! extract TOOL_CALL objects ──► none? ──► return final result
//!       │
//!       ▼ calls present
//! append raw assistant turn
//! for each call (in parse order):
//!   approval-gated tool? ──► register with the gate, emit event, wait
//!   execute ──► TOOL_RESULT [<name>] block
//! append one user message with all blocks
//! round += 1; loop (bounded)
//! ```
//!
//! Execution failures are stringified into the `TOOL_RESULT` body and fed
//! back to the model; they never abort the loop.  The loop context is an
//! explicit value (session id, sub-agent depth, event channel) threaded
//! through calls.

use std::{future::Future, pin::Pin, sync::Arc};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::{
    providers::{ChatMessage, ChatOptions, failover::{FailoverOutcome, FailoverRouter}},
    tools::{ArgKind, ToolRegistry},
};

use super::{
    gate::ApprovalGate,
    tool_parser::{extract_tool_calls, strip_tool_call_lines},
};

/// Default tool-call rounds per request.
pub const MAX_ROUNDS: usize = 5;

/// Hard ceiling for the per-call round override.
const MAX_ROUNDS_CAP: usize = 10;

/// Tools that always require a live approval before execution.
pub const APPROVAL_TOOLS: &[&str] =
    &["shell_exec", "file_write", "file_patch", "file_delete", "js_eval"];

/// Built-in recursive delegation tool handled by the engine itself.
pub const SPAWN_AGENT: &str = "spawn_agent";

/// Maximum sub-agent nesting depth.
const MAX_SUBAGENT_DEPTH: u8 = 2;

/// Display truncation for streamed tool results.
const RESULT_PREVIEW_CHARS: usize = 400;

// ─── Events ──────────────────────────────────────────────────────────────────

/// Structured events pushed to the stream while the loop runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    ToolCall {
        tool: String,
        args: Map<String, Value>,
    },
    ToolResult {
        tool: String,
        result: String,
    },
    ApprovalRequired {
        id: String,
        tool: String,
        args: Map<String, Value>,
        session_id: String,
        expires_in: u64,
    },
    SkillCreated {
        slug: String,
        name: String,
    },
}

/// Explicit per-run context (replaces ambient thread-local state).
#[derive(Clone)]
pub struct LoopContext {
    pub session_id: String,
    pub depth: u8,
    pub events: Option<mpsc::Sender<LoopEvent>>,
}

impl LoopContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into(), depth: 0, events: None }
    }

    pub fn with_events(mut self, tx: mpsc::Sender<LoopEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    async fn emit(&self, event: LoopEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct ToolLoopEngine {
    registry: Arc<ToolRegistry>,
    pub gate: Arc<ApprovalGate>,
}

impl ToolLoopEngine {
    pub fn new(registry: Arc<ToolRegistry>, gate: Arc<ApprovalGate>) -> Self {
        Self { registry, gate }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run the LLM + tool-execution loop until the response contains no
    /// tool call or the round budget is spent.
    ///
    /// `max_rounds == 0` uses [`MAX_ROUNDS`]; overrides are capped at 10.
    pub async fn run(
        &self,
        router: &FailoverRouter,
        primary: &str,
        primary_model: Option<&str>,
        messages: Vec<ChatMessage>,
        opts: ChatOptions,
        max_rounds: usize,
        ctx: LoopContext,
    ) -> Result<FailoverOutcome, String> {
        let rounds = if max_rounds == 0 {
            MAX_ROUNDS
        } else {
            max_rounds.clamp(1, MAX_ROUNDS_CAP)
        };

        let mut msgs = messages;
        let mut last: Option<FailoverOutcome> = None;

        for _round in 0..rounds {
            let mut result = router
                .chat_with_failover(primary, primary_model, &msgs, &opts)
                .await?;
            let content = result.outcome.content.clone();
            let calls = extract_tool_calls(&content);

            if calls.is_empty() {
                return Ok(result);
            }

            // Narration only in the surfaced content; the raw turn (with
            // its TOOL_CALL lines) goes back into the history.
            result.outcome.content = strip_tool_call_lines(&content);
            msgs.push(ChatMessage::assistant(content));

            let mut blocks = Vec::with_capacity(calls.len());
            for call in calls {
                ctx.emit(LoopEvent::ToolCall {
                    tool: call.name.clone(),
                    args: call.args.clone(),
                })
                .await;
                let result_text = self
                    .execute_tool(router, primary, &call.name, call.args, &ctx)
                    .await;
                ctx.emit(LoopEvent::ToolResult {
                    tool: call.name.clone(),
                    result: truncate_chars(&result_text, RESULT_PREVIEW_CHARS),
                })
                .await;
                blocks.push(format!("TOOL_RESULT [{}]:\n{}", call.name, result_text));
            }
            msgs.push(ChatMessage::user(blocks.join("\n\n")));
            last = Some(result);
        }

        // Round limit hit; surface whatever we have.
        last.ok_or_else(|| "tool loop produced no result".to_owned())
    }

    /// Execute one tool call, returning the plain-text result string that
    /// feeds back to the model.  Never errors: failures are messages.
    async fn execute_tool(
        &self,
        router: &FailoverRouter,
        primary: &str,
        name: &str,
        args: Map<String, Value>,
        ctx: &LoopContext,
    ) -> String {
        if name == SPAWN_AGENT {
            return self.spawn_agent(router, primary, args, ctx).await;
        }

        let Some(tool) = self.registry.get(name) else {
            return format!(
                "[ERROR] Unknown tool: {name:?}. Available: {:?}",
                self.registry.names()
            );
        };

        // Validate presence of required args and coerce integers.
        let mut fn_args = Map::new();
        for (arg_name, spec) in tool.args() {
            match args.get(&arg_name) {
                Some(value) => {
                    let value = if spec.kind == ArgKind::Integer && !value.is_i64() {
                        coerce_integer(value).unwrap_or_else(|| value.clone())
                    } else {
                        value.clone()
                    };
                    fn_args.insert(arg_name, value);
                }
                None if spec.required => {
                    return format!("[ERROR] Missing required arg {arg_name:?} for tool {name:?}");
                }
                None => {}
            }
        }

        if APPROVAL_TOOLS.contains(&name) {
            let gate_id = self.gate.register(name, fn_args.clone(), &ctx.session_id);
            ctx.emit(LoopEvent::ApprovalRequired {
                id: gate_id.clone(),
                tool: name.to_owned(),
                args: fn_args.clone(),
                session_id: ctx.session_id.clone(),
                expires_in: self.gate.timeout_secs(),
            })
            .await;
            if !self.gate.wait_for_decision(&gate_id).await {
                return format!(
                    "[DENIED] The action {name:?} was not approved by the user \
                     (approval id={gate_id}). No changes were made."
                );
            }
        }

        match tool.execute(fn_args).await {
            Ok(value) => format_tool_result(&value),
            Err(err) => format!("[ERROR] Tool {name:?} failed:\n{err}"),
        }
    }

    /// Handle the built-in `spawn_agent` tool: run an isolated sub-loop
    /// with its own history and a tool list that omits `spawn_agent`.
    async fn spawn_agent(
        &self,
        router: &FailoverRouter,
        primary: &str,
        args: Map<String, Value>,
        ctx: &LoopContext,
    ) -> String {
        if ctx.depth >= MAX_SUBAGENT_DEPTH {
            return format!(
                "[ERROR] Maximum sub-agent nesting depth ({MAX_SUBAGENT_DEPTH}) reached. \
                 Cannot spawn further sub-agents."
            );
        }
        let Some(task) = args.get("task").and_then(Value::as_str) else {
            return "[ERROR] Missing required arg \"task\" for tool \"spawn_agent\"".to_owned();
        };
        let context = args.get("context").and_then(Value::as_str).unwrap_or_default();
        let provider = args
            .get("provider")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .unwrap_or(primary)
            .to_owned();
        let model = args
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(str::to_owned);
        let max_rounds = args
            .get("max_rounds")
            .and_then(Value::as_i64)
            .unwrap_or(3)
            .clamp(1, 5) as usize;

        let mut msgs = Vec::new();
        if !context.is_empty() {
            msgs.push(ChatMessage::user(format!("Context:\n{context}")));
            msgs.push(ChatMessage::assistant("Understood. Ready to work on your task."));
        }
        msgs.push(ChatMessage::user(task));

        let system = self.build_tool_system_block(false);
        let opts = ChatOptions {
            model: model.clone(),
            temperature: 0.7,
            max_tokens: 2048,
            system: Some(system),
        };
        let sub_ctx = LoopContext {
            session_id: ctx.session_id.clone(),
            depth: ctx.depth + 1,
            events: None,
        };
        match self
            .run_boxed(router, &provider, model.as_deref(), msgs, opts, max_rounds, sub_ctx)
            .await
        {
            Ok(result) => {
                let content = result.outcome.content.trim().to_owned();
                let content = if content.is_empty() {
                    "(sub-agent returned no content)".to_owned()
                } else {
                    content
                };
                format!("[Sub-agent result - provider={provider}]\n{content}")
            }
            Err(err) => format!("[ERROR] spawn_agent failed: {err}"),
        }
    }

    /// Boxed indirection so the run → spawn_agent → run cycle has a
    /// finite future size.
    #[allow(clippy::too_many_arguments)]
    fn run_boxed<'a>(
        &'a self,
        router: &'a FailoverRouter,
        primary: &'a str,
        primary_model: Option<&'a str>,
        messages: Vec<ChatMessage>,
        opts: ChatOptions,
        max_rounds: usize,
        ctx: LoopContext,
    ) -> Pin<Box<dyn Future<Output = Result<FailoverOutcome, String>> + Send + 'a>> {
        Box::pin(self.run(router, primary, primary_model, messages, opts, max_rounds, ctx))
    }

    /// The tool-use protocol block appended to the system prompt when
    /// `use_tools` is set.
    pub fn build_tool_system_block(&self, include_spawn_agent: bool) -> String {
        let mut tools_block = String::new();
        for info in self.registry.list() {
            tools_block.push_str(&format!("- {}: {}\n", info.name, info.description));
            for (arg, spec) in &info.args {
                tools_block.push_str(&format!(
                    "    {} ({:?}, {}): {}\n",
                    arg,
                    spec.kind,
                    if spec.required { "required" } else { "optional" },
                    spec.description,
                ));
            }
        }
        if include_spawn_agent {
            tools_block.push_str(concat!(
                "- spawn_agent: Spawn a sub-agent to handle a clearly-scoped sub-task ",
                "autonomously and return its final answer.\n",
                "    task (String, required): Full description of the task\n",
                "    context (String, optional): Background context for the sub-agent\n",
                "    provider (String, optional): LLM provider name\n",
                "    model (String, optional): Model name override\n",
                "    max_rounds (Integer, optional): Tool-call rounds for the sub-agent (1-5)\n",
            ));
        }

        format!(
            "## Tool use\n\n\
             You can call tools. To invoke one, reply with a single line of the form:\n\n\
             TOOL_CALL: {{\"name\": \"<tool_name>\", \"args\": {{\"<arg>\": <value>}}}}\n\n\
             Rules:\n\
             - One TOOL_CALL per line; you may emit several lines.\n\
             - After calling, stop and wait. Each result arrives as a \
             TOOL_RESULT [<tool_name>] block in the next user message.\n\
             - When you have the final answer, reply normally without any TOOL_CALL line.\n\n\
             ### Tools\n\n{tools_block}"
        )
    }
}

// ─── Result formatting ───────────────────────────────────────────────────────

/// Render a tool's JSON result as readable text for the model.
fn format_tool_result(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return "(no results)".to_owned();
            }
            let mut parts = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let n = i + 1;
                match item.as_object() {
                    Some(obj) if obj.contains_key("error") && !obj.contains_key("title") => {
                        parts.push(format!(
                            "{n}. ERROR: {}",
                            obj["error"].as_str().unwrap_or_default()
                        ));
                    }
                    Some(obj) => {
                        let title = obj.get("title").and_then(Value::as_str).unwrap_or_default();
                        let mut line = format!("{n}. **{title}**");
                        if let Some(url) = obj.get("url").and_then(Value::as_str) {
                            line.push_str(&format!("\n   URL: {url}"));
                        }
                        if let Some(snippet) = obj.get("snippet").and_then(Value::as_str) {
                            line.push_str(&format!("\n   {snippet}"));
                        }
                        parts.push(line);
                    }
                    None => parts.push(format!("{n}. {}", scalar_text(item))),
                }
            }
            parts.join("\n")
        }
        Value::Object(_) => serde_json::to_string_pretty(value).unwrap_or_default(),
        other => scalar_text(other),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn coerce_integer(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
        Value::Number(n) => n.as_f64().map(|f| Value::from(f as i64)),
        _ => None,
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_owned()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{AdapterRegistry, ChatAdapter, ChatOutcome, Result as ProviderResult, Role};
    use crate::tools::registry::EchoTool;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Adapter that replays a scripted sequence of responses and records
    /// the message history it was called with.
    struct ScriptedAdapter {
        responses: Mutex<VecDeque<String>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedAdapter {
        fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.iter().map(|s| (*s).to_owned()).collect()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            "scripted"
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn chat_complete(
            &self,
            messages: &[ChatMessage],
            _opts: &ChatOptions,
        ) -> ProviderResult<ChatOutcome> {
            self.seen.lock().push(messages.to_vec());
            let content = self
                .responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| "(script exhausted)".to_owned());
            Ok(ChatOutcome {
                content,
                model: "scripted-model".to_owned(),
                usage: json!({}),
                provider: "scripted".to_owned(),
            })
        }
    }

    fn harness(adapter: Arc<ScriptedAdapter>) -> (ToolLoopEngine, FailoverRouter) {
        let mut providers = AdapterRegistry::new();
        providers.register(adapter);
        let router = FailoverRouter::new(Arc::new(providers));
        router.set_chain(vec![]);

        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(EchoTool));
        let engine = ToolLoopEngine::new(tools, Arc::new(ApprovalGate::new()));
        (engine, router)
    }

    fn user(text: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::user(text)]
    }

    #[tokio::test]
    async fn plain_response_passes_through() {
        let adapter = ScriptedAdapter::new(&["The answer is 42."]);
        let (engine, router) = harness(adapter);
        let out = engine
            .run(&router, "scripted", None, user("q"), ChatOptions::default(), 0, LoopContext::new("s"))
            .await
            .unwrap();
        assert_eq!(out.outcome.content, "The answer is 42.");
    }

    #[tokio::test]
    async fn tool_call_executes_and_result_feeds_back() {
        let adapter = ScriptedAdapter::new(&[
            "Let me echo.\nTOOL_CALL: {\"name\": \"echo\", \"args\": {\"text\": \"ping\"}}",
            "Echo said ping.",
        ]);
        let (engine, router) = harness(adapter.clone());
        let out = engine
            .run(&router, "scripted", None, user("go"), ChatOptions::default(), 0, LoopContext::new("s"))
            .await
            .unwrap();
        assert_eq!(out.outcome.content, "Echo said ping.");

        let histories = adapter.seen.lock();
        // Second call saw: user, raw assistant turn, TOOL_RESULT user message.
        let second = &histories[1];
        assert_eq!(second.len(), 3);
        assert_eq!(second[1].role, Role::Assistant);
        assert!(second[1].content.contains("TOOL_CALL"));
        assert_eq!(second[2].role, Role::User);
        assert!(second[2].content.starts_with("TOOL_RESULT [echo]:\nping"));
    }

    #[tokio::test]
    async fn multiple_calls_yield_one_user_message_in_order() {
        let adapter = ScriptedAdapter::new(&[
            "TOOL_CALL: {\"name\": \"echo\", \"args\": {\"text\": \"one\"}}\n\
             TOOL_CALL: {\"name\": \"echo\", \"args\": {\"text\": \"two\"}}",
            "done",
        ]);
        let (engine, router) = harness(adapter.clone());
        engine
            .run(&router, "scripted", None, user("go"), ChatOptions::default(), 0, LoopContext::new("s"))
            .await
            .unwrap();
        let histories = adapter.seen.lock();
        let results = &histories[1][2].content;
        let one = results.find("TOOL_RESULT [echo]:\none").expect("first result");
        let two = results.find("TOOL_RESULT [echo]:\ntwo").expect("second result");
        assert!(one < two);
    }

    #[tokio::test]
    async fn unknown_tool_reports_error_and_continues() {
        let adapter = ScriptedAdapter::new(&[
            "TOOL_CALL: {\"name\": \"nope\", \"args\": {}}",
            "recovered",
        ]);
        let (engine, router) = harness(adapter.clone());
        let out = engine
            .run(&router, "scripted", None, user("go"), ChatOptions::default(), 0, LoopContext::new("s"))
            .await
            .unwrap();
        assert_eq!(out.outcome.content, "recovered");
        let histories = adapter.seen.lock();
        assert!(histories[1][2].content.contains("[ERROR] Unknown tool"));
    }

    #[tokio::test]
    async fn missing_required_arg_is_an_error_result() {
        let adapter = ScriptedAdapter::new(&[
            "TOOL_CALL: {\"name\": \"echo\", \"args\": {}}",
            "ok",
        ]);
        let (engine, router) = harness(adapter.clone());
        engine
            .run(&router, "scripted", None, user("go"), ChatOptions::default(), 0, LoopContext::new("s"))
            .await
            .unwrap();
        let histories = adapter.seen.lock();
        assert!(histories[1][2].content.contains("Missing required arg"));
    }

    #[tokio::test]
    async fn round_limit_returns_last_result_with_stripped_content() {
        // Every response asks for another tool call; the loop must stop.
        let call = "narration\nTOOL_CALL: {\"name\": \"echo\", \"args\": {\"text\": \"x\"}}";
        let adapter = ScriptedAdapter::new(&[call, call, call]);
        let (engine, router) = harness(adapter.clone());
        let out = engine
            .run(&router, "scripted", None, user("go"), ChatOptions::default(), 3, LoopContext::new("s"))
            .await
            .unwrap();
        assert_eq!(adapter.seen.lock().len(), 3, "round override respected");
        assert_eq!(out.outcome.content, "narration");
    }

    #[tokio::test]
    async fn gated_tool_waits_for_approval() {
        let adapter = ScriptedAdapter::new(&[
            "TOOL_CALL: {\"name\": \"shell_exec\", \"args\": {\"cmd\": \"ls\"}}",
            "after approval",
        ]);
        let (engine, router) = harness(adapter.clone());
        // shell_exec must exist in the registry for execution after the gate.
        struct ShellStub;
        #[async_trait]
        impl crate::tools::Tool for ShellStub {
            fn name(&self) -> &str {
                "shell_exec"
            }
            fn description(&self) -> &str {
                "run a command"
            }
            fn args(&self) -> std::collections::BTreeMap<String, crate::tools::ArgSpec> {
                std::collections::BTreeMap::from([(
                    "cmd".to_owned(),
                    crate::tools::ArgSpec::required(ArgKind::String, "command"),
                )])
            }
            async fn execute(&self, _args: Map<String, Value>) -> Result<Value, String> {
                Ok(json!("file-a file-b"))
            }
        }
        engine.registry().register(Arc::new(ShellStub));

        let (tx, mut rx) = mpsc::channel(16);
        let gate = Arc::clone(&engine.gate);
        let approver = tokio::spawn(async move {
            let mut approved = false;
            while let Some(event) = rx.recv().await {
                if let LoopEvent::ApprovalRequired { id, tool, .. } = event {
                    assert_eq!(tool, "shell_exec");
                    assert!(gate.approve(&id));
                    approved = true;
                    break;
                }
            }
            approved
        });

        let ctx = LoopContext::new("sess-9").with_events(tx);
        let out = engine
            .run(&router, "scripted", None, user("go"), ChatOptions::default(), 0, ctx)
            .await
            .unwrap();
        assert!(approver.await.unwrap());
        assert_eq!(out.outcome.content, "after approval");
        let histories = adapter.seen.lock();
        assert!(histories[1][2].content.contains("file-a file-b"));
    }

    #[tokio::test]
    async fn denied_tool_yields_denied_result_and_loop_continues() {
        let adapter = ScriptedAdapter::new(&[
            "TOOL_CALL: {\"name\": \"file_delete\", \"args\": {}}",
            "understood, skipping",
        ]);
        let (engine, router) = harness(adapter.clone());
        struct DeleteStub;
        #[async_trait]
        impl crate::tools::Tool for DeleteStub {
            fn name(&self) -> &str {
                "file_delete"
            }
            fn description(&self) -> &str {
                "delete a file"
            }
            fn args(&self) -> std::collections::BTreeMap<String, crate::tools::ArgSpec> {
                std::collections::BTreeMap::new()
            }
            async fn execute(&self, _args: Map<String, Value>) -> Result<Value, String> {
                Ok(json!("deleted"))
            }
        }
        engine.registry().register(Arc::new(DeleteStub));

        let (tx, mut rx) = mpsc::channel(16);
        let gate = Arc::clone(&engine.gate);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let LoopEvent::ApprovalRequired { id, .. } = event {
                    gate.deny(&id);
                    break;
                }
            }
        });

        let ctx = LoopContext::new("s").with_events(tx);
        let out = engine
            .run(&router, "scripted", None, user("go"), ChatOptions::default(), 0, ctx)
            .await
            .unwrap();
        assert_eq!(out.outcome.content, "understood, skipping");
        let histories = adapter.seen.lock();
        assert!(histories[1][2].content.contains("[DENIED]"));
        assert!(histories[1][2].content.contains("No changes were made"));
    }

    #[tokio::test]
    async fn spawn_agent_depth_cap_blocks_runaway_recursion() {
        let adapter = ScriptedAdapter::new(&[
            "TOOL_CALL: {\"name\": \"spawn_agent\", \"args\": {\"task\": \"sub\"}}",
            "parent done",
        ]);
        let (engine, router) = harness(adapter.clone());
        let ctx = LoopContext { session_id: "s".to_owned(), depth: 2, events: None };
        engine
            .run(&router, "scripted", None, user("go"), ChatOptions::default(), 0, ctx)
            .await
            .unwrap();
        let histories = adapter.seen.lock();
        assert!(histories[1][2].content.contains("Maximum sub-agent nesting depth"));
    }

    #[tokio::test]
    async fn spawn_agent_runs_sub_loop_and_reports_result() {
        let adapter = ScriptedAdapter::new(&[
            // Parent round 1: delegate.
            "TOOL_CALL: {\"name\": \"spawn_agent\", \"args\": {\"task\": \"compute\", \"context\": \"bg\"}}",
            // Sub-agent round 1: final answer.
            "sub answer",
            // Parent round 2: wrap up.
            "parent done",
        ]);
        let (engine, router) = harness(adapter.clone());
        let out = engine
            .run(&router, "scripted", None, user("go"), ChatOptions::default(), 0, LoopContext::new("s"))
            .await
            .unwrap();
        assert_eq!(out.outcome.content, "parent done");

        let histories = adapter.seen.lock();
        // Sub-agent history: context turn, ack, task.
        let sub = &histories[1];
        assert_eq!(sub.len(), 3);
        assert!(sub[0].content.starts_with("Context:"));
        assert_eq!(sub[2].content, "compute");
        // Parent sees the sub-agent result block.
        assert!(histories[2][2].content.contains("[Sub-agent result - provider=scripted]"));
        assert!(histories[2][2].content.contains("sub answer"));
    }

    #[tokio::test]
    async fn events_stream_in_order() {
        let adapter = ScriptedAdapter::new(&[
            "TOOL_CALL: {\"name\": \"echo\", \"args\": {\"text\": \"hello\"}}",
            "done",
        ]);
        let (engine, router) = harness(adapter);
        let (tx, mut rx) = mpsc::channel(16);
        let ctx = LoopContext::new("s").with_events(tx);
        engine
            .run(&router, "scripted", None, user("go"), ChatOptions::default(), 0, ctx)
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, LoopEvent::ToolCall { ref tool, .. } if tool == "echo"));
        let second = rx.recv().await.unwrap();
        match second {
            LoopEvent::ToolResult { tool, result } => {
                assert_eq!(tool, "echo");
                assert_eq!(result, "hello");
            }
            other => panic!("expected tool_result, got {other:?}"),
        }
    }

    #[test]
    fn result_formatting_shapes() {
        assert_eq!(format_tool_result(&json!([])), "(no results)");
        let list = json!([
            {"title": "Rust", "url": "https://rust-lang.org", "snippet": "systems language"},
            {"error": "boom"},
            "plain",
        ]);
        let text = format_tool_result(&list);
        assert!(text.contains("1. **Rust**"));
        assert!(text.contains("URL: https://rust-lang.org"));
        assert!(text.contains("2. ERROR: boom"));
        assert!(text.contains("3. plain"));

        let obj = format_tool_result(&json!({"k": 1}));
        assert!(obj.contains("\n"), "objects are pretty-printed");
        assert_eq!(format_tool_result(&json!("scalar")), "scalar");
        assert_eq!(format_tool_result(&json!(42)), "42");
    }

    #[test]
    fn integer_coercion() {
        assert_eq!(coerce_integer(&json!("7")), Some(json!(7)));
        assert_eq!(coerce_integer(&json!(3.9)), Some(json!(3)));
        assert_eq!(coerce_integer(&json!("x")), None);
    }

    #[test]
    fn truncation_appends_ellipsis() {
        let long = "a".repeat(500);
        let t = truncate_chars(&long, 400);
        assert_eq!(t.chars().count(), 401);
        assert!(t.ends_with('…'));
        assert_eq!(truncate_chars("short", 400), "short");
    }
}
