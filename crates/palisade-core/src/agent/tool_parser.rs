//! `TOOL_CALL:` protocol parser.
//!
//! The LLM emits lines of the form:
//!
//! ```text
//! TOOL_CALL: {"name": "web_search", "args": {"query": "rust async"}}
//! ```
//!
//! The JSON body is extracted by brace-counting from the anchor rather
//! than by regex capture, so nested objects (e.g. `{"args": {"code_js":
//! "..."}}`) are never truncated at the first closing brace.  The scanner
//! is aware of quoted strings and backslash escapes and gives up after
//! 16 KiB per call.

use std::sync::LazyLock;

use regex::RegexBuilder;
use serde_json::{Map, Value};

/// Maximum characters scanned per tool call.
const MAX_JSON_SCAN: usize = 16_384;

static ANCHOR: LazyLock<regex::Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"TOOL_CALL\s*:\s*\{")
        .case_insensitive(true)
        .build()
        .expect("static anchor pattern compiles")
});

static STRIP: LazyLock<regex::Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"(?m)^\s*TOOL_CALL\s*:.*$")
        .case_insensitive(true)
        .build()
        .expect("static strip pattern compiles")
});

/// A tool invocation extracted from LLM output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    pub args: Map<String, Value>,
}

/// Extract every `TOOL_CALL:` object from `text`, in order of appearance.
/// Objects that fail to parse, or that carry neither `name` nor `tool`,
/// are skipped.
pub fn extract_tool_calls(text: &str) -> Vec<ParsedToolCall> {
    let mut calls = Vec::new();
    for m in ANCHOR.find_iter(text) {
        // The match ends just past the opening brace; scan from the brace.
        let start = m.end() - 1;
        let mut window_end = text.len().min(start + MAX_JSON_SCAN);
        while !text.is_char_boundary(window_end) {
            window_end -= 1;
        }
        let raw = &text[start..window_end];
        let Some(fragment) = balanced_object(raw) else {
            continue;
        };
        let Ok(obj) = serde_json::from_str::<Value>(fragment) else {
            continue;
        };
        let Some(map) = obj.as_object() else { continue };
        let name = map
            .get("name")
            .or_else(|| map.get("tool"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        let Some(name) = name else { continue };
        let args = map
            .get("args")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        calls.push(ParsedToolCall { name, args });
    }
    calls
}

/// Remove `TOOL_CALL:` lines from the surfaced assistant content.
pub fn strip_tool_call_lines(text: &str) -> String {
    STRIP.replace_all(text, "").trim().to_owned()
}

/// The balanced `{...}` prefix of `raw`, honouring strings and escapes.
fn balanced_object(raw: &str) -> Option<&str> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    for (i, ch) in raw.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

// ─── Tests ───────────────────────────────────────────────────────────────────
