//! Deterministic risk scoring for tool-call payloads.
//!
//! The score is a pure function of the tool name and the argument map; it
//! never consults the manifest.  Routing (whether a call enters the
//! approval queue) is decided separately: a manifest's
//! `requires_approval` overrides whatever this module computes.

use std::sync::LazyLock;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Risk tier of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Tools that are always high-risk regardless of args.
const HIGH_RISK_TOOLS: &[&str] = &[
    "system.exec",
    "system.update",
    "system.kill",
    "file.write",
    "file.delete",
    "file.chmod",
    "network.request",
    "network.proxy",
];

/// Read-only but potentially sensitive tools.
const MEDIUM_RISK_TOOLS: &[&str] = &[
    "file.read",
    "file.list",
    "system.env",
    "clipboard.read",
    "browser.cookies",
];

/// Traversal / injection patterns in argument values.
static SENSITIVE_ARG_PATTERNS: LazyLock<regex::Regex> = LazyLock::new(|| {
    RegexBuilder::new(
        r"\.\.[\\/]|/etc/|/proc/|/sys/|cmd\.exe|powershell|eval\(|exec\(|drop\s+table|delete\s+from|format\s+c|rm\s+-rf",
    )
    .case_insensitive(true)
    .build()
    .expect("static risk pattern compiles")
});

/// Suspicious argument key names.
static RISKY_ARG_KEYS: LazyLock<regex::Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"command|cmd|exec|shell|script|query|sql|path|file|url")
        .case_insensitive(true)
        .build()
        .expect("static key pattern compiles")
});

/// Length above which a string argument contributes to the score.
const LARGE_STRING_THRESHOLD: usize = 512;

/// Integer risk contribution from the call's arguments.
///
/// Per (key, value) pair: +2 when the value matches an injection pattern,
/// +1 when the key name looks like a command/path/query parameter, +1 when
/// the value is a string longer than 512 chars.
fn score_args(args: &Map<String, Value>) -> u32 {
    let mut score = 0;
    for (key, val) in args {
        let val_str = match val {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if SENSITIVE_ARG_PATTERNS.is_match(&val_str) {
            score += 2;
        }
        if RISKY_ARG_KEYS.is_match(key) {
            score += 1;
        }
        if matches!(val, Value::String(s) if s.len() > LARGE_STRING_THRESHOLD) {
            score += 1;
        }
    }
    score
}

/// Compute the risk level for a tool call.
///
/// Decision table (first match wins):
///
/// | condition                   | outcome |
/// |-----------------------------|---------|
/// | tool in HIGH_RISK_TOOLS     | high    |
/// | arg_score >= 2              | high    |
/// | tool in MEDIUM_RISK_TOOLS   | medium  |
/// | arg_score >= 1              | medium  |
/// | otherwise                   | low     |
pub fn compute_risk(tool: &str, args: &Map<String, Value>) -> RiskLevel {
    if HIGH_RISK_TOOLS.contains(&tool) {
        return RiskLevel::High;
    }
    let arg_score = score_args(args);
    if arg_score >= 2 {
        return RiskLevel::High;
    }
    if MEDIUM_RISK_TOOLS.contains(&tool) || arg_score >= 1 {
        return RiskLevel::Medium;
    }
    RiskLevel::Low
}
