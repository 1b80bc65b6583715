//! Content-policy filter.
//!
//! An ordered deny-list of patterns applied to every string value (recursive)
//! in tool-call args and chat message content.  Rules come from two sources
//! merged on each reload: boot-time literal patterns from the environment
//! (ephemeral) and a persisted JSON file mutable via the admin API.
//!
//! Readers hold a versioned snapshot pointer; reloads rebuild the compiled
//! list atomically so enforcement never observes a half-applied rule set.

use std::{fs, path::PathBuf, sync::Arc};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Rules ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleMode {
    #[default]
    Literal,
    Regex,
}

/// A persisted deny rule as stored in the rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub pattern: String,
    #[serde(default)]
    pub mode: RuleMode,
    #[serde(default)]
    pub label: String,
}

struct CompiledRule {
    re: Regex,
    label: String,
    raw: String,
}

/// Raised when a payload matches an active deny rule; the HTTP layer maps
/// this to a 403 with `{error: content_policy_violation, ...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub matched_rule: String,
    pub pattern: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("invalid regex {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
    #[error("rule index {0} out of range")]
    NoSuchRule(usize),
}

// ─── ContentFilter ───────────────────────────────────────────────────────────

/// Thread-safe content filter with atomic reloads.
pub struct ContentFilter {
    path: PathBuf,
    env_patterns: Vec<String>,
    compiled: ArcSwap<Vec<CompiledRule>>,
    /// Mirror of the persisted rules (excludes ephemeral env rules).
    file_rules: Mutex<Vec<FilterRule>>,
}

impl ContentFilter {
    /// Build the filter and load rules from `env_patterns` + the rules file.
    pub fn new(path: PathBuf, env_patterns: Vec<String>) -> Self {
        let filter = Self {
            path,
            env_patterns,
            compiled: ArcSwap::from_pointee(Vec::new()),
            file_rules: Mutex::new(Vec::new()),
        };
        filter.reload();
        filter
    }

    /// Re-read the rules file, merge with env patterns, and swap in the new
    /// compiled set.  Returns the count of active patterns.
    pub fn reload(&self) -> usize {
        let mut compiled = Vec::new();

        for pat in &self.env_patterns {
            let label = format!("env:{}", truncate(pat, 20));
            if let Ok(rule) = compile_rule(pat, RuleMode::Literal, &label) {
                compiled.push(rule);
            }
        }

        let mut file_rules = Vec::new();
        if let Ok(raw) = fs::read_to_string(&self.path) {
            if let Ok(rules) = serde_json::from_str::<Vec<FilterRule>>(&raw) {
                file_rules = rules;
            }
        }
        for rule in &file_rules {
            let label = effective_label(rule);
            // Broken persisted rules are skipped, not fatal.
            if let Ok(c) = compile_rule(&rule.pattern, rule.mode, &label) {
                compiled.push(c);
            }
        }

        let count = compiled.len();
        self.compiled.store(Arc::new(compiled));
        *self.file_rules.lock() = file_rules;
        count
    }

    /// Persisted rules only (env rules are not editable at runtime).
    pub fn rules(&self) -> Vec<FilterRule> {
        self.file_rules.lock().clone()
    }

    /// Validate, persist, and activate a new rule.
    pub fn add_rule(&self, pattern: &str, mode: RuleMode, label: &str) -> Result<(), FilterError> {
        let rule = FilterRule {
            pattern: pattern.to_owned(),
            mode,
            label: label.to_owned(),
        };
        // Compile before persisting so a bad regex never lands on disk.
        compile_rule(&rule.pattern, rule.mode, &effective_label(&rule))?;
        {
            let mut rules = self.file_rules.lock();
            rules.push(rule);
            self.persist(&rules);
        }
        self.reload();
        Ok(())
    }

    /// Remove the persisted rule at `index`.
    pub fn delete_rule(&self, index: usize) -> Result<(), FilterError> {
        {
            let mut rules = self.file_rules.lock();
            if index >= rules.len() {
                return Err(FilterError::NoSuchRule(index));
            }
            rules.remove(index);
            self.persist(&rules);
        }
        self.reload();
        Ok(())
    }

    /// Check every string value in `obj` (recursively) against the active
    /// rule set.  First match wins.
    pub fn check(&self, obj: &Value) -> Result<(), PolicyViolation> {
        let rules = self.compiled.load();
        if rules.is_empty() {
            return Ok(());
        }
        let mut texts = Vec::new();
        collect_strings(obj, &mut texts);
        for text in texts {
            for rule in rules.iter() {
                if rule.re.is_match(text) {
                    return Err(PolicyViolation {
                        matched_rule: rule.label.clone(),
                        pattern: rule.raw.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of active (compiled) patterns, including env rules.
    pub fn active_count(&self) -> usize {
        self.compiled.load().len()
    }

    fn persist(&self, rules: &[FilterRule]) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(rules) {
            Ok(json) => {
                if let Err(err) = fs::write(&self.path, json) {
                    tracing::warn!(%err, "failed to persist content-filter rules");
                }
            }
            Err(err) => tracing::warn!(%err, "failed to serialise content-filter rules"),
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn effective_label(rule: &FilterRule) -> String {
    if rule.label.is_empty() {
        truncate(&rule.pattern, 40).to_owned()
    } else {
        rule.label.clone()
    }
}

fn compile_rule(pattern: &str, mode: RuleMode, label: &str) -> Result<CompiledRule, FilterError> {
    let re = match mode {
        RuleMode::Literal => RegexBuilder::new(&regex::escape(pattern))
            .case_insensitive(true)
            .build(),
        RuleMode::Regex => RegexBuilder::new(pattern)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build(),
    }
    .map_err(|source| FilterError::InvalidRegex {
        pattern: pattern.to_owned(),
        source,
    })?;
    Ok(CompiledRule {
        re,
        label: label.to_owned(),
        raw: pattern.to_owned(),
    })
}

fn collect_strings<'a>(obj: &'a Value, out: &mut Vec<&'a str>) {
    match obj {
        Value::String(s) => out.push(s),
        Value::Object(map) => {
            for v in map.values() {
                collect_strings(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_strings(v, out);
            }
        }
        _ => {}
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn filter_in(dir: &TempDir, env: Vec<&str>) -> ContentFilter {
        ContentFilter::new(
            dir.path().join("rules.json"),
            env.into_iter().map(str::to_owned).collect(),
        )
    }

    #[test]
    fn no_rules_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let f = filter_in(&dir, vec![]);
        assert!(f.check(&json!({"cmd": "DROP TABLE users"})).is_ok());
    }

    #[test]
    fn literal_rule_matches_case_insensitively() {
        let dir = TempDir::new().unwrap();
        let f = filter_in(&dir, vec![]);
        f.add_rule("DROP TABLE", RuleMode::Literal, "sql-ddl").unwrap();

        let err = f.check(&json!("drop table users;")).unwrap_err();
        assert_eq!(err.matched_rule, "sql-ddl");
        assert_eq!(err.pattern, "DROP TABLE");
    }

    #[test]
    fn literal_rule_does_not_interpret_metacharacters() {
        let dir = TempDir::new().unwrap();
        let f = filter_in(&dir, vec![]);
        f.add_rule("a.b", RuleMode::Literal, "").unwrap();
        assert!(f.check(&json!("axb")).is_ok());
        assert!(f.check(&json!("a.b")).is_err());
    }

    #[test]
    fn regex_rule_matches() {
        let dir = TempDir::new().unwrap();
        let f = filter_in(&dir, vec![]);
        f.add_rule(r"rm\s+-rf", RuleMode::Regex, "shell-wipe").unwrap();
        assert!(f.check(&json!({"args": {"cmd": "rm   -rf /"}})).is_err());
    }

    #[test]
    fn invalid_regex_is_rejected_before_persisting() {
        let dir = TempDir::new().unwrap();
        let f = filter_in(&dir, vec![]);
        assert!(f.add_rule("(unclosed", RuleMode::Regex, "").is_err());
        assert!(f.rules().is_empty());
    }

    #[test]
    fn nested_values_are_scanned() {
        let dir = TempDir::new().unwrap();
        let f = filter_in(&dir, vec![]);
        f.add_rule("forbidden", RuleMode::Literal, "").unwrap();
        let payload = json!({"a": [{"b": {"c": "deeply FORBIDDEN text"}}], "n": 42});
        assert!(f.check(&payload).is_err());
    }

    #[test]
    fn env_rules_are_active_but_not_listed() {
        let dir = TempDir::new().unwrap();
        let f = filter_in(&dir, vec!["blocked-phrase"]);
        assert!(f.rules().is_empty());
        let err = f.check(&json!("BLOCKED-phrase here")).unwrap_err();
        assert!(err.matched_rule.starts_with("env:"));
    }

    #[test]
    fn delete_rule_deactivates_it() {
        let dir = TempDir::new().unwrap();
        let f = filter_in(&dir, vec![]);
        f.add_rule("one", RuleMode::Literal, "").unwrap();
        f.add_rule("two", RuleMode::Literal, "").unwrap();
        f.delete_rule(0).unwrap();
        assert!(f.check(&json!("one")).is_ok());
        assert!(f.check(&json!("two")).is_err());
        assert!(matches!(f.delete_rule(9), Err(FilterError::NoSuchRule(9))));
    }

    #[test]
    fn rules_survive_reload_from_disk() {
        let dir = TempDir::new().unwrap();
        {
            let f = filter_in(&dir, vec![]);
            f.add_rule("persisted", RuleMode::Literal, "keep").unwrap();
        }
        let f = filter_in(&dir, vec![]);
        assert_eq!(f.rules().len(), 1);
        assert!(f.check(&json!("persisted")).is_err());
    }
}
