//! Tool-call supervision pipeline.
//!
//! Converts an untrusted tool call into one of five outcomes, first match
//! wins:
//!
//! ```text
//! global schema ──► per-tool args schema ──► content filter ──►
//! capability check ──► sanitise ──► risk score ──► approval routing
//! ```
//!
//! The sanitised payload is what the approval queue and `accepted`
//! responses carry.  When the tool has a manifest, its `requires_approval`
//! flag is authoritative; otherwise only heuristic `high` risk enters the
//! queue.

pub mod approvals;
pub mod risk;
pub mod sanitize;

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::{capability::CapabilityVerifier, filter::ContentFilter};
use approvals::ApprovalQueue;
use risk::{RiskLevel, compute_risk};

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// Structured feedback attached to a validation error.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationFeedback {
    pub error_code: String,
    pub message: String,
    pub path: Vec<String>,
    pub token: String,
}

/// Result of [`Supervisor::process_call`].
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    ValidationError {
        error_token: String,
        feedback: ValidationFeedback,
    },
    ContentPolicyViolation {
        matched_rule: String,
        pattern: String,
    },
    CapabilityDenied {
        tool: String,
        denied_capabilities: Vec<String>,
        message: String,
    },
    PendingApproval {
        id: u64,
        risk: RiskLevel,
    },
    Accepted {
        tool: String,
        args: Value,
        risk: RiskLevel,
        message: String,
    },
}

impl ProcessOutcome {
    /// Wire representation matching the gateway's response shapes.
    pub fn to_value(&self) -> Value {
        match self {
            Self::ValidationError { error_token, feedback } => json!({
                "status": "validation_error",
                "error_token": error_token,
                "feedback": feedback,
            }),
            Self::ContentPolicyViolation { matched_rule, pattern } => json!({
                "error": "content_policy_violation",
                "matched_rule": matched_rule,
                "pattern": pattern,
            }),
            Self::CapabilityDenied { tool, denied_capabilities, message } => json!({
                "status": "capability_denied",
                "tool": tool,
                "denied_capabilities": denied_capabilities,
                "message": message,
            }),
            Self::PendingApproval { id, risk } => json!({
                "status": "pending_approval",
                "id": id,
                "risk": risk,
            }),
            Self::Accepted { tool, args, risk, message } => json!({
                "tool": tool,
                "args": args,
                "status": "accepted",
                "risk": risk,
                "message": message,
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid top-level tool schema: {0}")]
    BadSchema(String),
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// The supervision pipeline service.
pub struct Supervisor {
    schema: jsonschema::Validator,
    schema_dir: PathBuf,
    verifier: Arc<CapabilityVerifier>,
    filter: Arc<ContentFilter>,
    pub queue: ApprovalQueue,
    /// Compiled per-tool args validators, cached by tool id.
    tool_schemas: Mutex<HashMap<String, Option<Arc<jsonschema::Validator>>>>,
}

/// Default top-level payload schema: `tool` is a bounded-length string and
/// `args` is an object.
pub fn default_tool_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "tool": { "type": "string", "minLength": 1, "maxLength": 256 },
            "args": { "type": "object" },
        },
        "required": ["tool", "args"],
    })
}

impl Supervisor {
    pub fn new(
        schema: Value,
        schema_dir: PathBuf,
        verifier: Arc<CapabilityVerifier>,
        filter: Arc<ContentFilter>,
    ) -> Result<Self, SupervisorError> {
        let schema = jsonschema::validator_for(&schema)
            .map_err(|e| SupervisorError::BadSchema(e.to_string()))?;
        Ok(Self {
            schema,
            schema_dir,
            verifier,
            filter,
            queue: ApprovalQueue::new(),
            tool_schemas: Mutex::new(HashMap::new()),
        })
    }

    /// Schema-only validation used by `POST /validate`.
    pub fn validate_only(&self, payload: &Value) -> Result<(), String> {
        self.schema
            .validate(payload)
            .map_err(|e| e.to_string())
    }

    /// Run the full pipeline over an untrusted payload.
    pub fn process_call(&self, payload: &Value) -> ProcessOutcome {
        // 1. Global schema.
        if let Err(err) = self.schema.validate(payload) {
            return make_validation_error("schema", &err.to_string(), error_path(&err), payload);
        }

        let tool = payload
            .get("tool")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let args_value = payload.get("args").cloned().unwrap_or_else(|| json!({}));
        let args: Map<String, Value> = args_value.as_object().cloned().unwrap_or_default();

        // 2. Per-tool args schema, when one exists on disk.
        if let Some(validator) = self.tool_schema_for(&tool) {
            if let Err(err) = validator.validate(&args_value) {
                return make_validation_error(
                    "tool_args",
                    &err.to_string(),
                    error_path(&err),
                    &args_value,
                );
            }
        }

        // 3. Content policy over every string value in args.
        if let Err(violation) = self.filter.check(&args_value) {
            return ProcessOutcome::ContentPolicyViolation {
                matched_rule: violation.matched_rule,
                pattern: violation.pattern,
            };
        }

        // 4. Capability check.
        let (allowed, denied) = self.verifier.check(&tool, &args);
        if !allowed {
            return ProcessOutcome::CapabilityDenied {
                tool,
                denied_capabilities: denied,
                message: "This tool requires capabilities that are not permitted in this \
                          deployment. Set PALISADE_ALLOWED_CAPS to grant access."
                    .to_owned(),
            };
        }

        // 5. Sanitise; 6. risk on the original args.
        let sanitized_args = sanitize::sanitize(&args_value);
        let risk_level = compute_risk(&tool, &args);
        let sanitized_payload = json!({ "tool": tool, "args": sanitized_args });

        // 7. Approval routing: the manifest is authoritative when present.
        let requires_approval = match self.verifier.manifest_for(&tool) {
            Some(manifest) => manifest.requires_approval,
            None => risk_level == RiskLevel::High,
        };
        if requires_approval {
            let id = self.queue.submit(sanitized_payload, risk_level);
            return ProcessOutcome::PendingApproval { id, risk: risk_level };
        }

        let message = if self.verifier.manifest_for(&tool).is_some() {
            "validated and sanitized (supervisor; manifest auto-approved)"
        } else {
            "validated and sanitized (supervisor)"
        };
        ProcessOutcome::Accepted {
            tool,
            args: sanitized_args,
            risk: risk_level,
            message: message.to_owned(),
        }
    }

    /// Compiled args validator for `tool`, cached (including negative hits).
    fn tool_schema_for(&self, tool: &str) -> Option<Arc<jsonschema::Validator>> {
        if let Some(cached) = self.tool_schemas.lock().get(tool) {
            return cached.clone();
        }
        let loaded = self.load_tool_schema(tool);
        self.tool_schemas.lock().insert(tool.to_owned(), loaded.clone());
        loaded
    }

    fn load_tool_schema(&self, tool: &str) -> Option<Arc<jsonschema::Validator>> {
        if !tool.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
            return None;
        }
        let nested = self.schema_dir.join(tool.replace('.', "/")).with_extension("json");
        let flat = self.schema_dir.join(format!("{tool}.json"));
        let raw = fs::read_to_string(&nested)
            .or_else(|_| fs::read_to_string(&flat))
            .ok()?;
        let schema: Value = serde_json::from_str(&raw).ok()?;
        match jsonschema::validator_for(&schema) {
            Ok(v) => Some(Arc::new(v)),
            Err(err) => {
                tracing::warn!(%tool, %err, "unusable per-tool schema ignored");
                None
            }
        }
    }

    /// Invalidate the per-tool schema cache (admin reload).
    pub fn reload_tool_schemas(&self) {
        self.tool_schemas.lock().clear();
    }
}

// ─── Validation error helpers ────────────────────────────────────────────────

fn error_path(err: &jsonschema::ValidationError<'_>) -> Vec<String> {
    err.instance_path()
        .to_string()
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn make_validation_error(
    phase: &str,
    message: &str,
    path: Vec<String>,
    payload: &Value,
) -> ProcessOutcome {
    let canon = canonical_json(payload);
    let mut hasher = Sha256::new();
    hasher.update(format!("{phase}:{message}:{canon}").as_bytes());
    let token: String = hex::encode(hasher.finalize())[..12].to_owned();
    ProcessOutcome::ValidationError {
        error_token: token.clone(),
        feedback: ValidationFeedback {
            error_code: format!("{phase}_validation_error"),
            message: message.to_owned(),
            path,
            token,
        },
    }
}

/// Serialise with recursively sorted object keys so equal payloads always
/// produce the same error token.
fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: std::collections::BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, sort(v))).collect();
                serde_json::to_value(sorted).unwrap_or_default()
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).unwrap_or_default()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
