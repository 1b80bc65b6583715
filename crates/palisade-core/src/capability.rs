//! Capability manifests and the boot-time allow-set verifier.
//!
//! Each tool may ship a JSON manifest declaring the capabilities it needs
//! (`fs.read`, `net.http`, ...), its risk level, whether it always requires
//! human approval, and which argument keys it accepts.  The verifier checks
//! a tool call's declared capabilities against the deployment allow-set and
//! enforces the arg-key guard.
//!
//! Tools without a manifest pass the capability check; the supervisor's
//! heuristic risk scoring still applies to them.

use std::{
    collections::{BTreeSet, HashMap},
    fs,
    path::PathBuf,
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::supervisor::risk::RiskLevel;

/// Wildcard sentinel that grants every capability and disables the arg-key
/// guard (development deployments).
pub const ALL_CAPS: &str = "ALL";

/// Capabilities granted when `PALISADE_ALLOWED_CAPS` is unset: read-only,
/// so a fresh install is safe by construction.
const DEFAULT_CAPS: &[&str] = &["fs.read", "browser.dom"];

// ─── ToolManifest ────────────────────────────────────────────────────────────

/// Per-tool contract loaded from the manifest directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolManifest {
    pub tool: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: BTreeSet<String>,
    #[serde(default)]
    pub optional: BTreeSet<String>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub requires_approval: bool,
    /// `None` means unrestricted argument keys.
    #[serde(default)]
    pub allowed_arg_keys: Option<BTreeSet<String>>,
}

// ─── ManifestRegistry ────────────────────────────────────────────────────────

/// Lazily-loaded, cached manifest store.
///
/// Manifests live as individual JSON documents under the manifest directory;
/// the tool id maps to a path by replacing `.` with `/` (`file.read` →
/// `file/read.json`), with a flat `<tool>.json` fallback.
pub struct ManifestRegistry {
    dir: PathBuf,
    cache: Mutex<HashMap<String, Option<Arc<ToolManifest>>>>,
}

impl ManifestRegistry {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, cache: Mutex::new(HashMap::new()) }
    }

    /// Load the manifest for `tool`, consulting the cache first.
    pub fn load(&self, tool: &str) -> Option<Arc<ToolManifest>> {
        if let Some(cached) = self.cache.lock().get(tool) {
            return cached.clone();
        }
        let loaded = self.load_uncached(tool);
        self.cache.lock().insert(tool.to_owned(), loaded.clone());
        loaded
    }

    /// Drop the cache so the next lookups re-read from disk.
    pub fn reload(&self) {
        self.cache.lock().clear();
    }

    /// All manifests on disk, sorted by tool id.
    pub fn list_all(&self) -> Vec<Arc<ToolManifest>> {
        let mut out = Vec::new();
        collect_manifest_files(&self.dir, &mut out);
        out.sort();
        out.into_iter()
            .filter_map(|path| {
                let raw = fs::read_to_string(&path).ok()?;
                serde_json::from_str::<ToolManifest>(&raw).ok().map(Arc::new)
            })
            .collect()
    }

    fn load_uncached(&self, tool: &str) -> Option<Arc<ToolManifest>> {
        // Reject ids that could escape the manifest dir before touching disk.
        if !tool.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
            return None;
        }
        let nested = self.dir.join(tool.replace('.', "/")).with_extension("json");
        let flat = self.dir.join(format!("{tool}.json"));
        let raw = fs::read_to_string(&nested)
            .or_else(|_| fs::read_to_string(&flat))
            .ok()?;
        match serde_json::from_str::<ToolManifest>(&raw) {
            Ok(m) => Some(Arc::new(m)),
            Err(err) => {
                tracing::warn!(%tool, %err, "malformed tool manifest ignored");
                None
            }
        }
    }
}

fn collect_manifest_files(dir: &std::path::Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_manifest_files(&path, out);
        } else if path.extension().is_some_and(|e| e == "json") {
            out.push(path);
        }
    }
}

// ─── CapabilityVerifier ──────────────────────────────────────────────────────

/// Checks a tool call's declared capabilities against the deployment
/// allow-set and enforces the manifest's arg-key restrictions.
pub struct CapabilityVerifier {
    registry: Arc<ManifestRegistry>,
    allowed: BTreeSet<String>,
}

impl CapabilityVerifier {
    /// Parse the allow-set from its env-var form: a comma-separated list of
    /// capability strings or the `ALL` sentinel.  `None` yields the
    /// read-only defaults.
    pub fn from_allow_spec(registry: Arc<ManifestRegistry>, spec: Option<&str>) -> Self {
        let allowed = match spec {
            Some(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
            _ => DEFAULT_CAPS.iter().map(|s| (*s).to_owned()).collect(),
        };
        Self { registry, allowed }
    }

    pub fn with_allowed(registry: Arc<ManifestRegistry>, allowed: BTreeSet<String>) -> Self {
        Self { registry, allowed }
    }

    /// Returns `(allowed, denied)`.  `denied` lists missing capabilities
    /// plus `arg_keys_not_allowed:<key>` entries for rejected argument keys.
    pub fn check(
        &self,
        tool: &str,
        args: &serde_json::Map<String, serde_json::Value>,
    ) -> (bool, Vec<String>) {
        let Some(manifest) = self.registry.load(tool) else {
            // No manifest, nothing to verify here.
            return (true, Vec::new());
        };

        let wildcard = self.allowed.contains(ALL_CAPS);
        let mut denied: Vec<String> = Vec::new();

        if !wildcard {
            for cap in &manifest.required {
                if !self.allowed.contains(cap) {
                    denied.push(cap.clone());
                }
            }
            if let Some(allowed_keys) = &manifest.allowed_arg_keys {
                for key in args.keys() {
                    if !allowed_keys.contains(key) {
                        denied.push(format!("arg_keys_not_allowed:{key}"));
                    }
                }
            }
        }

        (denied.is_empty(), denied)
    }

    /// Manifest lookup for callers that need routing metadata.
    pub fn manifest_for(&self, tool: &str) -> Option<Arc<ToolManifest>> {
        self.registry.load(tool)
    }

    pub fn allowed_caps(&self) -> &BTreeSet<String> {
        &self.allowed
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
