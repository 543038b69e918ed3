use crate::error::{AttestError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const GOVERNANCE_DIR: &str = "governance";
pub const CONFIG_FILE: &str = "governance/config.yaml";
pub const LEDGER_FILE: &str = "governance/ledger.jsonl";

pub const SIGNALS_DIR: &str = "knowledge/signals";
pub const PROPOSALS_DIR: &str = "knowledge/proposals";
pub const VALIDATIONS_DIR: &str = "knowledge/validations";
pub const APPROVALS_DIR: &str = "knowledge/approvals";
pub const PROMOTIONS_DIR: &str = "knowledge/promotions";
pub const SOURCE_PACKS_DIR: &str = "knowledge/packs";

pub const ACTIVE_PACK_FILE: &str = "knowledge/active/ACTIVE_PACK.json";
pub const SNAPSHOTS_DIR: &str = "knowledge/active/_snapshots";
pub const ACTIVE_PACKS_DIR: &str = "knowledge/active/packs";

pub const MANIFEST_FILE: &str = "manifest.json";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn ledger_path(root: &Path) -> PathBuf {
    root.join(LEDGER_FILE)
}

pub fn signal_path(root: &Path, id: &str) -> PathBuf {
    root.join(SIGNALS_DIR).join(format!("{id}.json"))
}

pub fn proposal_path(root: &Path, id: &str) -> PathBuf {
    root.join(PROPOSALS_DIR).join(format!("{id}.json"))
}

pub fn validation_path(root: &Path, id: &str) -> PathBuf {
    root.join(VALIDATIONS_DIR).join(format!("{id}.json"))
}

pub fn approval_path(root: &Path, id: &str) -> PathBuf {
    root.join(APPROVALS_DIR).join(format!("{id}.json"))
}

pub fn source_pack_dir(root: &Path, version: &str) -> PathBuf {
    root.join(SOURCE_PACKS_DIR).join(version)
}

pub fn active_pack_dir(root: &Path, version: &str) -> PathBuf {
    root.join(ACTIVE_PACKS_DIR).join(version)
}

pub fn active_pack_marker(root: &Path) -> PathBuf {
    root.join(ACTIVE_PACK_FILE)
}

pub fn snapshots_dir(root: &Path) -> PathBuf {
    root.join(SNAPSHOTS_DIR)
}

pub fn snapshot_path(root: &Path, snapshot_id: &str) -> PathBuf {
    snapshots_dir(root).join(format!("{snapshot_id}.json"))
}

/// Render `path` relative to `root` with forward slashes, for ledger refs.
pub fn display_relative(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

static ID_RE: OnceLock<Regex> = OnceLock::new();

fn id_re() -> &'static Regex {
    ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-]*$").unwrap())
}

/// Validate a record id, pack version or snapshot id before it is joined onto
/// a store directory. Rejects separators and `..` so ids cannot escape.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 128 || !id_re().is_match(id) || id.contains("..") {
        return Err(AttestError::InvalidId(id.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
