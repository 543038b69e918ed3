//! Content-addressed packs and the active-pack pointer.
//!
//! A pack is a directory with a `manifest.json` listing every file and its
//! SHA-256; the manifest carries a hash of itself. [`apply`] and
//! [`rollback`] move `ACTIVE_PACK.json`, snapshotting it before every
//! mutation, and undo the move when the ledger cannot record it.

use crate::decision::{Decision, PackApplied, PackRolledBack};
use crate::error::{AttestError, Result};
use crate::hashing::{canonical_hash_excluding, file_sha256, utc_timestamp};
use crate::io;
use crate::ledger::Ledger;
use crate::paths;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackManifest {
    pub pack_version: String,
    pub generated_at_utc: String,
    pub git_commit_hash: Option<String>,
    pub proposal_id: Option<String>,
    pub files: Vec<ManifestFile>,
    pub manifest_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("manifest missing at {0}")]
    MissingManifest(String),

    #[error("manifest is corrupt: {0}")]
    CorruptManifest(String),

    #[error("manifest hash mismatch: expected {expected}, got {actual}")]
    ManifestHashMismatch { expected: String, actual: String },

    #[error("manifest contains no files")]
    EmptyFileList,

    #[error("unsafe path in manifest: {0}")]
    UnsafePath(String),

    #[error("file missing: {0}")]
    MissingFile(String),

    #[error("file {path} is unreadable: {reason}")]
    UnreadableFile { path: String, reason: String },

    #[error("file hash mismatch for {path}: expected {expected}, got {actual}")]
    FileHashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("manifest declares version {found}, expected {expected}")]
    VersionMismatch { expected: String, found: String },
}

/// Check a pack directory against its manifest. Every check runs on every
/// call; nothing is cached between calls.
pub fn verify_pack(dir: &Path) -> std::result::Result<PackManifest, IntegrityError> {
    let manifest_path = dir.join(paths::MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(IntegrityError::MissingManifest(
            manifest_path.display().to_string(),
        ));
    }
    let raw = std::fs::read_to_string(&manifest_path)
        .map_err(|e| IntegrityError::CorruptManifest(e.to_string()))?;
    let value: Value =
        serde_json::from_str(&raw).map_err(|e| IntegrityError::CorruptManifest(e.to_string()))?;

    let stored = value
        .get("manifest_hash")
        .and_then(Value::as_str)
        .ok_or_else(|| IntegrityError::CorruptManifest("missing manifest_hash".into()))?
        .to_string();
    let actual = canonical_hash_excluding(&value, "manifest_hash");
    if actual != stored {
        return Err(IntegrityError::ManifestHashMismatch {
            expected: stored,
            actual,
        });
    }

    let manifest: PackManifest = serde_json::from_value(value)
        .map_err(|e| IntegrityError::CorruptManifest(e.to_string()))?;
    if manifest.files.is_empty() {
        return Err(IntegrityError::EmptyFileList);
    }
    for file in &manifest.files {
        if !is_safe_relative(&file.path) {
            return Err(IntegrityError::UnsafePath(file.path.clone()));
        }
        let path = dir.join(&file.path);
        if !path.is_file() {
            return Err(IntegrityError::MissingFile(file.path.clone()));
        }
        let actual = file_sha256(&path).map_err(|e| IntegrityError::UnreadableFile {
            path: file.path.clone(),
            reason: e.to_string(),
        })?;
        if actual != file.sha256 {
            return Err(IntegrityError::FileHashMismatch {
                path: file.path.clone(),
                expected: file.sha256.clone(),
                actual,
            });
        }
    }
    Ok(manifest)
}

/// Relative, `/`-separated, and confined to the pack directory.
fn is_safe_relative(path: &str) -> bool {
    if path.is_empty() || path.contains('\\') {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

/// Copy `source_dir` into the source store as `version` and write its
/// manifest. The pack appears under its final name only once complete.
pub fn build_pack(
    root: &Path,
    source_dir: &Path,
    version: &str,
    git_commit_hash: Option<&str>,
    proposal_id: Option<&str>,
) -> Result<PackManifest> {
    paths::validate_id(version)?;
    if !source_dir.is_dir() {
        return Err(AttestError::InvalidInput(format!(
            "{} is not a directory",
            source_dir.display()
        )));
    }
    if source_dir.join(paths::MANIFEST_FILE).exists() {
        return Err(AttestError::InvalidInput(format!(
            "{} already contains a {}",
            source_dir.display(),
            paths::MANIFEST_FILE
        )));
    }
    let target = paths::source_pack_dir(root, version);
    if target.exists() {
        return Err(AttestError::RecordExists(target.display().to_string()));
    }
    let parent = root.join(paths::SOURCE_PACKS_DIR);
    io::ensure_dir(&parent)?;
    let staging = parent.join(format!(".{version}.staging-{}", uuid::Uuid::new_v4()));

    let built = stage_pack(&staging, source_dir, version, git_commit_hash, proposal_id)
        .and_then(|manifest| {
            std::fs::rename(&staging, &target)?;
            Ok(manifest)
        });
    if built.is_err() && staging.exists() {
        let _ = std::fs::remove_dir_all(&staging);
    }
    let manifest = built?;
    tracing::info!(version, files = manifest.files.len(), "pack built");
    Ok(manifest)
}

fn stage_pack(
    staging: &Path,
    source_dir: &Path,
    version: &str,
    git_commit_hash: Option<&str>,
    proposal_id: Option<&str>,
) -> Result<PackManifest> {
    io::copy_dir_all(source_dir, staging)?;
    let mut files = Vec::new();
    for rel in walk_files(staging)? {
        let sha256 = file_sha256(&staging.join(&rel))?;
        files.push(ManifestFile { path: rel, sha256 });
    }
    if files.is_empty() {
        return Err(AttestError::InvalidInput(format!(
            "{} contains no files",
            source_dir.display()
        )));
    }
    let mut manifest = PackManifest {
        pack_version: version.to_string(),
        generated_at_utc: utc_timestamp(),
        git_commit_hash: git_commit_hash.map(str::to_string),
        proposal_id: proposal_id.map(str::to_string),
        files,
        manifest_hash: String::new(),
    };
    manifest.manifest_hash =
        canonical_hash_excluding(&serde_json::to_value(&manifest)?, "manifest_hash");
    io::write_json_sorted(&staging.join(paths::MANIFEST_FILE), &manifest)?;
    Ok(manifest)
}

/// Every regular file below `dir`, as sorted `/`-separated relative paths.
fn walk_files(dir: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut stack: Vec<PathBuf> = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else {
                out.push(paths::display_relative(dir, &path));
            }
        }
    }
    out.sort();
    Ok(out)
}

// ---------------------------------------------------------------------------
// ActivePackMarker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePackMarker {
    pub pack_version: String,
    pub applied_at_utc: String,
    pub git_commit_hash: Option<String>,
    pub promotion_id: Option<String>,
}

impl ActivePackMarker {
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = paths::active_pack_marker(root);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }
}

/// Marker bytes as they are on disk, for snapshots and compensation.
fn read_marker_bytes(root: &Path) -> Result<Option<Vec<u8>>> {
    let path = paths::active_pack_marker(root);
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(std::fs::read(&path)?))
}

/// `pack_version` from marker bytes; a corrupt marker yields `None`.
fn marker_version(bytes: &[u8]) -> Option<String> {
    serde_json::from_slice::<Value>(bytes)
        .ok()?
        .get("pack_version")?
        .as_str()
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Store `marker` as a new snapshot named after the current time and the
/// version it captures. Returns the snapshot id.
fn take_snapshot(root: &Path, marker: &[u8], version: Option<&str>) -> Result<String> {
    let stamp = utc_timestamp().replace([':', '-'], "");
    let base = format!("{stamp}_{}", version.unwrap_or("unknown"));
    let base = if paths::validate_id(&base).is_ok() {
        base
    } else {
        format!("{stamp}_unknown")
    };
    let mut id = base.clone();
    let mut n = 1;
    loop {
        match io::write_immutable_bytes(&paths::snapshot_path(root, &id), marker) {
            Ok(()) => break,
            Err(AttestError::RecordExists(_)) => {
                n += 1;
                id = format!("{base}-{n}");
            }
            Err(e) => return Err(e),
        }
    }
    tracing::info!(snapshot = %id, "snapshot created");
    Ok(id)
}

/// Accepts `<id>` or `<id>.json`.
fn normalize_snapshot_id(arg: &str) -> Result<String> {
    let id = arg.strip_suffix(".json").unwrap_or(arg);
    paths::validate_id(id)?;
    Ok(id.to_string())
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub pack_version: String,
    pub previous_pack_version: Option<String>,
    pub snapshot_id: Option<String>,
    pub manifest_hash: String,
    pub promotion_id: Option<String>,
    pub ledger_seq: u64,
}

pub fn apply(
    root: &Path,
    version: &str,
    actor: &str,
    force: bool,
    notes: Option<&str>,
) -> Result<ApplyOutcome> {
    paths::validate_id(version)?;
    let source = paths::source_pack_dir(root, version);
    if !source.is_dir() {
        return Err(AttestError::PackNotFound(version.to_string()));
    }
    let manifest = verify_pack(&source)?;
    if manifest.pack_version != version {
        return Err(IntegrityError::VersionMismatch {
            expected: version.to_string(),
            found: manifest.pack_version,
        }
        .into());
    }

    let ledger = Ledger::for_root(root);
    ledger.verify()?;

    let previous_bytes = read_marker_bytes(root)?;
    let previous_version = previous_bytes.as_deref().and_then(marker_version);
    if previous_version.as_deref() == Some(version) && !force {
        return Err(AttestError::blocked(format!(
            "pack {version} is already active"
        )));
    }
    let promotion_id = find_promotion(root, &manifest)?;

    let snapshot_id = match &previous_bytes {
        Some(bytes) => Some(take_snapshot(root, bytes, previous_version.as_deref())?),
        None => None,
    };
    let marker = ActivePackMarker {
        pack_version: version.to_string(),
        applied_at_utc: utc_timestamp(),
        git_commit_hash: manifest.git_commit_hash.clone(),
        promotion_id: promotion_id.clone(),
    };
    let marker_path = paths::active_pack_marker(root);
    let switched = io::replace_dir(&source, &paths::active_pack_dir(root, version))
        .and_then(|()| io::write_json_sorted(&marker_path, &marker));
    if let Err(err) = switched {
        return Err(compensate(
            root,
            "pack apply",
            err,
            previous_bytes.as_deref(),
            snapshot_id.as_deref(),
        ));
    }

    let decision = Decision::PackApplied(PackApplied {
        manifest_hash: manifest.manifest_hash.clone(),
        git_commit_hash: manifest.git_commit_hash.clone(),
        snapshot_ref: snapshot_id
            .as_deref()
            .map(|id| paths::display_relative(root, &paths::snapshot_path(root, id))),
        previous_pack_version: previous_version.clone(),
        promotion_id: promotion_id.clone(),
        forced: force,
        notes: notes.map(str::to_string),
    });
    let evidence = paths::display_relative(root, &marker_path);
    let entry = match ledger.append(actor, version, Some(&evidence), &decision) {
        Ok(entry) => entry,
        Err(err) => {
            return Err(compensate(
                root,
                "pack apply",
                err,
                previous_bytes.as_deref(),
                snapshot_id.as_deref(),
            ))
        }
    };

    tracing::info!(
        version,
        previous = previous_version.as_deref().unwrap_or("none"),
        "pack applied"
    );
    Ok(ApplyOutcome {
        pack_version: version.to_string(),
        previous_pack_version: previous_version,
        snapshot_id,
        manifest_hash: manifest.manifest_hash,
        promotion_id,
        ledger_seq: entry.ledger_seq,
    })
}

/// Promotion record whose `proposal_id` and `target_git_ref` match the
/// manifest. Packs without a proposal have no promotion.
fn find_promotion(root: &Path, manifest: &PackManifest) -> Result<Option<String>> {
    let Some(proposal_id) = &manifest.proposal_id else {
        return Ok(None);
    };
    for path in io::list_json_files(&root.join(paths::PROMOTIONS_DIR))? {
        let record: Value = match std::fs::read_to_string(&path)
            .map_err(AttestError::from)
            .and_then(|s| Ok(serde_json::from_str(&s)?))
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable promotion");
                continue;
            }
        };
        let same_proposal = record.get("proposal_id").and_then(Value::as_str) == Some(proposal_id);
        let same_ref = record.get("target_git_ref").and_then(Value::as_str)
            == manifest.git_commit_hash.as_deref();
        if same_proposal && same_ref {
            return Ok(record
                .get("governance_id")
                .and_then(Value::as_str)
                .map(str::to_string));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub restored_pack_version: String,
    pub previous_pack_version: Option<String>,
    pub snapshot_id: String,
    pub pre_rollback_snapshot_id: String,
    pub restored_from_source: bool,
    pub ledger_seq: u64,
}

pub fn rollback(
    root: &Path,
    snapshot: &str,
    actor: &str,
    notes: Option<&str>,
) -> Result<RollbackOutcome> {
    let snapshot_id = normalize_snapshot_id(snapshot)?;
    let snapshot_path = paths::snapshot_path(root, &snapshot_id);
    if !snapshot_path.is_file() {
        return Err(AttestError::SnapshotNotFound(snapshot_id));
    }
    let snapshot_bytes = std::fs::read(&snapshot_path)?;
    let snapshot_value: Value = serde_json::from_slice(&snapshot_bytes).map_err(|e| {
        AttestError::blocked(format!("snapshot {snapshot_id} is not valid JSON: {e}"))
    })?;
    let target_version = snapshot_value
        .get("pack_version")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            AttestError::blocked(format!("snapshot {snapshot_id} has no pack_version"))
        })?
        .to_string();
    paths::validate_id(&target_version)?;

    let Some(previous_bytes) = read_marker_bytes(root)? else {
        return Err(AttestError::blocked(
            "no active pack marker; cannot roll back from an undefined state",
        ));
    };
    let previous_version = marker_version(&previous_bytes);

    let ledger = Ledger::for_root(root);
    ledger.verify()?;

    let active_dir = paths::active_pack_dir(root, &target_version);
    let mut manifest_hash = None;
    let restored_from_source = !active_dir.is_dir();
    if restored_from_source {
        let source = paths::source_pack_dir(root, &target_version);
        if !source.is_dir() {
            return Err(AttestError::PackNotFound(target_version));
        }
        let manifest = verify_pack(&source)?;
        io::replace_dir(&source, &active_dir)?;
        manifest_hash = Some(manifest.manifest_hash);
    }

    let pre_snapshot = take_snapshot(root, &previous_bytes, previous_version.as_deref())?;
    let marker_path = paths::active_pack_marker(root);
    if let Err(err) = io::atomic_write(&marker_path, &snapshot_bytes) {
        return Err(compensate(
            root,
            "pack rollback",
            err,
            Some(previous_bytes.as_slice()),
            Some(pre_snapshot.as_str()),
        ));
    }

    let decision = Decision::PackRolledBack(PackRolledBack {
        snapshot_ref: paths::display_relative(root, &snapshot_path),
        previous_pack_version: previous_version.clone(),
        restored_pack_version: target_version.clone(),
        restored_git_commit_hash: snapshot_value
            .get("git_commit_hash")
            .and_then(Value::as_str)
            .map(str::to_string),
        manifest_hash,
        pre_rollback_snapshot_ref: Some(paths::display_relative(
            root,
            &paths::snapshot_path(root, &pre_snapshot),
        )),
        notes: notes.map(str::to_string),
    });
    let evidence = paths::display_relative(root, &marker_path);
    let entry = match ledger.append(actor, &target_version, Some(&evidence), &decision) {
        Ok(entry) => entry,
        Err(err) => {
            return Err(compensate(
                root,
                "pack rollback",
                err,
                Some(previous_bytes.as_slice()),
                Some(pre_snapshot.as_str()),
            ))
        }
    };

    tracing::info!(
        restored = %target_version,
        snapshot = %snapshot_id,
        "pack rolled back"
    );
    Ok(RollbackOutcome {
        restored_pack_version: target_version,
        previous_pack_version: previous_version,
        snapshot_id,
        pre_rollback_snapshot_id: pre_snapshot,
        restored_from_source,
        ledger_seq: entry.ledger_seq,
    })
}

// ---------------------------------------------------------------------------
// Compensation
// ---------------------------------------------------------------------------

/// Put the marker back the way it was and drop the snapshot taken for this
/// mutation. Called for any failure after the snapshot was written. Returns
/// the error to report: operational when the revert succeeded, critical when
/// it did not.
fn compensate(
    root: &Path,
    operation: &str,
    cause: AttestError,
    previous_marker: Option<&[u8]>,
    snapshot_id: Option<&str>,
) -> AttestError {
    tracing::warn!(operation, error = %cause, "reverting active pack marker");
    let marker_path = paths::active_pack_marker(root);
    let reverted = match previous_marker {
        Some(bytes) => io::atomic_write(&marker_path, bytes),
        None => match std::fs::remove_file(&marker_path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        },
    };
    if let Err(e) = reverted {
        tracing::error!(operation, error = %e, "failed to revert active pack marker");
        return AttestError::Critical {
            operation: operation.to_string(),
            reason: cause.to_string(),
            compensation_error: e.to_string(),
        };
    }
    if let Some(id) = snapshot_id {
        if let Err(e) = io::remove_immutable(&paths::snapshot_path(root, id)) {
            tracing::warn!(snapshot = id, error = %e, "failed to remove snapshot after revert");
        }
    }
    AttestError::Operational {
        operation: operation.to_string(),
        reason: cause.to_string(),
        compensation: "active pack marker restored".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PackStatus {
    pub active: Option<ActivePackMarker>,
    pub snapshots: Vec<String>,
    pub available: Vec<String>,
}

pub fn status(root: &Path) -> Result<PackStatus> {
    let snapshots = io::list_json_files(&paths::snapshots_dir(root))?
        .iter()
        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    let mut available = Vec::new();
    let packs = root.join(paths::SOURCE_PACKS_DIR);
    if packs.is_dir() {
        for entry in std::fs::read_dir(&packs)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && !name.starts_with('.') {
                available.push(name);
            }
        }
    }
    available.sort();
    Ok(PackStatus {
        active: ActivePackMarker::load(root)?,
        snapshots,
        available,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
