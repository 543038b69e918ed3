//! Append-only, hash-chained event ledger (`governance/ledger.jsonl`).
//!
//! Each line is one [`LedgerEntry`]. `integrity_hash` is the SHA-256 of the
//! entry in canonical form without that field, and `previous_entry_hash`
//! links to the preceding entry (the first entry links to [`GENESIS_HASH`]).

use crate::decision::Decision;
use crate::error::{AttestError, Result};
use crate::hashing::{canonical_hash_excluding, utc_timestamp, GENESIS_HASH};
use crate::io;
use crate::paths;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ---------------------------------------------------------------------------
// LedgerAction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerAction {
    #[serde(rename = "SIGNAL_CREATED")]
    SignalCreated,
    #[serde(rename = "PROPOSAL_CREATED")]
    ProposalCreated,
    #[serde(rename = "PROPOSAL_VALIDATED")]
    ProposalValidated,
    #[serde(rename = "PROPOSAL_APPROVED")]
    ProposalApproved,
    #[serde(rename = "PACK_APPLIED")]
    PackApplied,
    #[serde(rename = "PACK_ROLLED_BACK")]
    PackRolledBack,
    #[serde(rename = "run_started")]
    RunStarted,
    #[serde(rename = "run_completed")]
    RunCompleted,
    #[serde(rename = "risk_gate_forced")]
    RiskGateForced,
    #[serde(rename = "step_approved")]
    StepApproved,
    #[serde(rename = "run_failed")]
    RunFailed,
}

impl LedgerAction {
    pub fn all() -> &'static [LedgerAction] {
        &[
            LedgerAction::SignalCreated,
            LedgerAction::ProposalCreated,
            LedgerAction::ProposalValidated,
            LedgerAction::ProposalApproved,
            LedgerAction::PackApplied,
            LedgerAction::PackRolledBack,
            LedgerAction::RunStarted,
            LedgerAction::RunCompleted,
            LedgerAction::RiskGateForced,
            LedgerAction::StepApproved,
            LedgerAction::RunFailed,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LedgerAction::SignalCreated => "SIGNAL_CREATED",
            LedgerAction::ProposalCreated => "PROPOSAL_CREATED",
            LedgerAction::ProposalValidated => "PROPOSAL_VALIDATED",
            LedgerAction::ProposalApproved => "PROPOSAL_APPROVED",
            LedgerAction::PackApplied => "PACK_APPLIED",
            LedgerAction::PackRolledBack => "PACK_ROLLED_BACK",
            LedgerAction::RunStarted => "run_started",
            LedgerAction::RunCompleted => "run_completed",
            LedgerAction::RiskGateForced => "risk_gate_forced",
            LedgerAction::StepApproved => "step_approved",
            LedgerAction::RunFailed => "run_failed",
        }
    }
}

impl fmt::Display for LedgerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LedgerAction {
    type Err = AttestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        LedgerAction::all()
            .iter()
            .copied()
            .find(|a| a.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| AttestError::InvalidInput(format!("unknown ledger action '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// LedgerEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub ledger_seq: u64,
    pub timestamp_utc: String,
    pub action: LedgerAction,
    pub actor: String,
    pub target_artifact_id: String,
    pub evidence_ref: Option<String>,
    pub decision_metadata: Map<String, Value>,
    pub previous_entry_hash: String,
    pub integrity_hash: String,
}

impl LedgerEntry {
    /// Typed view of `decision_metadata`.
    pub fn decision(&self) -> Result<Decision> {
        Decision::from_metadata(self.action, &self.decision_metadata)
    }
}

// ---------------------------------------------------------------------------
// LedgerError
// ---------------------------------------------------------------------------

/// First defect found while reading the chain. Line numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("line {line}: malformed entry: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("line {line}: sequence gap, expected ledger_seq {expected}, found {found}")]
    SequenceGap {
        line: usize,
        expected: u64,
        found: u64,
    },

    #[error("line {line}: broken chain, previous_entry_hash {found} does not match {expected}")]
    BrokenLink {
        line: usize,
        expected: String,
        found: String,
    },

    #[error("line {line}: integrity_hash mismatch, entry was modified")]
    Tampered { line: usize },
}

impl LedgerError {
    pub fn line(&self) -> usize {
        match self {
            LedgerError::Malformed { line, .. }
            | LedgerError::SequenceGap { line, .. }
            | LedgerError::BrokenLink { line, .. }
            | LedgerError::Tampered { line } => *line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub entries: u64,
    pub last_hash: String,
}

// ---------------------------------------------------------------------------
// LedgerLock
// ---------------------------------------------------------------------------

/// Exclusive writer lock held for the read-last-line-then-append section.
/// Released when dropped. The file records the holder's pid so a lock left
/// behind by a writer that died can be taken over.
#[derive(Debug)]
pub struct LedgerLock {
    path: PathBuf,
}

/// Result of [`LedgerLock::unlock`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnlockOutcome {
    NotLocked,
    Removed { pid: Option<u32> },
}

impl LedgerLock {
    pub fn path_for(ledger_path: &Path) -> PathBuf {
        let mut name = ledger_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn acquire(ledger_path: &Path) -> Result<Self> {
        let path = Self::path_for(ledger_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match Self::create(&path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() != std::io::ErrorKind::AlreadyExists => return Err(e.into()),
            Err(_) => {}
        }
        if !break_stale(&path)? {
            return Err(AttestError::LedgerBusy(path.display().to_string()));
        }
        match Self::create(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(AttestError::LedgerBusy(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a leftover lock file. Without `force` only a lock whose
    /// writer process is gone is removed; a live holder reports busy.
    pub fn unlock(ledger_path: &Path, force: bool) -> Result<UnlockOutcome> {
        let path = Self::path_for(ledger_path);
        if !path.exists() {
            return Ok(UnlockOutcome::NotLocked);
        }
        let pid = holder_pid(&path);
        if !force && pid.is_none_or(pid_alive) {
            return Err(AttestError::LedgerBusy(path.display().to_string()));
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(UnlockOutcome::NotLocked),
            Err(e) => return Err(e.into()),
        }
        tracing::warn!(path = %path.display(), ?pid, force, "ledger lock removed");
        Ok(UnlockOutcome::Removed { pid })
    }

    fn create(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let lock = Self {
            path: path.to_path_buf(),
        };
        writeln!(file, "pid={}", std::process::id())?;
        file.sync_all()?;
        Ok(lock)
    }
}

/// Move aside a lock whose recorded writer is no longer running. Returns
/// `true` when the lock path is free to be created again.
fn break_stale(path: &Path) -> Result<bool> {
    let Some(pid) = holder_pid(path) else {
        return Ok(false);
    };
    if pid_alive(pid) {
        return Ok(false);
    }
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(".stale-{}", uuid::Uuid::new_v4().simple()));
    let aside = PathBuf::from(aside);
    match std::fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    }
    // Another writer may have replaced the stale lock between the read and
    // the rename. Put its lock back without clobbering.
    if holder_pid(&aside) != Some(pid) {
        let restored = std::fs::hard_link(&aside, path);
        std::fs::remove_file(&aside)?;
        if let Err(e) = restored {
            tracing::warn!(path = %path.display(), error = %e, "could not restore moved ledger lock");
        }
        return Ok(false);
    }
    std::fs::remove_file(&aside)?;
    tracing::warn!(path = %path.display(), pid, "took over ledger lock from a writer that is gone");
    Ok(true)
}

fn holder_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .lines()
        .find_map(|line| line.trim().strip_prefix("pid="))?
        .parse()
        .ok()
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    pid == std::process::id() || Path::new("/proc").join(pid.to_string()).exists()
}

// Without a process table to consult every recorded holder counts as live.
#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    true
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release ledger lock");
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_root(root: &Path) -> Self {
        Self::open(paths::ledger_path(root))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry chained onto the current tail.
    pub fn append(
        &self,
        actor: &str,
        target_artifact_id: &str,
        evidence_ref: Option<&str>,
        decision: &Decision,
    ) -> Result<LedgerEntry> {
        if actor.trim().is_empty() {
            return Err(AttestError::InvalidInput("actor must not be empty".into()));
        }
        if target_artifact_id.trim().is_empty() {
            return Err(AttestError::InvalidInput(
                "target_artifact_id must not be empty".into(),
            ));
        }
        decision.validate()?;
        let decision_metadata = decision.to_metadata()?;

        let _lock = LedgerLock::acquire(&self.path)?;
        let (prev_seq, prev_hash) = self.tail()?;

        let mut entry = LedgerEntry {
            ledger_seq: prev_seq + 1,
            timestamp_utc: utc_timestamp(),
            action: decision.action(),
            actor: actor.to_string(),
            target_artifact_id: target_artifact_id.to_string(),
            evidence_ref: evidence_ref.map(str::to_string),
            decision_metadata,
            previous_entry_hash: prev_hash,
            integrity_hash: String::new(),
        };
        let value = serde_json::to_value(&entry)?;
        entry.integrity_hash = canonical_hash_excluding(&value, "integrity_hash");

        let line = serde_json::to_string(&entry)?;
        io::append_line(&self.path, &line)?;
        tracing::debug!(
            seq = entry.ledger_seq,
            action = %entry.action,
            target = %entry.target_artifact_id,
            "ledger entry appended"
        );
        Ok(entry)
    }

    /// Walk the chain from the first line and stop at the first defect.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut expected_seq = 1u64;
        let mut expected_prev = GENESIS_HASH.to_string();
        for (line_no, raw) in self.read_lines()? {
            let (value, entry) = parse_line(line_no, &raw)?;
            if entry.ledger_seq != expected_seq {
                return Err(LedgerError::SequenceGap {
                    line: line_no,
                    expected: expected_seq,
                    found: entry.ledger_seq,
                }
                .into());
            }
            if entry.previous_entry_hash != expected_prev {
                return Err(LedgerError::BrokenLink {
                    line: line_no,
                    expected: expected_prev,
                    found: entry.previous_entry_hash,
                }
                .into());
            }
            if canonical_hash_excluding(&value, "integrity_hash") != entry.integrity_hash {
                return Err(LedgerError::Tampered { line: line_no }.into());
            }
            expected_seq += 1;
            expected_prev = entry.integrity_hash;
        }
        Ok(VerifyReport {
            entries: expected_seq - 1,
            last_hash: expected_prev,
        })
    }

    /// Every entry in file order. Does not check the chain; call
    /// [`Ledger::verify`] for that.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        self.read_lines()?
            .into_iter()
            .map(|(line_no, raw)| {
                parse_line(line_no, &raw)
                    .map(|(_, e)| e)
                    .map_err(AttestError::from)
            })
            .collect()
    }

    /// Most recent entry with `action` whose `evidence_ref` equals
    /// `evidence_ref`.
    pub fn find_latest(
        &self,
        action: LedgerAction,
        evidence_ref: Option<&str>,
    ) -> Result<Option<LedgerEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .rev()
            .find(|e| e.action == action && e.evidence_ref.as_deref() == evidence_ref))
    }

    fn tail(&self) -> Result<(u64, String)> {
        match self.read_lines()?.pop() {
            Some((line_no, raw)) => {
                let (_, last) = parse_line(line_no, &raw)?;
                Ok((last.ledger_seq, last.integrity_hash))
            }
            None => Ok((0, GENESIS_HASH.to_string())),
        }
    }

    fn read_lines(&self) -> Result<Vec<(usize, String)>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(content
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .map(|(i, l)| (i + 1, l.to_string()))
            .collect())
    }
}

fn parse_line(line_no: usize, raw: &str) -> std::result::Result<(Value, LedgerEntry), LedgerError> {
    let malformed = |e: serde_json::Error| LedgerError::Malformed {
        line: line_no,
        reason: e.to_string(),
    };
    let value: Value = serde_json::from_str(raw).map_err(malformed)?;
    let entry: LedgerEntry = serde_json::from_value(value.clone()).map_err(malformed)?;
    Ok((value, entry))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
