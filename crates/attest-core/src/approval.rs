//! Signal → Proposal → Validation → Approval workflow.
//!
//! Every record is immutable and read-only on disk. A proposal's state is
//! never stored; [`status`] derives it from the validation and approval
//! records that reference the proposal.

use crate::config::ApproversConfig;
use crate::decision::{
    Decision, ProposalApproved, ProposalCreated, ProposalValidated, SignalCreated,
};
use crate::error::{AttestError, Result};
use crate::hashing::{canonical_hash_excluding, utc_timestamp_precise};
use crate::io;
use crate::ledger::{Ledger, LedgerAction, LedgerEntry};
use crate::paths;
use crate::types::{RiskLevel, ValidationOutcome};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

const SCHEMA_VERSION: &str = "1.0.0";
const SUMMARY_MAX_CHARS: usize = 200;

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    PilotFeedback,
    OperatorObservation,
    AutomatedScorer,
    SystemError,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::PilotFeedback => "pilot_feedback",
            SourceType::OperatorObservation => "operator_observation",
            SourceType::AutomatedScorer => "automated_scorer",
            SourceType::SystemError => "system_error",
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = AttestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pilot_feedback" => Ok(SourceType::PilotFeedback),
            "operator_observation" => Ok(SourceType::OperatorObservation),
            "automated_scorer" => Ok(SourceType::AutomatedScorer),
            "system_error" => Ok(SourceType::SystemError),
            _ => Err(AttestError::InvalidInput(format!(
                "unknown source type '{s}': must be pilot_feedback, operator_observation, automated_scorer, or system_error"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Complaint,
    Observation,
    FeatureRequest,
    BugReport,
}

impl SignalType {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Complaint => "complaint",
            SignalType::Observation => "observation",
            SignalType::FeatureRequest => "feature_request",
            SignalType::BugReport => "bug_report",
        }
    }
}

impl std::str::FromStr for SignalType {
    type Err = AttestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "complaint" => Ok(SignalType::Complaint),
            "observation" => Ok(SignalType::Observation),
            "feature_request" => Ok(SignalType::FeatureRequest),
            "bug_report" => Ok(SignalType::BugReport),
            _ => Err(AttestError::InvalidInput(format!(
                "unknown signal type '{s}': must be complaint, observation, feature_request, or bug_report"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSource {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub origin_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalContent {
    pub summary: String,
    pub details: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_artifacts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub governance_id: String,
    pub schema_version: String,
    pub created_at_utc: String,
    pub source: SignalSource,
    pub signal_type: SignalType,
    pub content: SignalContent,
    pub tenant_context: TenantContext,
    pub pii_scrubbed: bool,
}

impl Signal {
    pub fn load(root: &Path, id: &str) -> Result<Self> {
        paths::validate_id(id)?;
        let path = paths::signal_path(root, id);
        if !path.exists() {
            return Err(AttestError::SignalNotFound(id.to_string()));
        }
        read_json(&path)
    }
}

/// Input for [`create_signal`].
#[derive(Debug, Clone)]
pub struct NewSignal {
    pub source_type: SourceType,
    pub origin_id: String,
    pub signal_type: SignalType,
    pub summary: String,
    pub details: String,
    pub affected_artifacts: Vec<String>,
    pub tenant_id: String,
    pub course_id: Option<String>,
}

pub fn create_signal(root: &Path, input: &NewSignal) -> Result<(Signal, LedgerEntry)> {
    require_non_empty("origin id", &input.origin_id)?;
    require_non_empty("summary", &input.summary)?;
    require_non_empty("details", &input.details)?;
    require_non_empty("tenant id", &input.tenant_id)?;
    let summary_len = input.summary.chars().count();
    if summary_len > SUMMARY_MAX_CHARS {
        return Err(AttestError::InvalidInput(format!(
            "summary is {summary_len} characters, the limit is {SUMMARY_MAX_CHARS}"
        )));
    }

    let signal = Signal {
        governance_id: uuid::Uuid::new_v4().to_string(),
        schema_version: SCHEMA_VERSION.to_string(),
        created_at_utc: utc_timestamp_precise(),
        source: SignalSource {
            source_type: input.source_type,
            origin_id: input.origin_id.clone(),
        },
        signal_type: input.signal_type,
        content: SignalContent {
            summary: input.summary.clone(),
            details: input.details.clone(),
            affected_artifacts: input.affected_artifacts.clone(),
        },
        tenant_context: TenantContext {
            tenant_id: input.tenant_id.clone(),
            course_id: input.course_id.clone(),
        },
        pii_scrubbed: true,
    };

    let path = paths::signal_path(root, &signal.governance_id);
    let evidence = paths::display_relative(root, &path);
    let decision = Decision::SignalCreated(SignalCreated {
        signal_type: input.signal_type.as_str().to_string(),
        source_type: input.source_type.as_str().to_string(),
    });
    let entry = write_then_log(&path, &signal, "signal create", || {
        Ledger::for_root(root).append(
            &signal.source.origin_id,
            &signal.governance_id,
            Some(&evidence),
            &decision,
        )
    })?;
    Ok((signal, entry))
}

// ---------------------------------------------------------------------------
// Proposal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetComponent {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub version_constraint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeIntent {
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub proposed_modification: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    #[serde(default)]
    pub risk_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub governance_id: String,
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub created_at_utc: String,
    #[serde(default)]
    pub author_id: String,
    #[serde(default)]
    pub linked_signal_ids: Vec<String>,
    #[serde(default)]
    pub target_component: TargetComponent,
    #[serde(default)]
    pub change_intent: ChangeIntent,
    /// Kept as a string so an unrecognised level reaches the authority
    /// check and is refused there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<RiskAssessment>,
    #[serde(default = "default_governance_state")]
    pub governance_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_proposal_id: Option<String>,
}

fn default_governance_state() -> String {
    "DRAFT".to_string()
}

impl Proposal {
    pub fn load(root: &Path, id: &str) -> Result<Self> {
        paths::validate_id(id)?;
        let path = paths::proposal_path(root, id);
        if !path.exists() {
            return Err(AttestError::ProposalNotFound(id.to_string()));
        }
        let data = std::fs::read_to_string(&path)?;
        serde_json::from_str(&data).map_err(|e| AttestError::ProposalCorrupt {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    /// `risk_level`, else `risk_assessment.risk_level`, else `LOW`.
    pub fn effective_risk_level(&self) -> String {
        self.risk_level
            .clone()
            .or_else(|| {
                self.risk_assessment
                    .as_ref()
                    .and_then(|r| r.risk_level.clone())
            })
            .unwrap_or_else(|| RiskLevel::Low.as_str().to_string())
    }
}

/// Input for [`create_proposal`].
#[derive(Debug, Clone)]
pub struct NewProposal {
    pub signal_ids: Vec<String>,
    pub author_id: String,
    pub target_path: String,
    pub version_constraint: String,
    pub rationale: String,
    pub proposed_modification: String,
    pub risk_level: RiskLevel,
    pub parent_proposal_id: Option<String>,
}

pub fn create_proposal(root: &Path, input: &NewProposal) -> Result<(Proposal, LedgerEntry)> {
    require_non_empty("author id", &input.author_id)?;
    if input.signal_ids.is_empty() {
        return Err(AttestError::InvalidInput(
            "a proposal must link at least one signal".into(),
        ));
    }
    if let Some(parent) = &input.parent_proposal_id {
        paths::validate_id(parent)?;
    }

    let mut tenant: Option<String> = None;
    for id in &input.signal_ids {
        let signal = Signal::load(root, id)?;
        match &tenant {
            None => tenant = Some(signal.tenant_context.tenant_id),
            Some(t) if *t != signal.tenant_context.tenant_id => {
                return Err(AttestError::blocked(format!(
                    "mixed tenant contexts across signals ('{t}' and '{}')",
                    signal.tenant_context.tenant_id
                )));
            }
            Some(_) => {}
        }
    }
    let tenant_id = tenant.unwrap_or_default();

    let proposal = Proposal {
        governance_id: uuid::Uuid::new_v4().to_string(),
        schema_version: SCHEMA_VERSION.to_string(),
        created_at_utc: utc_timestamp_precise(),
        author_id: input.author_id.clone(),
        linked_signal_ids: input.signal_ids.clone(),
        target_component: TargetComponent {
            path: input.target_path.clone(),
            version_constraint: input.version_constraint.clone(),
        },
        change_intent: ChangeIntent {
            rationale: input.rationale.clone(),
            proposed_modification: input.proposed_modification.clone(),
        },
        risk_level: Some(input.risk_level.as_str().to_string()),
        risk_assessment: None,
        governance_state: default_governance_state(),
        parent_proposal_id: input.parent_proposal_id.clone(),
    };

    let path = paths::proposal_path(root, &proposal.governance_id);
    let evidence = paths::display_relative(root, &path);
    let decision = Decision::ProposalCreated(ProposalCreated {
        risk_level: input.risk_level,
        linked_signal_count: input.signal_ids.len(),
        tenant_id_context: tenant_id,
    });
    let entry = write_then_log(&path, &proposal, "proposal create", || {
        Ledger::for_root(root).append(
            &proposal.author_id,
            &proposal.governance_id,
            Some(&evidence),
            &decision,
        )
    })?;
    Ok((proposal, entry))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub governance_id: String,
    #[serde(default)]
    pub schema_version: String,
    pub created_at_utc: String,
    pub proposal_id: String,
    #[serde(default)]
    pub validator_id: String,
    /// Raw outcome; anything other than `PASS` blocks approval.
    pub validation_outcome: String,
    #[serde(default)]
    pub summary: String,
    /// SHA-256 of this record without the hash itself. Absent on records
    /// written before the hash was captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl Validation {
    pub fn outcome(&self) -> Option<ValidationOutcome> {
        self.validation_outcome.parse().ok()
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at_utc)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

pub fn record_validation(
    root: &Path,
    proposal_id: &str,
    outcome: ValidationOutcome,
    actor: &str,
    summary: &str,
) -> Result<(Validation, LedgerEntry)> {
    require_non_empty("actor", actor)?;
    Proposal::load(root, proposal_id)?;

    let mut validation = Validation {
        governance_id: uuid::Uuid::new_v4().to_string(),
        schema_version: SCHEMA_VERSION.to_string(),
        created_at_utc: utc_timestamp_precise(),
        proposal_id: proposal_id.to_string(),
        validator_id: actor.to_string(),
        validation_outcome: outcome.as_str().to_string(),
        summary: summary.to_string(),
        content_hash: None,
    };
    let content_hash =
        canonical_hash_excluding(&serde_json::to_value(&validation)?, "content_hash");
    validation.content_hash = Some(content_hash.clone());

    let path = paths::validation_path(root, &validation.governance_id);
    let decision = Decision::ProposalValidated(ProposalValidated {
        validation_outcome: outcome,
        content_hash,
    });
    let entry = write_then_log(&path, &validation, "proposal validate", || {
        Ledger::for_root(root).append(
            actor,
            proposal_id,
            Some(&validation.governance_id),
            &decision,
        )
    })?;
    Ok((validation, entry))
}

/// Validations for a proposal, newest first.
pub fn validations_for(root: &Path, proposal_id: &str) -> Result<Vec<Validation>> {
    let mut found: Vec<Validation> = load_records(&root.join(paths::VALIDATIONS_DIR))?
        .into_iter()
        .filter(|v: &Validation| v.proposal_id == proposal_id)
        .collect();
    found.sort_by(|a, b| {
        b.created_at()
            .cmp(&a.created_at())
            .then_with(|| b.created_at_utc.cmp(&a.created_at_utc))
    });
    Ok(found)
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub approval_id: String,
    pub schema_version: String,
    pub created_at_utc: String,
    pub proposal_id: String,
    pub approver_id: String,
    pub risk_level_at_approval: String,
    pub notes: Option<String>,
    pub validation_ref: String,
}

pub fn approvals_for(root: &Path, proposal_id: &str) -> Result<Vec<Approval>> {
    let mut found: Vec<Approval> = load_records(&root.join(paths::APPROVALS_DIR))?
        .into_iter()
        .filter(|a: &Approval| a.proposal_id == proposal_id)
        .collect();
    found.sort_by(|a, b| a.created_at_utc.cmp(&b.created_at_utc));
    Ok(found)
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalOutcome {
    pub approval: Approval,
    pub approval_count: u32,
    pub required_approvals: u32,
    pub fully_approved: bool,
    pub ledger_seq: u64,
}

/// Record one approval.
///
/// Checks run in a fixed order and stop at the first failure: the proposal
/// loads, a validation exists, the newest validation passed, the actor
/// holds authority for the risk level, and the actor has not approved
/// before. Nothing is written until all of them pass.
pub fn approve(
    root: &Path,
    approvers: &ApproversConfig,
    proposal_id: &str,
    actor_id: &str,
    notes: Option<&str>,
) -> Result<ApprovalOutcome> {
    require_non_empty("actor id", actor_id)?;
    let proposal = Proposal::load(root, proposal_id)?;
    let risk_level = proposal.effective_risk_level();

    let validations = validations_for(root, proposal_id)?;
    let latest = validations.first().ok_or_else(|| {
        AttestError::blocked(format!("no validation evidence found for {proposal_id}"))
    })?;
    if latest.outcome() != Some(ValidationOutcome::Pass) {
        return Err(AttestError::blocked(format!(
            "most recent validation is {}",
            latest.validation_outcome
        )));
    }

    if !approvers.is_authorized(actor_id, &risk_level) {
        return Err(AttestError::blocked(format!(
            "actor {actor_id} not authorized for {risk_level} risk"
        )));
    }
    // Authorised implies a recognised level.
    let level: RiskLevel = risk_level.parse()?;

    let existing = approvals_for(root, proposal_id)?;
    if existing.iter().any(|a| a.approver_id == actor_id) {
        return Err(AttestError::blocked(format!(
            "actor {actor_id} already approved this proposal"
        )));
    }

    let ledger = Ledger::for_root(root);
    ledger.verify()?;

    let approval_count = existing.len() as u32 + 1;
    let required_approvals = level.required_approvals();
    let fully_approved = approval_count >= required_approvals;
    let content_hash = validation_content_hash(&ledger, latest)?;

    let approval = Approval {
        approval_id: uuid::Uuid::new_v4().to_string(),
        schema_version: SCHEMA_VERSION.to_string(),
        created_at_utc: utc_timestamp_precise(),
        proposal_id: proposal_id.to_string(),
        approver_id: actor_id.to_string(),
        risk_level_at_approval: risk_level,
        notes: notes.map(str::to_string),
        validation_ref: latest.governance_id.clone(),
    };
    let decision = Decision::ProposalApproved(ProposalApproved {
        risk_level: level,
        approval_count_current: approval_count,
        required_approval_count: required_approvals,
        latest_validation_status_internal: ValidationOutcome::Pass,
        latest_validation_content_hash: content_hash,
        fully_approved,
    });

    let path = paths::approval_path(root, &approval.approval_id);
    let entry = write_then_log(&path, &approval, "proposal approve", || {
        ledger.append(actor_id, proposal_id, Some(&approval.approval_id), &decision)
    })?;
    Ok(ApprovalOutcome {
        approval,
        approval_count,
        required_approvals,
        fully_approved,
        ledger_seq: entry.ledger_seq,
    })
}

/// The hash on the record, else the one logged with it, else `UNKNOWN`.
fn validation_content_hash(ledger: &Ledger, validation: &Validation) -> Result<String> {
    if let Some(hash) = &validation.content_hash {
        return Ok(hash.clone());
    }
    let logged = ledger
        .find_latest(
            LedgerAction::ProposalValidated,
            Some(&validation.governance_id),
        )?
        .and_then(|e| {
            e.decision_metadata
                .get("content_hash")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });
    Ok(logged.unwrap_or_else(|| "UNKNOWN".to_string()))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalState {
    Draft,
    ValidationPending,
    ValidatedFail,
    ValidatedPass,
    ApprovedPartial,
    ApprovedFull,
}

impl ProposalState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalState::Draft => "DRAFT",
            ProposalState::ValidationPending => "VALIDATION_PENDING",
            ProposalState::ValidatedFail => "VALIDATED_FAIL",
            ProposalState::ValidatedPass => "VALIDATED_PASS",
            ProposalState::ApprovedPartial => "APPROVED_PARTIAL",
            ProposalState::ApprovedFull => "APPROVED_FULL",
        }
    }
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposalStatus {
    pub proposal_id: String,
    pub risk_level: String,
    pub state: ProposalState,
    pub latest_validation: Option<String>,
    pub validation_count: usize,
    pub approval_count: usize,
    pub required_approvals: u32,
    pub approvers: Vec<String>,
}

pub fn status(root: &Path, proposal_id: &str) -> Result<ProposalStatus> {
    let proposal = Proposal::load(root, proposal_id)?;
    let risk_level = proposal.effective_risk_level();
    let required_approvals = risk_level
        .parse::<RiskLevel>()
        .map(RiskLevel::required_approvals)
        .unwrap_or(RiskLevel::High.required_approvals());
    let validations = validations_for(root, proposal_id)?;
    let approvals = approvals_for(root, proposal_id)?;

    let latest = validations.first();
    let state = match latest.map(Validation::outcome) {
        None => ProposalState::Draft,
        Some(Some(ValidationOutcome::Pass)) => {
            if approvals.is_empty() {
                ProposalState::ValidatedPass
            } else if (approvals.len() as u32) < required_approvals {
                ProposalState::ApprovedPartial
            } else {
                ProposalState::ApprovedFull
            }
        }
        Some(Some(ValidationOutcome::Fail | ValidationOutcome::Regression)) => {
            ProposalState::ValidatedFail
        }
        Some(Some(ValidationOutcome::Error) | None) => ProposalState::ValidationPending,
    };

    Ok(ProposalStatus {
        proposal_id: proposal_id.to_string(),
        risk_level,
        state,
        latest_validation: latest.map(|v| v.validation_outcome.clone()),
        validation_count: validations.len(),
        approval_count: approvals.len(),
        required_approvals,
        approvers: approvals.into_iter().map(|a| a.approver_id).collect(),
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Write an immutable record, then log it. A failed ledger append removes
/// the record again so no record exists without its ledger entry.
fn write_then_log<T: Serialize>(
    path: &Path,
    record: &T,
    operation: &str,
    log: impl FnOnce() -> Result<LedgerEntry>,
) -> Result<LedgerEntry> {
    io::write_immutable(path, record)?;
    let err = match log() {
        Ok(entry) => return Ok(entry),
        Err(e) => e,
    };
    tracing::warn!(
        operation,
        path = %path.display(),
        error = %err,
        "ledger append failed, removing record"
    );
    match io::remove_immutable(path) {
        Ok(()) => Err(AttestError::Operational {
            operation: operation.to_string(),
            reason: err.to_string(),
            compensation: format!("removed {}", path.display()),
        }),
        Err(comp) => {
            tracing::error!(
                operation,
                path = %path.display(),
                error = %comp,
                "compensation failed, record exists without ledger entry"
            );
            Err(AttestError::Critical {
                operation: operation.to_string(),
                reason: err.to_string(),
                compensation_error: comp.to_string(),
            })
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// Parse every record in `dir`; unreadable files are skipped with a warning.
fn load_records<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for path in io::list_json_files(dir)? {
        match read_json(&path) {
            Ok(record) => out.push(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record")
            }
        }
    }
    Ok(out)
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AttestError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
