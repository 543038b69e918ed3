//! Typed `decision_metadata` shapes, one per ledger action.
//!
//! On the wire `decision_metadata` stays a flat JSON object so older readers
//! keep working and newer writers may add keys. In memory every entry the
//! crate writes is one of the [`Decision`] variants, checked by
//! [`Decision::validate`] before it can reach the ledger.

use crate::error::{AttestError, Result};
use crate::ledger::LedgerAction;
use crate::types::{ApprovalMode, ApprovalSource, GateStrategy, GateType, RiskLevel, ValidationOutcome};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Approval workflow shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalCreated {
    pub signal_type: String,
    pub source_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalCreated {
    pub risk_level: RiskLevel,
    pub linked_signal_count: usize,
    pub tenant_id_context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalValidated {
    pub validation_outcome: ValidationOutcome,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalApproved {
    pub risk_level: RiskLevel,
    pub approval_count_current: u32,
    pub required_approval_count: u32,
    pub latest_validation_status_internal: ValidationOutcome,
    pub latest_validation_content_hash: String,
    pub fully_approved: bool,
}

// ---------------------------------------------------------------------------
// Pack lifecycle shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackApplied {
    pub manifest_hash: String,
    pub git_commit_hash: Option<String>,
    pub snapshot_ref: Option<String>,
    pub previous_pack_version: Option<String>,
    #[serde(default)]
    pub promotion_id: Option<String>,
    #[serde(default)]
    pub forced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackRolledBack {
    pub snapshot_ref: String,
    pub previous_pack_version: Option<String>,
    pub restored_pack_version: String,
    pub restored_git_commit_hash: Option<String>,
    /// Only set when the pack directory had to be restored from the source store.
    pub manifest_hash: Option<String>,
    #[serde(default)]
    pub pre_rollback_snapshot_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Gate shapes
// ---------------------------------------------------------------------------

/// Fields shared by every gate entry for one pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateFields {
    pub step_idx: u32,
    pub agent_name: String,
    pub gate_strategy: GateStrategy,
    pub gate_type: GateType,
    pub gate_reason: String,
}

/// Observed risk signals that forced a risk gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskObservation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_open_questions_count_weighted: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_open_questions_count_total: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_questions_threshold: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weighted_severities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa_critical_error_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskGateForced {
    #[serde(flatten)]
    pub gate: GateFields,
    #[serde(flatten)]
    pub observation: RiskObservation,
    pub risk_auto_override: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepApproved {
    #[serde(flatten)]
    pub gate: GateFields,
    pub approval_mode: ApprovalMode,
    pub approval_source: ApprovalSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailed {
    pub reason: String,
    #[serde(flatten)]
    pub gate: GateFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStarted {
    pub governance_profile: Option<String>,
    pub auto_approve: bool,
    pub approval_source: Option<ApprovalSource>,
    pub gate_strategy: GateStrategy,
    pub risk_escalation_enabled: bool,
    pub risk_auto_override_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCompleted {
    pub steps_completed: u32,
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    SignalCreated(SignalCreated),
    ProposalCreated(ProposalCreated),
    ProposalValidated(ProposalValidated),
    ProposalApproved(ProposalApproved),
    PackApplied(PackApplied),
    PackRolledBack(PackRolledBack),
    RunStarted(RunStarted),
    RunCompleted(RunCompleted),
    RiskGateForced(RiskGateForced),
    StepApproved(StepApproved),
    RunFailed(RunFailed),
}

impl Decision {
    pub fn action(&self) -> LedgerAction {
        match self {
            Decision::SignalCreated(_) => LedgerAction::SignalCreated,
            Decision::ProposalCreated(_) => LedgerAction::ProposalCreated,
            Decision::ProposalValidated(_) => LedgerAction::ProposalValidated,
            Decision::ProposalApproved(_) => LedgerAction::ProposalApproved,
            Decision::PackApplied(_) => LedgerAction::PackApplied,
            Decision::PackRolledBack(_) => LedgerAction::PackRolledBack,
            Decision::RunStarted(_) => LedgerAction::RunStarted,
            Decision::RunCompleted(_) => LedgerAction::RunCompleted,
            Decision::RiskGateForced(_) => LedgerAction::RiskGateForced,
            Decision::StepApproved(_) => LedgerAction::StepApproved,
            Decision::RunFailed(_) => LedgerAction::RunFailed,
        }
    }

    /// Check the invariants of each shape.
    pub fn validate(&self) -> Result<()> {
        match self {
            Decision::ProposalCreated(d) if d.linked_signal_count == 0 => {
                invalid("a proposal must reference at least one signal")
            }
            Decision::ProposalValidated(d) if !is_sha256_hex(&d.content_hash) => {
                invalid("validation content_hash must be 64 hex characters")
            }
            Decision::ProposalApproved(d) => {
                if d.approval_count_current == 0 {
                    return invalid("approval_count_current must be at least 1");
                }
                if d.required_approval_count != d.risk_level.required_approvals() {
                    return invalid("required_approval_count does not match the risk level");
                }
                if d.fully_approved != (d.approval_count_current >= d.required_approval_count) {
                    return invalid("fully_approved disagrees with the approval counts");
                }
                if d.latest_validation_status_internal != ValidationOutcome::Pass {
                    return invalid("an approval requires a PASS validation");
                }
                Ok(())
            }
            Decision::PackApplied(d) if !is_sha256_hex(&d.manifest_hash) => {
                invalid("manifest_hash must be 64 hex characters")
            }
            Decision::RiskGateForced(d) if d.gate.gate_type != GateType::RiskGate => {
                invalid("risk_gate_forced requires gate_type=risk_gate")
            }
            Decision::StepApproved(d) => match (d.approval_mode, d.approval_source) {
                (ApprovalMode::Manual, ApprovalSource::Stdin)
                | (ApprovalMode::Auto, ApprovalSource::CliFlag | ApprovalSource::Profile) => Ok(()),
                _ => invalid("approval_source does not match approval_mode"),
            },
            Decision::RunFailed(d) if d.reason.trim().is_empty() => {
                invalid("run_failed requires a reason")
            }
            _ => Ok(()),
        }
    }

    /// Flatten into the wire `decision_metadata` object.
    pub fn to_metadata(&self) -> Result<Map<String, Value>> {
        let value = match self {
            Decision::SignalCreated(d) => serde_json::to_value(d)?,
            Decision::ProposalCreated(d) => serde_json::to_value(d)?,
            Decision::ProposalValidated(d) => serde_json::to_value(d)?,
            Decision::ProposalApproved(d) => serde_json::to_value(d)?,
            Decision::PackApplied(d) => serde_json::to_value(d)?,
            Decision::PackRolledBack(d) => serde_json::to_value(d)?,
            Decision::RunStarted(d) => serde_json::to_value(d)?,
            Decision::RunCompleted(d) => serde_json::to_value(d)?,
            Decision::RiskGateForced(d) => serde_json::to_value(d)?,
            Decision::StepApproved(d) => serde_json::to_value(d)?,
            Decision::RunFailed(d) => serde_json::to_value(d)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            _ => invalid("decision metadata must serialize to an object"),
        }
    }

    /// Decode the typed shape for `action` from a wire map. Unknown keys are
    /// ignored.
    pub fn from_metadata(action: LedgerAction, metadata: &Map<String, Value>) -> Result<Decision> {
        Ok(match action {
            LedgerAction::SignalCreated => Decision::SignalCreated(decode(metadata)?),
            LedgerAction::ProposalCreated => Decision::ProposalCreated(decode(metadata)?),
            LedgerAction::ProposalValidated => Decision::ProposalValidated(decode(metadata)?),
            LedgerAction::ProposalApproved => Decision::ProposalApproved(decode(metadata)?),
            LedgerAction::PackApplied => Decision::PackApplied(decode(metadata)?),
            LedgerAction::PackRolledBack => Decision::PackRolledBack(decode(metadata)?),
            LedgerAction::RunStarted => Decision::RunStarted(decode(metadata)?),
            LedgerAction::RunCompleted => Decision::RunCompleted(decode(metadata)?),
            LedgerAction::RiskGateForced => Decision::RiskGateForced(decode(metadata)?),
            LedgerAction::StepApproved => Decision::StepApproved(decode(metadata)?),
            LedgerAction::RunFailed => Decision::RunFailed(decode(metadata)?),
        })
    }
}

fn decode<T: DeserializeOwned>(metadata: &Map<String, Value>) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(metadata.clone()))?)
}

fn invalid<T>(msg: &str) -> Result<T> {
    Err(AttestError::InvalidInput(msg.to_string()))
}

pub(crate) fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
