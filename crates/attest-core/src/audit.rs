//! Run-level audit summary rebuilt from the ledger.

use crate::decision::Decision;
use crate::error::{AttestError, Result};
use crate::gate::RISK_OVERRIDE_REASON;
use crate::ledger::Ledger;
use crate::types::{ApprovalMode, ApprovalSource, GateType};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndState {
    Completed,
    Rejected,
    InProgress,
}

impl EndState {
    pub fn as_str(self) -> &'static str {
        match self {
            EndState::Completed => "completed",
            EndState::Rejected => "rejected",
            EndState::InProgress => "in_progress",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunMetadata {
    pub started_at_utc: Option<String>,
    pub governance_profile: Option<String>,
    pub auto_approve: bool,
    pub approval_source: Option<ApprovalSource>,
    pub risk_escalation_enabled: bool,
    pub risk_auto_override_default: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseGateSummary {
    pub step_idx: u32,
    pub agent_name: String,
    /// `None` when the gate was rejected.
    pub approval_mode: Option<ApprovalMode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskGateSummary {
    pub step_idx: u32,
    pub agent_name: String,
    pub gate_reason: String,
    pub approval_mode: Option<ApprovalMode>,
    /// Auto-approved through the risk override.
    pub overridden: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApprovalCounts {
    pub manual: u32,
    pub auto: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub run_metadata: RunMetadata,
    pub phase_gates: Vec<PhaseGateSummary>,
    pub risk_gates: Vec<RiskGateSummary>,
    pub approvals: ApprovalCounts,
    pub end_state: EndState,
    pub failure_reason: Option<String>,
    pub steps_completed: Option<u32>,
}

/// Aggregate every ledger entry that targets `run_id`. The chain is verified
/// first; a broken ledger yields no summary.
pub fn summarize_run(ledger: &Ledger, run_id: &str) -> Result<RunSummary> {
    ledger.verify()?;
    let entries: Vec<_> = ledger
        .entries()?
        .into_iter()
        .filter(|e| e.target_artifact_id == run_id)
        .collect();
    if entries.is_empty() {
        return Err(AttestError::RunNotFound(run_id.to_string()));
    }

    let mut summary = RunSummary {
        run_id: run_id.to_string(),
        run_metadata: RunMetadata::default(),
        phase_gates: Vec::new(),
        risk_gates: Vec::new(),
        approvals: ApprovalCounts::default(),
        end_state: EndState::InProgress,
        failure_reason: None,
        steps_completed: None,
    };

    for entry in &entries {
        match entry.decision()? {
            Decision::RunStarted(d) => {
                summary.run_metadata = RunMetadata {
                    started_at_utc: Some(entry.timestamp_utc.clone()),
                    governance_profile: d.governance_profile,
                    auto_approve: d.auto_approve,
                    approval_source: d.approval_source,
                    risk_escalation_enabled: d.risk_escalation_enabled,
                    risk_auto_override_default: Some(d.risk_auto_override_default),
                };
            }
            Decision::RiskGateForced(d) => summary.risk_gates.push(RiskGateSummary {
                step_idx: d.gate.step_idx,
                agent_name: d.gate.agent_name,
                gate_reason: d.gate.gate_reason,
                approval_mode: None,
                overridden: false,
            }),
            Decision::StepApproved(d) => {
                match d.approval_mode {
                    ApprovalMode::Auto => summary.approvals.auto += 1,
                    ApprovalMode::Manual => summary.approvals.manual += 1,
                }
                match d.gate.gate_type {
                    GateType::PhaseGate => summary.phase_gates.push(PhaseGateSummary {
                        step_idx: d.gate.step_idx,
                        agent_name: d.gate.agent_name,
                        approval_mode: Some(d.approval_mode),
                    }),
                    GateType::RiskGate => {
                        if let Some(risk) = last_risk_gate(&mut summary.risk_gates, d.gate.step_idx)
                        {
                            risk.approval_mode = Some(d.approval_mode);
                            risk.overridden = d.approval_mode == ApprovalMode::Auto
                                && d.approval_reason.as_deref() == Some(RISK_OVERRIDE_REASON);
                        }
                    }
                }
            }
            Decision::RunFailed(d) => {
                if d.gate.gate_type == GateType::PhaseGate {
                    summary.phase_gates.push(PhaseGateSummary {
                        step_idx: d.gate.step_idx,
                        agent_name: d.gate.agent_name,
                        approval_mode: None,
                    });
                }
                summary.end_state = EndState::Rejected;
                summary.failure_reason = Some(d.reason);
            }
            Decision::RunCompleted(d) => {
                summary.end_state = EndState::Completed;
                summary.steps_completed = Some(d.steps_completed);
            }
            _ => {}
        }
    }
    Ok(summary)
}

fn last_risk_gate(gates: &mut [RiskGateSummary], step_idx: u32) -> Option<&mut RiskGateSummary> {
    gates
        .iter_mut()
        .rev()
        .find(|g| g.step_idx == step_idx && g.approval_mode.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gate::{ApprovalPrompt, AutoApprove, GateController, GatePolicy, PromptRequest, StepReport};
    use tempfile::TempDir;

    struct Always(&'static str);

    impl ApprovalPrompt for Always {
        fn ask(&mut self, _request: &PromptRequest) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn step(idx: u32, questions: &[&str]) -> StepReport {
        StepReport {
            step_idx: idx,
            agent_name: format!("agent_{idx}"),
            open_questions: questions.iter().map(|s| s.to_string()).collect(),
            ..StepReport::default()
        }
    }

    fn controller(dir: &TempDir, run_id: &str, auto: AutoApprove) -> GateController {
        let mut policy = GatePolicy::from_config(&Config::new("demo"), None);
        policy.risk.enabled = true;
        policy.risk.open_questions_threshold = 2;
        GateController::new(Ledger::for_root(dir.path()), run_id, "driver", policy, auto).unwrap()
    }

    #[test]
    fn completed_run_summary() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, "run-a", AutoApprove::resolve(true, None));
        c.start_run().unwrap();
        let mut prompt = Always("APPROVE");
        c.on_step_completed(&step(1, &["a?", "b?"]), &mut prompt).unwrap();
        c.on_step_completed(&step(2, &[]), &mut prompt).unwrap();
        c.on_step_completed(&step(3, &[]), &mut prompt).unwrap();
        c.complete_run(3).unwrap();

        let s = summarize_run(&Ledger::for_root(dir.path()), "run-a").unwrap();
        assert_eq!(s.end_state, EndState::Completed);
        assert_eq!(s.steps_completed, Some(3));
        assert_eq!(s.approvals, ApprovalCounts { manual: 0, auto: 2 });
        assert_eq!(s.phase_gates.len(), 1);
        assert_eq!(s.phase_gates[0].step_idx, 3);
        assert_eq!(s.risk_gates.len(), 1);
        assert!(s.risk_gates[0].overridden);
        assert_eq!(s.risk_gates[0].gate_reason, "open_questions_threshold");
        assert!(s.run_metadata.auto_approve);
        assert_eq!(s.run_metadata.approval_source, Some(ApprovalSource::CliFlag));
    }

    #[test]
    fn rejected_run_summary_ignores_other_runs() {
        let dir = TempDir::new().unwrap();
        let other = controller(&dir, "run-b", AutoApprove::off());
        other.start_run().unwrap();

        let c = controller(&dir, "run-c", AutoApprove::off());
        c.start_run().unwrap();
        let err = c
            .on_step_completed(&step(3, &[]), &mut Always("stop"))
            .unwrap_err();
        assert!(matches!(err, AttestError::ApprovalRejected { .. }));

        let s = summarize_run(&Ledger::for_root(dir.path()), "run-c").unwrap();
        assert_eq!(s.end_state, EndState::Rejected);
        assert_eq!(s.failure_reason.as_deref(), Some("approval_rejected"));
        assert_eq!(s.phase_gates[0].approval_mode, None);

        let b = summarize_run(&Ledger::for_root(dir.path()), "run-b").unwrap();
        assert_eq!(b.end_state, EndState::InProgress);
    }

    #[test]
    fn unknown_run_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = summarize_run(&Ledger::for_root(dir.path()), "run-z").unwrap_err();
        assert!(matches!(err, AttestError::RunNotFound(_)));
    }
}
