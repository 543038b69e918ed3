//! Per-step approval gates for a multi-step pipeline run.
//!
//! [`evaluate`] is the pure decision: static phase configuration plus the
//! risk overlay. [`GateController`] resolves a decision (auto-approve or an
//! [`ApprovalPrompt`]) and records every outcome in the ledger.

use crate::config::{Config, GovernanceProfile, RiskEscalation};
use crate::decision::{
    Decision, GateFields, RiskGateForced, RiskObservation, RunCompleted, RunFailed, RunStarted,
    StepApproved,
};
use crate::error::{AttestError, Result};
use crate::ledger::{Ledger, LedgerEntry};
use crate::paths;
use crate::types::{ApprovalMode, ApprovalSource, GateStrategy, GateType, Severity};
use serde::Serialize;

pub const ROUTINE_CHECK: &str = "routine_check";
pub const OPEN_QUESTIONS_THRESHOLD: &str = "open_questions_threshold";
pub const QA_CRITICAL: &str = "qa_critical";
pub const APPROVAL_REJECTED: &str = "approval_rejected";
pub const RISK_OVERRIDE_REASON: &str = "auto-approve override after risk gate";

// ---------------------------------------------------------------------------
// GatePolicy
// ---------------------------------------------------------------------------

/// Effective gate settings for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatePolicy {
    pub gate_strategy: GateStrategy,
    pub phase_gates: Vec<u32>,
    pub approval_token: String,
    pub risk: RiskEscalation,
}

impl GatePolicy {
    /// Config settings, with the risk block replaced when a profile is given.
    pub fn from_config(config: &Config, profile: Option<GovernanceProfile>) -> Self {
        let approval = &config.approval;
        let risk = match profile {
            Some(p) => p.risk_escalation(&approval.risk_gate_escalation),
            None => approval.risk_gate_escalation.clone(),
        };
        Self {
            gate_strategy: approval.gate_strategy,
            phase_gates: approval.phase_gates.clone(),
            approval_token: approval.require_approval_token.clone(),
            risk,
        }
    }
}

// ---------------------------------------------------------------------------
// AutoApprove
// ---------------------------------------------------------------------------

/// Whether gates auto-approve, and who turned it on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AutoApprove {
    pub enabled: bool,
    pub source: Option<ApprovalSource>,
    pub profile: Option<GovernanceProfile>,
}

impl AutoApprove {
    pub fn off() -> Self {
        Self {
            enabled: false,
            source: None,
            profile: None,
        }
    }

    /// The CLI flag wins attribution; otherwise a profile may enable it.
    pub fn resolve(cli_flag: bool, profile: Option<GovernanceProfile>) -> Self {
        if cli_flag {
            Self {
                enabled: true,
                source: Some(ApprovalSource::CliFlag),
                profile,
            }
        } else if profile.is_some_and(GovernanceProfile::auto_approve) {
            Self {
                enabled: true,
                source: Some(ApprovalSource::Profile),
                profile,
            }
        } else {
            Self {
                enabled: false,
                source: None,
                profile,
            }
        }
    }

    fn reason(&self) -> String {
        match (self.source, self.profile) {
            (Some(ApprovalSource::Profile), Some(p)) => {
                format!("Auto-approval enabled by governance profile: {p}")
            }
            _ => "Auto-approval enabled via CLI".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// What the pipeline driver reports after a step completes.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub step_idx: u32,
    pub agent_name: String,
    /// The role's `gate` flag, used by the `per_agent` strategy.
    pub agent_gate: bool,
    pub open_questions: Vec<String>,
    pub deliverable: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateDecision {
    pub gate_type: GateType,
    pub gate_reason: String,
    pub observation: RiskObservation,
}

/// Decide whether a step gates.
///
/// Labels only ever upgrade: once a risk check assigns `risk_gate`, no later
/// check can relabel the gate as `phase_gate`. Among risk checks the later
/// one supplies the reason.
pub fn evaluate(policy: &GatePolicy, step: &StepReport) -> Option<GateDecision> {
    let mut label: Option<(GateType, &'static str)> = None;
    let mut observation = RiskObservation::default();

    let static_gate = match policy.gate_strategy {
        GateStrategy::PerPhase => policy.phase_gates.contains(&step.step_idx),
        GateStrategy::PerAgent => step.agent_gate,
    };
    if static_gate {
        upgrade(&mut label, GateType::PhaseGate, ROUTINE_CHECK);
    }

    let risk = &policy.risk;
    if risk.enabled {
        let weighted = risk.weighted();
        let severities: Vec<Severity> = step
            .open_questions
            .iter()
            .map(|q| Severity::classify(q))
            .collect();

        let weighted_count = severities.iter().filter(|s| weighted.contains(s)).count();
        if weighted_count >= risk.open_questions_threshold {
            upgrade(&mut label, GateType::RiskGate, OPEN_QUESTIONS_THRESHOLD);
            observation.observed_open_questions_count_weighted = Some(weighted_count);
            observation.observed_open_questions_count_total = Some(severities.len());
            observation.open_questions_threshold = Some(risk.open_questions_threshold);
            observation.weighted_severities =
                Some(weighted.iter().map(|s| s.as_str().to_string()).collect());
        }

        let high_scrutiny = risk.high_scrutiny_roles.iter().any(|r| *r == step.agent_name);
        if risk.force_gate_on_qa_critical && high_scrutiny {
            let mut critical = severities.iter().filter(|s| s.is_critical()).count();
            if !risk.critical_marker.is_empty() && step.deliverable.contains(&risk.critical_marker)
            {
                critical = critical.max(1);
            }
            if critical > 0 {
                upgrade(&mut label, GateType::RiskGate, QA_CRITICAL);
                observation.qa_critical_error_count = Some(critical);
            }
        }
    }

    label.map(|(gate_type, reason)| GateDecision {
        gate_type,
        gate_reason: reason.to_string(),
        observation,
    })
}

fn upgrade(label: &mut Option<(GateType, &'static str)>, gate_type: GateType, reason: &'static str) {
    match label {
        Some((current, _)) if *current > gate_type => {}
        _ => *label = Some((gate_type, reason)),
    }
}

// ---------------------------------------------------------------------------
// ApprovalPrompt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PromptRequest {
    pub run_id: String,
    pub step_idx: u32,
    pub agent_name: String,
    pub gate_type: GateType,
    pub gate_reason: String,
    pub token: String,
}

/// Interactive channel for manual gate resolution. Blocks until a response
/// arrives; returns the raw response text.
pub trait ApprovalPrompt {
    fn ask(&mut self, request: &PromptRequest) -> Result<String>;
}

// ---------------------------------------------------------------------------
// GateController
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    NotGated,
    AutoApproved,
    ManuallyApproved,
}

pub struct GateController {
    ledger: Ledger,
    run_id: String,
    actor: String,
    policy: GatePolicy,
    auto: AutoApprove,
}

impl GateController {
    pub fn new(
        ledger: Ledger,
        run_id: &str,
        actor: &str,
        policy: GatePolicy,
        auto: AutoApprove,
    ) -> Result<Self> {
        paths::validate_id(run_id)?;
        Ok(Self {
            ledger,
            run_id: run_id.to_string(),
            actor: actor.to_string(),
            policy,
            auto,
        })
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    pub fn start_run(&self) -> Result<LedgerEntry> {
        let decision = Decision::RunStarted(RunStarted {
            governance_profile: self.auto.profile.map(|p| p.as_str().to_string()),
            auto_approve: self.auto.enabled,
            approval_source: self.auto.source,
            gate_strategy: self.policy.gate_strategy,
            risk_escalation_enabled: self.policy.risk.enabled,
            risk_auto_override_default: self.policy.risk.auto_override,
        });
        self.ledger.append(&self.actor, &self.run_id, None, &decision)
    }

    pub fn complete_run(&self, steps_completed: u32) -> Result<LedgerEntry> {
        let decision = Decision::RunCompleted(RunCompleted { steps_completed });
        self.ledger.append(&self.actor, &self.run_id, None, &decision)
    }

    /// Gate one completed step.
    ///
    /// Exactly one outcome per step. A forced risk gate is logged before it
    /// is resolved. A rejected prompt logs `run_failed` and returns
    /// [`AttestError::ApprovalRejected`], which ends the run.
    pub fn on_step_completed(
        &self,
        step: &StepReport,
        prompt: &mut dyn ApprovalPrompt,
    ) -> Result<GateOutcome> {
        let Some(decision) = evaluate(&self.policy, step) else {
            tracing::debug!(step = step.step_idx, agent = %step.agent_name, "no gate");
            return Ok(GateOutcome::NotGated);
        };
        let fields = GateFields {
            step_idx: step.step_idx,
            agent_name: step.agent_name.clone(),
            gate_strategy: self.policy.gate_strategy,
            gate_type: decision.gate_type,
            gate_reason: decision.gate_reason.clone(),
        };
        let evidence = format!("step:{}", step.step_idx);

        if decision.gate_type == GateType::RiskGate {
            tracing::info!(
                step = step.step_idx,
                agent = %step.agent_name,
                reason = %decision.gate_reason,
                "risk gate forced"
            );
            self.append(
                &evidence,
                Decision::RiskGateForced(RiskGateForced {
                    gate: fields.clone(),
                    observation: decision.observation.clone(),
                    risk_auto_override: self.policy.risk.auto_override,
                }),
            )?;
        }

        if self.auto.enabled {
            let auto_reason = match decision.gate_type {
                GateType::PhaseGate => Some(self.auto.reason()),
                GateType::RiskGate if self.policy.risk.auto_override => {
                    Some(RISK_OVERRIDE_REASON.to_string())
                }
                GateType::RiskGate => None,
            };
            if let Some(reason) = auto_reason {
                self.append(
                    &evidence,
                    Decision::StepApproved(StepApproved {
                        gate: fields,
                        approval_mode: ApprovalMode::Auto,
                        approval_source: self.auto.source.unwrap_or(ApprovalSource::CliFlag),
                        approval_reason: Some(reason),
                    }),
                )?;
                return Ok(GateOutcome::AutoApproved);
            }
            tracing::warn!(
                step = step.step_idx,
                "strict risk gate: auto-approve does not apply"
            );
        }

        let request = PromptRequest {
            run_id: self.run_id.clone(),
            step_idx: step.step_idx,
            agent_name: step.agent_name.clone(),
            gate_type: decision.gate_type,
            gate_reason: decision.gate_reason.clone(),
            token: self.policy.approval_token.clone(),
        };
        let answer = prompt.ask(&request)?;
        if answer.trim().to_lowercase() != self.policy.approval_token.trim().to_lowercase() {
            self.append(
                &evidence,
                Decision::RunFailed(RunFailed {
                    reason: APPROVAL_REJECTED.to_string(),
                    gate: fields,
                }),
            )?;
            return Err(AttestError::ApprovalRejected {
                step_idx: step.step_idx,
                agent_name: step.agent_name.clone(),
            });
        }

        self.append(
            &evidence,
            Decision::StepApproved(StepApproved {
                gate: fields,
                approval_mode: ApprovalMode::Manual,
                approval_source: ApprovalSource::Stdin,
                approval_reason: None,
            }),
        )?;
        Ok(GateOutcome::ManuallyApproved)
    }

    fn append(&self, evidence: &str, decision: Decision) -> Result<LedgerEntry> {
        self.ledger
            .append(&self.actor, &self.run_id, Some(evidence), &decision)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerAction;
    use tempfile::TempDir;

    /// Replays canned answers and records every request.
    struct Scripted {
        answers: Vec<String>,
        asked: Vec<PromptRequest>,
    }

    impl Scripted {
        fn new(answers: &[&str]) -> Self {
            Self {
                answers: answers.iter().rev().map(|s| s.to_string()).collect(),
                asked: Vec::new(),
            }
        }
    }

    impl ApprovalPrompt for Scripted {
        fn ask(&mut self, request: &PromptRequest) -> Result<String> {
            self.asked.push(request.clone());
            Ok(self.answers.pop().unwrap_or_default())
        }
    }

    fn policy() -> GatePolicy {
        GatePolicy::from_config(&Config::new("demo"), None)
    }

    fn risk_policy(threshold: usize, weighted: &[&str], auto_override: bool) -> GatePolicy {
        let mut p = policy();
        p.risk.enabled = true;
        p.risk.open_questions_threshold = threshold;
        p.risk.weighted_severities = weighted.iter().map(|s| s.to_string()).collect();
        p.risk.auto_override = auto_override;
        p
    }

    fn step(idx: u32, agent: &str, questions: &[&str]) -> StepReport {
        StepReport {
            step_idx: idx,
            agent_name: agent.to_string(),
            agent_gate: false,
            open_questions: questions.iter().map(|s| s.to_string()).collect(),
            deliverable: String::new(),
        }
    }

    fn controller(dir: &TempDir, policy: GatePolicy, auto: AutoApprove) -> GateController {
        GateController::new(
            Ledger::for_root(dir.path()),
            "run-1",
            "orchestrator",
            policy,
            auto,
        )
        .unwrap()
    }

    fn actions(dir: &TempDir) -> Vec<LedgerAction> {
        Ledger::for_root(dir.path())
            .entries()
            .unwrap()
            .iter()
            .map(|e| e.action)
            .collect()
    }

    #[test]
    fn phase_gates_only_without_risk_escalation() {
        let p = policy();
        let noisy = ["CRITICAL: a", "BLOCKER: b", "MAJOR: c", "d", "e", "f", "g", "h", "i"];
        let gated: Vec<u32> = (1..=10)
            .filter(|i| evaluate(&p, &step(*i, "qa_agent", &noisy)).is_some())
            .collect();
        assert_eq!(gated, vec![3, 6, 9]);
        let d = evaluate(&p, &step(3, "writer", &[])).unwrap();
        assert_eq!(d.gate_type, GateType::PhaseGate);
        assert_eq!(d.gate_reason, ROUTINE_CHECK);
    }

    #[test]
    fn weighted_threshold_is_inclusive() {
        let p = risk_policy(3, &["MAJOR", "CRITICAL", "BLOCKER"], true);
        let three = step(1, "writer", &["MAJOR: a", "major: b", "MAJOR: c", "MINOR: d"]);
        let d = evaluate(&p, &three).unwrap();
        assert_eq!(d.gate_type, GateType::RiskGate);
        assert_eq!(d.gate_reason, OPEN_QUESTIONS_THRESHOLD);
        assert_eq!(d.observation.observed_open_questions_count_weighted, Some(3));
        assert_eq!(d.observation.observed_open_questions_count_total, Some(4));

        let two = step(1, "writer", &["MAJOR: a", "MAJOR: b", "unprefixed"]);
        assert!(evaluate(&p, &two).is_none());
    }

    #[test]
    fn risk_label_never_downgrades_to_phase() {
        let p = risk_policy(1, &["MAJOR"], true);
        let d = evaluate(&p, &step(3, "writer", &["MAJOR: a"])).unwrap();
        assert_eq!(d.gate_type, GateType::RiskGate);

        let mut label = Some((GateType::RiskGate, QA_CRITICAL));
        upgrade(&mut label, GateType::PhaseGate, ROUTINE_CHECK);
        assert_eq!(label, Some((GateType::RiskGate, QA_CRITICAL)));
    }

    #[test]
    fn qa_critical_marker_forces_gate_for_high_scrutiny_role() {
        let p = risk_policy(100, &["CRITICAL"], true);
        let mut qa = step(2, "qa_agent", &[]);
        qa.deliverable = "## Findings\nSeverity: Critical\n".to_string();
        let d = evaluate(&p, &qa).unwrap();
        assert_eq!(d.gate_reason, QA_CRITICAL);
        assert_eq!(d.observation.qa_critical_error_count, Some(1));

        let mut writer = qa.clone();
        writer.agent_name = "writer".to_string();
        assert!(evaluate(&p, &writer).is_none());

        let mut off = p.clone();
        off.risk.force_gate_on_qa_critical = false;
        assert!(evaluate(&off, &qa).is_none());
    }

    #[test]
    fn qa_critical_counts_prefixed_questions() {
        let p = risk_policy(100, &["CRITICAL"], true);
        let qa = step(2, "qa_agent", &["CRITICAL: x", "blocker: y", "MAJOR: z"]);
        let d = evaluate(&p, &qa).unwrap();
        assert_eq!(d.observation.qa_critical_error_count, Some(2));
    }

    #[test]
    fn per_agent_strategy_uses_flag() {
        let mut p = policy();
        p.gate_strategy = GateStrategy::PerAgent;
        let mut s = step(3, "writer", &[]);
        assert!(evaluate(&p, &s).is_none());
        s.agent_gate = true;
        assert!(evaluate(&p, &s).is_some());
    }

    #[test]
    fn ungated_step_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, policy(), AutoApprove::off());
        let mut prompt = Scripted::new(&[]);
        let out = c.on_step_completed(&step(1, "writer", &[]), &mut prompt).unwrap();
        assert_eq!(out, GateOutcome::NotGated);
        assert!(prompt.asked.is_empty());
        assert!(actions(&dir).is_empty());
    }

    #[test]
    fn phase_gate_auto_approves_with_source() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, policy(), AutoApprove::resolve(false, Some(GovernanceProfile::Dev)));
        let mut prompt = Scripted::new(&[]);
        let out = c.on_step_completed(&step(3, "writer", &[]), &mut prompt).unwrap();
        assert_eq!(out, GateOutcome::AutoApproved);

        let entry = Ledger::for_root(dir.path()).entries().unwrap().pop().unwrap();
        assert_eq!(entry.target_artifact_id, "run-1");
        assert_eq!(entry.evidence_ref.as_deref(), Some("step:3"));
        match entry.decision().unwrap() {
            Decision::StepApproved(d) => {
                assert_eq!(d.approval_mode, ApprovalMode::Auto);
                assert_eq!(d.approval_source, ApprovalSource::Profile);
                assert_eq!(
                    d.approval_reason.as_deref(),
                    Some("Auto-approval enabled by governance profile: dev")
                );
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn risk_gate_override_logs_forced_entry_first() {
        let dir = TempDir::new().unwrap();
        let p = risk_policy(1, &["MAJOR"], true);
        let c = controller(&dir, p, AutoApprove::resolve(true, None));
        let mut prompt = Scripted::new(&[]);
        let out = c
            .on_step_completed(&step(1, "writer", &["MAJOR: x"]), &mut prompt)
            .unwrap();
        assert_eq!(out, GateOutcome::AutoApproved);
        assert_eq!(
            actions(&dir),
            vec![LedgerAction::RiskGateForced, LedgerAction::StepApproved]
        );
        let last = Ledger::for_root(dir.path()).entries().unwrap().pop().unwrap();
        assert_eq!(last.decision_metadata["approval_reason"], RISK_OVERRIDE_REASON);
        assert_eq!(last.decision_metadata["approval_source"], "cli_flag");
    }

    #[test]
    fn strict_risk_gate_prompts_despite_auto_approve() {
        let dir = TempDir::new().unwrap();
        let p = risk_policy(1, &["MAJOR"], false);
        let c = controller(&dir, p, AutoApprove::resolve(true, None));
        let mut prompt = Scripted::new(&["  approve "]);
        let out = c
            .on_step_completed(&step(1, "writer", &["MAJOR: x"]), &mut prompt)
            .unwrap();
        assert_eq!(out, GateOutcome::ManuallyApproved);
        assert_eq!(prompt.asked.len(), 1);
        assert_eq!(prompt.asked[0].gate_type, GateType::RiskGate);

        let entries = Ledger::for_root(dir.path()).entries().unwrap();
        assert_eq!(entries[0].action, LedgerAction::RiskGateForced);
        assert_eq!(entries[0].decision_metadata["risk_auto_override"], false);
        assert_eq!(entries[1].decision_metadata["approval_mode"], "manual");
        assert_eq!(entries[1].decision_metadata["approval_source"], "stdin");
    }

    #[test]
    fn phase_gate_still_auto_approves_under_strict_policy() {
        let dir = TempDir::new().unwrap();
        let p = risk_policy(5, &["MAJOR"], false);
        let c = controller(&dir, p, AutoApprove::resolve(true, None));
        let mut prompt = Scripted::new(&[]);
        let out = c.on_step_completed(&step(3, "writer", &[]), &mut prompt).unwrap();
        assert_eq!(out, GateOutcome::AutoApproved);
        assert!(prompt.asked.is_empty());
    }

    #[test]
    fn rejection_logs_run_failed_and_stops() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, policy(), AutoApprove::off());
        let mut prompt = Scripted::new(&["no"]);
        let err = c
            .on_step_completed(&step(6, "writer", &[]), &mut prompt)
            .unwrap_err();
        assert!(matches!(err, AttestError::ApprovalRejected { step_idx: 6, .. }));
        assert_eq!(err.exit_code(), 2);

        let entry = Ledger::for_root(dir.path()).entries().unwrap().pop().unwrap();
        assert_eq!(entry.action, LedgerAction::RunFailed);
        assert_eq!(entry.decision_metadata["reason"], APPROVAL_REJECTED);
        assert_eq!(entry.decision_metadata["gate_type"], "phase_gate");
    }

    #[test]
    fn run_bracketing_entries() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, policy(), AutoApprove::resolve(true, None));
        c.start_run().unwrap();
        let mut prompt = Scripted::new(&[]);
        for i in 1..=4 {
            c.on_step_completed(&step(i, "writer", &[]), &mut prompt).unwrap();
        }
        c.complete_run(4).unwrap();
        assert_eq!(
            actions(&dir),
            vec![
                LedgerAction::RunStarted,
                LedgerAction::StepApproved,
                LedgerAction::RunCompleted
            ]
        );
        assert!(Ledger::for_root(dir.path()).verify().is_ok());
    }

    #[test]
    fn auto_approve_attribution() {
        assert_eq!(
            AutoApprove::resolve(true, Some(GovernanceProfile::Dev)).source,
            Some(ApprovalSource::CliFlag)
        );
        assert_eq!(
            AutoApprove::resolve(false, Some(GovernanceProfile::Staging)).source,
            Some(ApprovalSource::Profile)
        );
        assert!(!AutoApprove::resolve(false, Some(GovernanceProfile::Prod)).enabled);
        assert!(!AutoApprove::resolve(false, None).enabled);
    }

    #[test]
    fn profile_replaces_risk_block() {
        let p = GatePolicy::from_config(&Config::new("demo"), Some(GovernanceProfile::Dev));
        assert!(p.risk.enabled);
        assert_eq!(p.risk.open_questions_threshold, 3);
        let d = evaluate(&p, &step(1, "writer", &["a?", "b?", "c?"])).unwrap();
        assert_eq!(d.gate_reason, OPEN_QUESTIONS_THRESHOLD);
    }

    #[test]
    fn dev_profile_keeps_qa_critical_off_when_config_disables_it() {
        let mut config = Config::new("demo");
        config.approval.risk_gate_escalation.force_gate_on_qa_critical = false;
        let qa = step(2, "qa_agent", &["CRITICAL: x"]);

        let dev = GatePolicy::from_config(&config, Some(GovernanceProfile::Dev));
        assert!(!dev.risk.force_gate_on_qa_critical);
        assert!(evaluate(&dev, &qa).is_none());

        let ci = GatePolicy::from_config(&config, Some(GovernanceProfile::Ci));
        assert_eq!(evaluate(&ci, &qa).unwrap().gate_reason, QA_CRITICAL);
    }
}
