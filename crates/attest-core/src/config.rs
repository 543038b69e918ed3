use crate::error::{AttestError, Result};
use crate::io;
use crate::paths;
use crate::types::{GateStrategy, Severity};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// RiskEscalation
// ---------------------------------------------------------------------------

/// Dynamic risk overlay applied on top of the static phase gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEscalation {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_threshold")]
    pub open_questions_threshold: usize,
    /// Severity names (`CRITICAL`, `BLOCKER`, `MAJOR`, `MINOR`, `UNPREFIXED`)
    /// that count towards the threshold. Case-insensitive.
    #[serde(default = "default_weighted_severities")]
    pub weighted_severities: Vec<String>,
    #[serde(default = "default_true")]
    pub force_gate_on_qa_critical: bool,
    /// When false, a risk gate still pauses for a human while auto-approve
    /// is on.
    #[serde(default = "default_true")]
    pub auto_override: bool,
    #[serde(default = "default_high_scrutiny_roles")]
    pub high_scrutiny_roles: Vec<String>,
    #[serde(default = "default_critical_marker")]
    pub critical_marker: String,
}

fn default_threshold() -> usize {
    8
}

fn default_weighted_severities() -> Vec<String> {
    ["CRITICAL", "BLOCKER", "MAJOR", "UNPREFIXED"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_high_scrutiny_roles() -> Vec<String> {
    vec!["qa_agent".to_string()]
}

fn default_critical_marker() -> String {
    "Severity: Critical".to_string()
}

impl Default for RiskEscalation {
    fn default() -> Self {
        Self {
            enabled: false,
            open_questions_threshold: default_threshold(),
            weighted_severities: default_weighted_severities(),
            force_gate_on_qa_critical: true,
            auto_override: true,
            high_scrutiny_roles: default_high_scrutiny_roles(),
            critical_marker: default_critical_marker(),
        }
    }
}

impl RiskEscalation {
    /// Parsed weighted severities. Unknown names are dropped here and
    /// reported by [`Config::validate`].
    pub fn weighted(&self) -> Vec<Severity> {
        let mut out: Vec<Severity> = self
            .weighted_severities
            .iter()
            .filter_map(|s| parse_severity(s))
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

fn parse_severity(name: &str) -> Option<Severity> {
    match name.trim().to_ascii_uppercase().as_str() {
        "CRITICAL" => Some(Severity::Critical),
        "BLOCKER" => Some(Severity::Blocker),
        "MAJOR" => Some(Severity::Major),
        "MINOR" => Some(Severity::Minor),
        "UNPREFIXED" => Some(Severity::Unprefixed),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// ApprovalConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default)]
    pub gate_strategy: GateStrategy,
    #[serde(default = "default_phase_gates")]
    pub phase_gates: Vec<u32>,
    #[serde(default = "default_token")]
    pub require_approval_token: String,
    #[serde(default)]
    pub risk_gate_escalation: RiskEscalation,
}

fn default_phase_gates() -> Vec<u32> {
    vec![3, 6, 9]
}

fn default_token() -> String {
    "APPROVE".to_string()
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            gate_strategy: GateStrategy::default(),
            phase_gates: default_phase_gates(),
            require_approval_token: default_token(),
            risk_gate_escalation: RiskEscalation::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ApproversConfig
// ---------------------------------------------------------------------------

/// Risk-tier allow-lists. LOW needs no list; MEDIUM accepts either list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApproversConfig {
    #[serde(default, alias = "MEDIUM")]
    pub medium: Vec<String>,
    #[serde(default, alias = "HIGH")]
    pub high: Vec<String>,
}

impl ApproversConfig {
    /// Fail-closed authority check on the raw risk level string.
    pub fn is_authorized(&self, actor_id: &str, risk_level: &str) -> bool {
        let listed = |list: &[String]| list.iter().any(|a| a == actor_id);
        match risk_level {
            "LOW" => true,
            "MEDIUM" => listed(&self.medium) || listed(&self.high),
            "HIGH" => listed(&self.high),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

/// One pipeline role. `gate` is consulted by the `per_agent` strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub gate: bool,
}

// ---------------------------------------------------------------------------
// ProjectConfig / Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub project: ProjectConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub approvers: ApproversConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

fn default_version() -> u32 {
    1
}

impl Config {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            version: default_version(),
            project: ProjectConfig {
                name: project_name.into(),
                description: None,
            },
            approval: ApprovalConfig::default(),
            approvers: ApproversConfig::default(),
            agents: Vec::new(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        let data = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AttestError::NotInitialized
            } else {
                AttestError::Io(e)
            }
        })?;
        let config: Config = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        io::atomic_write(&path, data.as_bytes())
    }

    /// `gate` flag of the named role, false when the role is not listed.
    pub fn agent_gate(&self, agent_name: &str) -> bool {
        self.agents
            .iter()
            .find(|a| a.name == agent_name)
            .is_some_and(|a| a.gate)
    }

    /// Check the configuration for suspicious or broken settings.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut out = Vec::new();
        let mut push = |level: WarnLevel, message: String| out.push(ConfigWarning { level, message });

        if self.project.name.trim().is_empty() {
            push(WarnLevel::Error, "project.name is empty".to_string());
        }

        let approval = &self.approval;
        if approval.require_approval_token.trim().is_empty() {
            push(
                WarnLevel::Error,
                "approval.require_approval_token is empty; every manual gate would be rejected"
                    .to_string(),
            );
        }
        if approval.phase_gates.contains(&0) {
            push(
                WarnLevel::Warning,
                "approval.phase_gates contains 0; steps are numbered from 1".to_string(),
            );
        }
        if approval.gate_strategy == GateStrategy::PerAgent {
            if self.agents.is_empty() {
                push(
                    WarnLevel::Warning,
                    "gate_strategy is per_agent but no agents are configured".to_string(),
                );
            } else if !self.agents.iter().any(|a| a.gate) {
                push(
                    WarnLevel::Warning,
                    "gate_strategy is per_agent but no agent has gate: true".to_string(),
                );
            }
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name.as_str()) {
                push(WarnLevel::Error, format!("agent '{}' is listed twice", agent.name));
            }
        }

        let risk = &approval.risk_gate_escalation;
        if risk.enabled && risk.open_questions_threshold == 0 {
            push(
                WarnLevel::Warning,
                "risk_gate_escalation.open_questions_threshold is 0; every step becomes a risk gate"
                    .to_string(),
            );
        }
        for name in &risk.weighted_severities {
            if parse_severity(name).is_none() {
                push(WarnLevel::Error, format!("unknown weighted severity '{name}'"));
            }
        }
        if risk.force_gate_on_qa_critical && risk.critical_marker.trim().is_empty() {
            push(
                WarnLevel::Warning,
                "risk_gate_escalation.critical_marker is empty; it would match every deliverable"
                    .to_string(),
            );
        }
        if !self.agents.is_empty() {
            for role in &risk.high_scrutiny_roles {
                if !self.agents.iter().any(|a| &a.name == role) {
                    push(
                        WarnLevel::Warning,
                        format!("high-scrutiny role '{role}' is not a configured agent"),
                    );
                }
            }
        }

        for actor in &self.approvers.medium {
            if self.approvers.high.contains(actor) {
                push(
                    WarnLevel::Warning,
                    format!("approver '{actor}' is listed under both medium and high"),
                );
            }
        }

        out
    }
}

// ---------------------------------------------------------------------------
// GovernanceProfile
// ---------------------------------------------------------------------------

/// Built-in governance profiles. A profile replaces the configured risk
/// escalation block and may turn on auto-approve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernanceProfile {
    Dev,
    Staging,
    Prod,
    Ci,
}

impl GovernanceProfile {
    pub fn all() -> &'static [GovernanceProfile] {
        &[
            GovernanceProfile::Dev,
            GovernanceProfile::Staging,
            GovernanceProfile::Prod,
            GovernanceProfile::Ci,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GovernanceProfile::Dev => "dev",
            GovernanceProfile::Staging => "staging",
            GovernanceProfile::Prod => "prod",
            GovernanceProfile::Ci => "ci",
        }
    }

    pub fn auto_approve(self) -> bool {
        !matches!(self, GovernanceProfile::Prod)
    }

    /// Risk escalation block this profile imposes. Role and marker settings
    /// are carried over from `base`, and so is the qa-critical check except
    /// under `ci`, which always forces it on.
    pub fn risk_escalation(self, base: &RiskEscalation) -> RiskEscalation {
        let (threshold, auto_override, weighted): (usize, bool, &[&str]) = match self {
            GovernanceProfile::Dev => (3, true, &["CRITICAL", "BLOCKER", "MAJOR", "UNPREFIXED"]),
            GovernanceProfile::Staging => (5, false, &["CRITICAL", "BLOCKER", "MAJOR"]),
            GovernanceProfile::Prod => (8, false, &["CRITICAL", "BLOCKER"]),
            GovernanceProfile::Ci => (8, false, &["CRITICAL", "BLOCKER"]),
        };
        RiskEscalation {
            enabled: true,
            open_questions_threshold: threshold,
            weighted_severities: weighted.iter().map(|s| s.to_string()).collect(),
            force_gate_on_qa_critical: matches!(self, GovernanceProfile::Ci)
                || base.force_gate_on_qa_critical,
            auto_override,
            high_scrutiny_roles: base.high_scrutiny_roles.clone(),
            critical_marker: base.critical_marker.clone(),
        }
    }
}

impl fmt::Display for GovernanceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GovernanceProfile {
    type Err = AttestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        GovernanceProfile::all()
            .iter()
            .copied()
            .find(|p| p.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| {
                AttestError::InvalidInput(format!(
                    "unknown governance profile '{s}': choose dev, staging, prod, or ci"
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn minimal_yaml_gets_defaults() {
        let config: Config = serde_yaml::from_str("project:\n  name: demo\n").unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.approval.phase_gates, vec![3, 6, 9]);
        assert_eq!(config.approval.require_approval_token, "APPROVE");
        assert_eq!(config.approval.gate_strategy, GateStrategy::PerPhase);
        let risk = &config.approval.risk_gate_escalation;
        assert!(!risk.enabled);
        assert_eq!(risk.open_questions_threshold, 8);
        assert!(risk.auto_override);
        assert!(risk.force_gate_on_qa_critical);
        assert_eq!(risk.high_scrutiny_roles, vec!["qa_agent"]);
        assert_eq!(risk.critical_marker, "Severity: Critical");
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::new("demo");
        config.approvers.high.push("alice".to_string());
        config.save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_config_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Config::load(dir.path()).unwrap_err(),
            AttestError::NotInitialized
        ));
    }

    #[test]
    fn uppercase_approver_keys_are_accepted() {
        let yaml = "project:\n  name: demo\napprovers:\n  MEDIUM: [bob]\n  HIGH: [alice]\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.approvers.medium, vec!["bob"]);
        assert_eq!(config.approvers.high, vec!["alice"]);
    }

    #[test]
    fn authority_fails_closed() {
        let approvers = ApproversConfig {
            medium: vec!["bob".to_string()],
            high: vec!["alice".to_string()],
        };
        assert!(approvers.is_authorized("anyone", "LOW"));
        assert!(approvers.is_authorized("bob", "MEDIUM"));
        assert!(approvers.is_authorized("alice", "MEDIUM"));
        assert!(approvers.is_authorized("alice", "HIGH"));
        assert!(!approvers.is_authorized("bob", "HIGH"));
        assert!(!approvers.is_authorized("alice", "CRITICAL"));
        assert!(!approvers.is_authorized("anyone", "low"));
    }

    #[test]
    fn validate_flags_bad_settings() {
        let mut config = Config::new("demo");
        config.approval.require_approval_token = " ".to_string();
        config.approval.phase_gates = vec![0, 3];
        config.approval.risk_gate_escalation.enabled = true;
        config.approval.risk_gate_escalation.open_questions_threshold = 0;
        config
            .approval
            .risk_gate_escalation
            .weighted_severities
            .push("SEVERE".to_string());
        config.approvers.medium.push("alice".to_string());
        config.approvers.high.push("alice".to_string());

        let warnings = config.validate();
        let errors = warnings.iter().filter(|w| w.level == WarnLevel::Error).count();
        assert_eq!(errors, 2, "{warnings:?}");
        assert!(warnings.iter().any(|w| w.message.contains("phase_gates contains 0")));
        assert!(warnings.iter().any(|w| w.message.contains("threshold is 0")));
        assert!(warnings.iter().any(|w| w.message.contains("both medium and high")));
    }

    #[test]
    fn default_config_is_clean() {
        assert!(Config::new("demo").validate().is_empty());
    }

    #[test]
    fn per_agent_uses_gate_flags() {
        let yaml = "project:\n  name: demo\napproval:\n  gate_strategy: per_agent\nagents:\n  - name: writer\n  - name: qa_agent\n    gate: true\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.agent_gate("writer"));
        assert!(config.agent_gate("qa_agent"));
        assert!(!config.agent_gate("unknown"));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn profiles_override_risk_block() {
        let base = RiskEscalation::default();
        let staging = GovernanceProfile::Staging.risk_escalation(&base);
        assert!(staging.enabled);
        assert_eq!(staging.open_questions_threshold, 5);
        assert!(!staging.auto_override);
        assert_eq!(
            staging.weighted(),
            vec![Severity::Critical, Severity::Blocker, Severity::Major]
        );
        assert!(GovernanceProfile::Dev.auto_approve());
        assert!(!GovernanceProfile::Prod.auto_approve());
        assert_eq!("CI".parse::<GovernanceProfile>().unwrap(), GovernanceProfile::Ci);
        assert!("qa".parse::<GovernanceProfile>().is_err());
    }

    #[test]
    fn only_ci_forces_qa_critical_on() {
        let base = RiskEscalation {
            force_gate_on_qa_critical: false,
            ..RiskEscalation::default()
        };
        for profile in [
            GovernanceProfile::Dev,
            GovernanceProfile::Staging,
            GovernanceProfile::Prod,
        ] {
            assert!(
                !profile.risk_escalation(&base).force_gate_on_qa_critical,
                "{profile} turned qa-critical gating back on"
            );
        }
        assert!(GovernanceProfile::Ci.risk_escalation(&base).force_gate_on_qa_critical);
        assert!(GovernanceProfile::Dev
            .risk_escalation(&RiskEscalation::default())
            .force_gate_on_qa_critical);
    }
}
