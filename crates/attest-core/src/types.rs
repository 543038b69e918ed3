use crate::error::AttestError;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// RiskLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }

    /// Distinct approvals needed before a proposal is fully approved.
    /// HIGH is the two-approver rule.
    pub fn required_approvals(self) -> u32 {
        match self {
            RiskLevel::High => 2,
            RiskLevel::Low | RiskLevel::Medium => 1,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = AttestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(RiskLevel::Low),
            "MEDIUM" => Ok(RiskLevel::Medium),
            "HIGH" => Ok(RiskLevel::High),
            _ => Err(AttestError::InvalidInput(format!(
                "unknown risk level '{s}': must be LOW, MEDIUM, or HIGH"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ValidationOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValidationOutcome {
    Pass,
    Fail,
    Error,
    Regression,
}

impl ValidationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationOutcome::Pass => "PASS",
            ValidationOutcome::Fail => "FAIL",
            ValidationOutcome::Error => "ERROR",
            ValidationOutcome::Regression => "REGRESSION",
        }
    }
}

impl fmt::Display for ValidationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ValidationOutcome {
    type Err = AttestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PASS" => Ok(ValidationOutcome::Pass),
            "FAIL" => Ok(ValidationOutcome::Fail),
            "ERROR" => Ok(ValidationOutcome::Error),
            "REGRESSION" => Ok(ValidationOutcome::Regression),
            _ => Err(AttestError::InvalidInput(format!(
                "unknown validation outcome '{s}': must be PASS, FAIL, ERROR, or REGRESSION"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Severity prefix of an open question (`CRITICAL: ...`, `MAJOR: ...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    Blocker,
    Major,
    Minor,
    Unprefixed,
}

impl Severity {
    /// Classify a question by its case-insensitive prefix.
    pub fn classify(question: &str) -> Severity {
        let q = question.trim().to_ascii_uppercase();
        if q.starts_with("CRITICAL:") {
            Severity::Critical
        } else if q.starts_with("BLOCKER:") {
            Severity::Blocker
        } else if q.starts_with("MAJOR:") {
            Severity::Major
        } else if q.starts_with("MINOR:") {
            Severity::Minor
        } else {
            Severity::Unprefixed
        }
    }

    pub fn is_critical(self) -> bool {
        matches!(self, Severity::Critical | Severity::Blocker)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::Blocker => "BLOCKER",
            Severity::Major => "MAJOR",
            Severity::Minor => "MINOR",
            Severity::Unprefixed => "UNPREFIXED",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Gate vocabulary
// ---------------------------------------------------------------------------

/// Ordered so that `RiskGate > PhaseGate`: labels only ever upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    PhaseGate,
    RiskGate,
}

impl GateType {
    pub fn as_str(self) -> &'static str {
        match self {
            GateType::PhaseGate => "phase_gate",
            GateType::RiskGate => "risk_gate",
        }
    }
}

impl fmt::Display for GateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStrategy {
    #[default]
    PerPhase,
    PerAgent,
}

impl GateStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            GateStrategy::PerPhase => "per_phase",
            GateStrategy::PerAgent => "per_agent",
        }
    }
}

impl fmt::Display for GateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    Manual,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalSource {
    Stdin,
    CliFlag,
    Profile,
}

impl ApprovalSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalSource::Stdin => "stdin",
            ApprovalSource::CliFlag => "cli_flag",
            ApprovalSource::Profile => "profile",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
