use crate::ledger::LedgerError;
use crate::pack::IntegrityError;
use thiserror::Error;

// ---------------------------------------------------------------------------
// FailureClass
// ---------------------------------------------------------------------------

/// How a failure should be reported to the caller.
///
/// `Blocked` failures happen before any side effect. `Operational` failures
/// may follow a side effect that was compensated. `Critical` means the
/// compensation itself failed and on-disk state is known to be inconsistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Blocked,
    Operational,
    Critical,
}

impl FailureClass {
    pub fn exit_code(self) -> i32 {
        match self {
            FailureClass::Operational => 1,
            FailureClass::Blocked => 2,
            FailureClass::Critical => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Blocked => "blocked",
            FailureClass::Operational => "operational",
            FailureClass::Critical => "critical",
        }
    }
}

// ---------------------------------------------------------------------------
// AttestError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AttestError {
    #[error("not initialized: run 'attest init'")]
    NotInitialized,

    #[error("signal not found: {0}")]
    SignalNotFound(String),

    #[error("proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("proposal {id} is unreadable: {reason}")]
    ProposalCorrupt { id: String, reason: String },

    #[error("pack version not found: {0}")]
    PackNotFound(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("no ledger entries for run {0}")]
    RunNotFound(String),

    #[error("invalid identifier '{0}'")]
    InvalidId(String),

    #[error("invalid value: {0}")]
    InvalidInput(String),

    #[error("record already exists: {0}")]
    RecordExists(String),

    #[error("blocked: {0}")]
    Blocked(String),

    #[error("integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("ledger verification failed: {0}")]
    LedgerInvalid(#[from] LedgerError),

    #[error("ledger is locked by another writer ({0})")]
    LedgerBusy(String),

    #[error("approval rejected at step {step_idx} ({agent_name})")]
    ApprovalRejected { step_idx: u32, agent_name: String },

    #[error("{operation} failed after state was changed: {reason}; {compensation}")]
    Operational {
        operation: String,
        reason: String,
        compensation: String,
    },

    #[error("CRITICAL: {operation} left inconsistent state: {reason}; compensation failed: {compensation_error}")]
    Critical {
        operation: String,
        reason: String,
        compensation_error: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AttestError {
    pub fn class(&self) -> FailureClass {
        match self {
            AttestError::Blocked(_)
            | AttestError::Integrity(_)
            | AttestError::LedgerInvalid(_)
            | AttestError::PackNotFound(_)
            | AttestError::SnapshotNotFound(_)
            | AttestError::RecordExists(_)
            | AttestError::ApprovalRejected { .. } => FailureClass::Blocked,
            AttestError::Critical { .. } => FailureClass::Critical,
            _ => FailureClass::Operational,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.class().exit_code()
    }

    pub(crate) fn blocked(reason: impl Into<String>) -> Self {
        AttestError::Blocked(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, AttestError>;
