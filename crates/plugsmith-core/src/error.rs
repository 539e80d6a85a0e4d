use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure taxonomy shared by every operation surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidTransition,
    LockContention,
    VerifyFailure,
    PreflightFailure,
    DownloadFailure,
    ExtractFailure,
    EntryPointNotFound,
    ActivationFailure,
    ReconciliationMismatch,
    Backend,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidTransition => "invalid-transition",
            Self::LockContention => "lock-contention",
            Self::VerifyFailure => "verify-failure",
            Self::PreflightFailure => "preflight-failure",
            Self::DownloadFailure => "download-failure",
            Self::ExtractFailure => "extract-failure",
            Self::EntryPointNotFound => "entry-point-not-found",
            Self::ActivationFailure => "activation-failure",
            Self::ReconciliationMismatch => "reconciliation-mismatch",
            Self::Backend => "backend",
        }
    }

    /// Kinds whose failure is compensated by rollback, so a retry starts clean.
    pub fn triggers_rollback(self) -> bool {
        matches!(
            self,
            Self::DownloadFailure | Self::ExtractFailure | Self::EntryPointNotFound
        )
    }

    /// A later retry of the same operation can succeed without manual repair.
    pub fn is_recoverable(self) -> bool {
        self == Self::LockContention || self.triggers_rollback()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
