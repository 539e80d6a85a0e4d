use std::fmt;

use plugsmith_core::{ErrorKind, ResourceKey};
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStep {
    Verify,
    Preflight,
    AcquireLock,
    Download,
    Extract,
    LocateEntryPoint,
    Activate,
    Deactivate,
    ReleaseLock,
    Rollback,
    Done,
}

impl PipelineStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::Preflight => "preflight",
            Self::AcquireLock => "acquire_lock",
            Self::Download => "download",
            Self::Extract => "extract",
            Self::LocateEntryPoint => "locate_entry_point",
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::ReleaseLock => "release_lock",
            Self::Rollback => "rollback",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure surfaced by install, activate and deactivate.
#[derive(Debug, Clone, Error)]
#[error("{resource}: {step} failed ({kind}): {message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub resource: ResourceKey,
    pub step: PipelineStep,
    pub message: String,
}

impl PipelineError {
    pub fn new(
        kind: ErrorKind,
        resource: &ResourceKey,
        step: PipelineStep,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            resource: resource.clone(),
            step,
            message: message.into(),
        }
    }

    pub(crate) fn backend(resource: &ResourceKey, step: PipelineStep, err: anyhow::Error) -> Self {
        Self::new(ErrorKind::Backend, resource, step, format!("{err:#}"))
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self.kind {
            ErrorKind::LockContention => Some(
                "Another operation holds the lock; retry with --wait, or run: plugsmith unlock <key> --force if its holder is gone",
            ),
            ErrorKind::VerifyFailure => {
                Some("Check the key and branch, or set [source] token for private repositories")
            }
            ErrorKind::PreflightFailure => {
                Some("Check directory permissions and that unzip/tar are installed")
            }
            ErrorKind::DownloadFailure => Some("Check network access and retry"),
            ErrorKind::ExtractFailure => Some("The archive may be corrupt; retry the install"),
            ErrorKind::EntryPointNotFound => {
                Some("The repository does not look like a plugin; run: plugsmith check <key>")
            }
            ErrorKind::InvalidTransition => Some("Run: plugsmith status <key> --refresh"),
            ErrorKind::ActivationFailure => Some("Inspect the plugin directory and retry"),
            ErrorKind::ReconciliationMismatch | ErrorKind::Backend => None,
        }
    }
}
