use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle state of a resource.
///
/// This enum is the single definition of the state set: the persisted
/// snapshot, event payloads and the CLI's JSON output all go through its serde
/// tokens, which match [`ResourceState::as_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Unknown,
    Checking,
    Available,
    NotPlugin,
    InstalledInactive,
    InstalledActive,
    Error,
}

impl ResourceState {
    pub const ALL: [ResourceState; 7] = [
        Self::Unknown,
        Self::Checking,
        Self::Available,
        Self::NotPlugin,
        Self::InstalledInactive,
        Self::InstalledActive,
        Self::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Checking => "checking",
            Self::Available => "available",
            Self::NotPlugin => "not_plugin",
            Self::InstalledInactive => "installed_inactive",
            Self::InstalledActive => "installed_active",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == value.trim())
    }

    pub fn allowed_targets(self) -> &'static [ResourceState] {
        use ResourceState::*;
        match self {
            Unknown => &[
                Checking,
                Available,
                NotPlugin,
                Error,
                InstalledInactive,
                InstalledActive,
            ],
            Checking => &[Available, NotPlugin, Error],
            Available => &[InstalledInactive, Error],
            InstalledInactive => &[InstalledActive, Error],
            InstalledActive => &[InstalledInactive, Error],
            NotPlugin => &[Checking, Available],
            Error => &[Checking, Available, NotPlugin],
        }
    }

    pub fn can_transition_to(self, target: ResourceState) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// States that assert something about the host and are subject to
    /// reconciliation.
    pub fn claims_host_reality(self) -> bool {
        matches!(
            self,
            Self::Available | Self::InstalledInactive | Self::InstalledActive
        )
    }

    pub fn is_installed(self) -> bool {
        matches!(self, Self::InstalledInactive | Self::InstalledActive)
    }

    pub fn installed(active: bool) -> Self {
        if active {
            Self::InstalledActive
        } else {
            Self::InstalledInactive
        }
    }
}

impl Default for ResourceState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attached to a resource while it sits in [`ResourceState::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub timestamp: u64,
    pub message: String,
    pub source: String,
    pub recoverable: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_retry_at: Option<u64>,
}

/// Caller-supplied detail for a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionContext {
    pub message: Option<String>,
    pub source: Option<String>,
    pub recoverable: bool,
    pub retry_count: u32,
    pub details: Map<String, Value>,
}

impl Default for TransitionContext {
    fn default() -> Self {
        Self {
            message: None,
            source: None,
            recoverable: true,
            retry_count: 0,
            details: Map::new(),
        }
    }
}

impl TransitionContext {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn to_error_context(&self, now_unix: u64) -> ErrorContext {
        ErrorContext {
            timestamp: now_unix,
            message: self
                .message
                .clone()
                .unwrap_or_else(|| "unspecified error".to_string()),
            source: self.source.clone().unwrap_or_else(|| "unknown".to_string()),
            recoverable: self.recoverable,
            retry_count: self.retry_count,
            last_retry_at: (self.retry_count > 0).then_some(now_unix),
        }
    }
}
