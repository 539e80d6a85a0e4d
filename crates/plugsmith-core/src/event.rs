use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StateTransition,
    InvalidTransition,
    Reconciliation,
    LockAcquired,
    LockReleased,
    LockContended,
    LockReclaimed,
    CacheHit,
    CacheMiss,
    CacheSet,
    CacheInvalidated,
    InstallProgress,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateTransition => "state_transition",
            Self::InvalidTransition => "invalid_transition",
            Self::Reconciliation => "reconciliation",
            Self::LockAcquired => "lock_acquired",
            Self::LockReleased => "lock_released",
            Self::LockContended => "lock_contended",
            Self::LockReclaimed => "lock_reclaimed",
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::CacheSet => "cache_set",
            Self::CacheInvalidated => "cache_invalidated",
            Self::InstallProgress => "install_progress",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the diagnostic / live-update feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub payload: Value,
    pub timestamp: u64,
}
