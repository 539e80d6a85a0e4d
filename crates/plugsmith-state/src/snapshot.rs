use std::collections::BTreeMap;

use anyhow::{Context, Result};
use plugsmith_core::{ErrorContext, ResourceState};
use serde::{Deserialize, Serialize};

use crate::kv::KvStore;

pub const SNAPSHOT_VERSION: u32 = 1;

pub(crate) const SNAPSHOT_KEY: &str = "state/snapshot";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub state: ResourceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorContext>,
    #[serde(default)]
    pub updated_at_unix: u64,
}

impl ResourceRecord {
    pub fn new(state: ResourceState, updated_at_unix: u64) -> Self {
        Self {
            state,
            error: None,
            updated_at_unix,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            resources: BTreeMap::new(),
        }
    }
}

pub(crate) fn load_snapshot(store: &dyn KvStore) -> Result<StateSnapshot> {
    let Some(raw) = store.get(SNAPSHOT_KEY)? else {
        return Ok(StateSnapshot::default());
    };
    parse_snapshot(&raw)
}

pub(crate) fn parse_snapshot(raw: &str) -> Result<StateSnapshot> {
    let snapshot =
        serde_json::from_str::<StateSnapshot>(raw).context("failed parsing state snapshot")?;
    if snapshot.version != SNAPSHOT_VERSION {
        anyhow::bail!(
            "unsupported state snapshot version {} (expected {})",
            snapshot.version,
            SNAPSHOT_VERSION
        );
    }
    Ok(snapshot)
}

pub(crate) fn save_snapshot(store: &dyn KvStore, snapshot: &StateSnapshot) -> Result<()> {
    let raw = serde_json::to_string_pretty(snapshot).context("failed serializing state snapshot")?;
    store.set(SNAPSHOT_KEY, &raw, None)
}
