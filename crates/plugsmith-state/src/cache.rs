use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use plugsmith_core::{Clock, EventType, ResourceKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::events::EventBroadcaster;
use crate::kv::KvStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub resource_key: String,
    pub content_version: String,
    pub payload: Value,
    pub cached_at: u64,
}

/// Previously computed decisions keyed by the resource's content version.
///
/// A hit requires exact equality between the stored and supplied version;
/// anything else is a miss.
#[derive(Clone)]
pub struct ProcessingCache {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBroadcaster>,
    ttl: Option<Duration>,
}

impl ProcessingCache {
    pub fn new(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBroadcaster>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            ttl,
        }
    }

    pub fn get(&self, resource: &ResourceKey, content_version: &str) -> Result<Option<Value>> {
        let entry = match self.read_entry(resource) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(resource = %resource, "discarding unreadable cache entry: {err:#}");
                self.store.delete(&cache_key(resource))?;
                None
            }
        };

        match entry {
            Some(entry) if entry.content_version == content_version => {
                debug!(resource = %resource, content_version, "processing cache hit");
                self.events.log_event(
                    resource,
                    EventType::CacheHit,
                    json!({ "content_version": content_version }),
                );
                Ok(Some(entry.payload))
            }
            other => {
                let stored = other.map(|entry| entry.content_version);
                debug!(resource = %resource, content_version, ?stored, "processing cache miss");
                self.events.log_event(
                    resource,
                    EventType::CacheMiss,
                    json!({ "content_version": content_version, "stored_version": stored }),
                );
                Ok(None)
            }
        }
    }

    pub fn set(&self, resource: &ResourceKey, content_version: &str, payload: Value) -> Result<()> {
        let entry = CacheEntry {
            resource_key: resource.to_string(),
            content_version: content_version.to_string(),
            payload,
            cached_at: self.clock.now_unix(),
        };
        let raw = serde_json::to_string(&entry)
            .with_context(|| format!("failed serializing cache entry for '{resource}'"))?;
        self.store.set(&cache_key(resource), &raw, self.ttl)?;
        self.events.log_event(
            resource,
            EventType::CacheSet,
            json!({ "content_version": content_version }),
        );
        Ok(())
    }

    pub fn invalidate(&self, resource: &ResourceKey) -> Result<bool> {
        let removed = self.store.delete(&cache_key(resource))?;
        if removed {
            debug!(resource = %resource, "processing cache invalidated");
            self.events
                .log_event(resource, EventType::CacheInvalidated, json!({}));
        }
        Ok(removed)
    }

    pub fn entry(&self, resource: &ResourceKey) -> Result<Option<CacheEntry>> {
        self.read_entry(resource)
    }

    fn read_entry(&self, resource: &ResourceKey) -> Result<Option<CacheEntry>> {
        let Some(raw) = self.store.get(&cache_key(resource))? else {
            return Ok(None);
        };
        let entry = serde_json::from_str::<CacheEntry>(&raw)
            .with_context(|| format!("failed parsing cache entry for '{resource}'"))?;
        Ok(Some(entry))
    }
}

fn cache_key(resource: &ResourceKey) -> String {
    format!("cache/{resource}")
}
