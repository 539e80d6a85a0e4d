use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use plugsmith_core::{Clock, EventType, ResourceKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::events::EventBroadcaster;
use crate::kv::KvStore;

/// Shortest pause between polls in `wait_for_lock`.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Processing lock record as persisted in the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub resource_key: String,
    pub holder_id: String,
    pub locked_at: u64,
    pub ttl: u64,
}

impl Lock {
    pub fn expires_at(&self) -> u64 {
        self.locked_at.saturating_add(self.ttl)
    }

    pub fn is_expired(&self, now_unix: u64) -> bool {
        now_unix > self.expires_at()
    }
}

pub fn default_holder_id() -> String {
    format!("{}-{}", std::process::id(), uuid::Uuid::new_v4().simple())
}

/// TTL-bound mutual exclusion per resource key.
///
/// Exclusion rests entirely on the backend's `create_if_absent`. A holder
/// that dies without releasing blocks others for at most `ttl`; the next
/// `acquire` after expiry deletes the stale record and retries once.
pub struct LockManager {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBroadcaster>,
    holder_id: String,
}

impl LockManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBroadcaster>,
        holder_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            holder_id: holder_id.into(),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Returns `false` on contention without blocking.
    pub fn acquire(&self, resource: &ResourceKey, ttl: Duration) -> Result<bool> {
        let key = lock_key(resource);
        let now = self.clock.now_unix();
        let lock = Lock {
            resource_key: resource.to_string(),
            holder_id: self.holder_id.clone(),
            locked_at: now,
            ttl: ttl.as_secs(),
        };
        let record = serde_json::to_string(&lock)
            .with_context(|| format!("failed serializing lock for '{resource}'"))?;

        if self.store.create_if_absent(&key, &record, None)? {
            self.note_acquired(resource, &lock);
            return Ok(true);
        }

        match self.read_lock_record(&key) {
            Ok(Some((raw, existing))) if existing.is_expired(now) => {
                // Only the stale record we read may go; a contender that
                // reclaimed first keeps its fresh lock.
                if self.store.delete_if_equals(&key, &raw)? {
                    debug!(
                        resource = %resource,
                        stale_holder = %existing.holder_id,
                        "reclaimed expired processing lock"
                    );
                    self.events.log_event(
                        resource,
                        EventType::LockReclaimed,
                        json!({
                            "stale_holder": existing.holder_id,
                            "expired_at": existing.expires_at(),
                        }),
                    );
                }
                if self.store.create_if_absent(&key, &record, None)? {
                    self.note_acquired(resource, &lock);
                    return Ok(true);
                }
            }
            Ok(None) => {
                // released between our insert attempt and the read
                if self.store.create_if_absent(&key, &record, None)? {
                    self.note_acquired(resource, &lock);
                    return Ok(true);
                }
            }
            Ok(Some(_)) => {}
            Err(err) => {
                warn!(resource = %resource, "unreadable processing lock treated as held: {err:#}");
            }
        }

        debug!(resource = %resource, holder = %self.holder_id, "processing lock contended");
        self.events.log_event(
            resource,
            EventType::LockContended,
            json!({ "holder": self.holder_id }),
        );
        Ok(false)
    }

    /// Deletes the lock. Unless `force`, only a lock we hold is removed.
    pub fn release(&self, resource: &ResourceKey, force: bool) -> Result<bool> {
        let key = lock_key(resource);
        let removed = if force {
            self.store.delete(&key)?
        } else {
            match self.read_lock_record(&key)? {
                Some((raw, existing)) if existing.holder_id == self.holder_id => {
                    self.store.delete_if_equals(&key, &raw)?
                }
                Some((_, existing)) => {
                    warn!(
                        resource = %resource,
                        holder = %existing.holder_id,
                        "refusing to release a processing lock held by another holder"
                    );
                    return Ok(false);
                }
                None => return Ok(false),
            }
        };
        if removed {
            debug!(resource = %resource, force, "processing lock released");
            self.events.log_event(
                resource,
                EventType::LockReleased,
                json!({ "holder": self.holder_id, "forced": force }),
            );
        }
        Ok(removed)
    }

    /// Polls `acquire` until it succeeds or `max_wait` has elapsed. Poll
    /// intervals below [`MIN_POLL_INTERVAL`] are raised to it.
    pub fn wait_for_lock(
        &self,
        resource: &ResourceKey,
        ttl: Duration,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<bool> {
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        let started = self.clock.now_unix();
        let deadline = started.saturating_add(max_wait.as_secs());
        loop {
            if self.acquire(resource, ttl)? {
                return Ok(true);
            }
            let now = self.clock.now_unix();
            if now >= deadline {
                return Ok(false);
            }
            let remaining = Duration::from_secs(deadline - now);
            self.clock.sleep(poll_interval.min(remaining));
        }
    }

    /// Current live lock, `None` when absent or expired.
    pub fn holder(&self, resource: &ResourceKey) -> Result<Option<Lock>> {
        let now = self.clock.now_unix();
        Ok(self
            .read_lock(&lock_key(resource))?
            .filter(|lock| !lock.is_expired(now)))
    }

    /// Acquires and wraps the lock in a guard that releases it on drop.
    pub fn acquire_guard(
        self: &Arc<Self>,
        resource: &ResourceKey,
        ttl: Duration,
        max_wait: Option<Duration>,
        poll_interval: Duration,
    ) -> Result<Option<LockGuard>> {
        let acquired = match max_wait {
            Some(max_wait) if !max_wait.is_zero() => {
                self.wait_for_lock(resource, ttl, max_wait, poll_interval)?
            }
            _ => self.acquire(resource, ttl)?,
        };
        Ok(acquired.then(|| LockGuard {
            manager: Arc::clone(self),
            resource: resource.clone(),
            released: false,
        }))
    }

    fn read_lock(&self, key: &str) -> Result<Option<Lock>> {
        Ok(self.read_lock_record(key)?.map(|(_, lock)| lock))
    }

    /// The stored record alongside its parsed form.
    fn read_lock_record(&self, key: &str) -> Result<Option<(String, Lock)>> {
        let Some(raw) = self.store.get(key)? else {
            return Ok(None);
        };
        let lock = serde_json::from_str::<Lock>(&raw)
            .with_context(|| format!("failed parsing processing lock '{key}'"))?;
        Ok(Some((raw, lock)))
    }

    fn note_acquired(&self, resource: &ResourceKey, lock: &Lock) {
        debug!(resource = %resource, holder = %lock.holder_id, ttl = lock.ttl, "processing lock acquired");
        self.events.log_event(
            resource,
            EventType::LockAcquired,
            json!({ "holder": lock.holder_id, "ttl": lock.ttl }),
        );
    }
}

fn lock_key(resource: &ResourceKey) -> String {
    format!("lock/{resource}")
}

/// Releases its lock when dropped, whatever path the holder exits by.
pub struct LockGuard {
    manager: Arc<LockManager>,
    resource: ResourceKey,
    released: bool,
}

impl LockGuard {
    pub fn resource(&self) -> &ResourceKey {
        &self.resource
    }

    pub fn release(mut self) -> Result<bool> {
        self.released = true;
        self.manager.release(&self.resource, false)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.manager.release(&self.resource, false) {
            warn!(resource = %self.resource, "failed to release processing lock: {err:#}");
        }
    }
}
