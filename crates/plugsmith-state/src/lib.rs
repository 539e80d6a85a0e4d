mod cache;
mod events;
mod host;
mod kv;
mod lock;
mod reconcile;
mod snapshot;
mod store;

pub use cache::{CacheEntry, ProcessingCache};
pub use events::{EventBroadcaster, EventListener, GLOBAL_EVENT_CAPACITY, RESOURCE_EVENT_CAPACITY};
pub use host::{HostInspector, HostPlugin};
pub use kv::{FsKvStore, KvStore, MemoryKvStore};
pub use lock::{default_holder_id, Lock, LockGuard, LockManager, MIN_POLL_INTERVAL};
pub use reconcile::{Correction, ReconcileReport, Reconciler};
pub use snapshot::{ResourceRecord, StateSnapshot, SNAPSHOT_VERSION};
pub use store::{StateStore, TransitionOutcome};
