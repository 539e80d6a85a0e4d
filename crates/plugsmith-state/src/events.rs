use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use plugsmith_core::{Clock, Event, EventType, ResourceKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::kv::KvStore;

pub const GLOBAL_EVENT_CAPACITY: usize = 100;
pub const RESOURCE_EVENT_CAPACITY: usize = 30;

const GLOBAL_FEED_KEY: &str = "events/global";

pub type EventListener = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct GlobalFeedFile {
    next_id: u64,
    #[serde(default)]
    events: VecDeque<Event>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResourceFeedFile {
    #[serde(default)]
    events: VecDeque<Event>,
}

#[derive(Default)]
struct Buffers {
    next_id: u64,
    global: VecDeque<Event>,
    resources: HashMap<String, VecDeque<Event>>,
}

/// Bounded ring buffers of recent events: one global feed for live-update
/// consumers and one per resource for diagnostics.
///
/// Both evict oldest-first. Ids come from one strictly increasing sequence.
/// With a backing store the buffers are written through on every append and
/// re-read before reads, so separate processes observe one feed; concurrent
/// appenders from different processes can still lose entries.
pub struct EventBroadcaster {
    buffers: Mutex<Buffers>,
    listeners: Mutex<Vec<EventListener>>,
    store: Option<Arc<dyn KvStore>>,
    clock: Arc<dyn Clock>,
}

impl EventBroadcaster {
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            buffers: Mutex::new(Buffers {
                next_id: 1,
                ..Buffers::default()
            }),
            listeners: Mutex::new(Vec::new()),
            store: None,
            clock,
        }
    }

    pub fn persistent(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let feed = load_global_feed(store.as_ref())?;
        Ok(Self {
            buffers: Mutex::new(Buffers {
                next_id: feed.next_id.max(1),
                global: feed.events,
                resources: HashMap::new(),
            }),
            listeners: Mutex::new(Vec::new()),
            store: Some(store),
            clock,
        })
    }

    pub fn subscribe(&self, listener: EventListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Appends to the resource's own buffer only.
    pub fn log_event(&self, resource: &ResourceKey, event_type: EventType, data: Value) -> Event {
        self.record(Some(resource), event_type, data, false)
    }

    /// Appends to the global feed.
    pub fn broadcast(&self, event_type: EventType, payload: Value) -> Event {
        self.record(None, event_type, payload, true)
    }

    /// Appends to both the resource buffer and the global feed.
    pub fn broadcast_for(
        &self,
        resource: &ResourceKey,
        event_type: EventType,
        payload: Value,
    ) -> Event {
        self.record(Some(resource), event_type, payload, true)
    }

    pub fn get_events_since(&self, last_id: u64) -> Vec<Event> {
        let mut buffers = self.buffers();
        self.refresh_global(&mut buffers);
        buffers
            .global
            .iter()
            .filter(|event| event.id > last_id)
            .cloned()
            .collect()
    }

    pub fn resource_events(&self, resource: &ResourceKey) -> Vec<Event> {
        let mut buffers = self.buffers();
        let key = resource.to_string();
        if let Some(store) = &self.store {
            match load_resource_feed(store.as_ref(), &key) {
                Ok(feed) => {
                    buffers.resources.insert(key.clone(), feed.events);
                }
                Err(err) => warn!(resource = %key, "failed to load resource events: {err:#}"),
            }
        }
        buffers
            .resources
            .get(&key)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Id of the most recently assigned event, 0 when none exist.
    pub fn latest_id(&self) -> u64 {
        let mut buffers = self.buffers();
        self.refresh_global(&mut buffers);
        buffers.next_id.saturating_sub(1)
    }

    fn record(
        &self,
        resource: Option<&ResourceKey>,
        event_type: EventType,
        payload: Value,
        global: bool,
    ) -> Event {
        let mut buffers = self.buffers();
        self.refresh_global(&mut buffers);

        let event = Event {
            id: buffers.next_id,
            event_type,
            resource: resource.map(ToString::to_string),
            payload,
            timestamp: self.clock.now_unix(),
        };
        buffers.next_id += 1;

        if let Some(key) = &event.resource {
            if !buffers.resources.contains_key(key) {
                let loaded = self
                    .store
                    .as_ref()
                    .and_then(|store| load_resource_feed(store.as_ref(), key).ok())
                    .map(|feed| feed.events)
                    .unwrap_or_default();
                buffers.resources.insert(key.clone(), loaded);
            }
            if let Some(ring) = buffers.resources.get_mut(key) {
                push_capped(ring, event.clone(), RESOURCE_EVENT_CAPACITY);
            }
        }
        if global {
            push_capped(&mut buffers.global, event.clone(), GLOBAL_EVENT_CAPACITY);
        }

        if let Some(store) = &self.store {
            if let Err(err) = persist(store.as_ref(), &buffers, event.resource.as_deref()) {
                warn!(event_id = event.id, "failed to persist event buffers: {err:#}");
            }
        }
        drop(buffers);

        for listener in self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            listener(&event);
        }
        event
    }

    fn refresh_global(&self, buffers: &mut Buffers) {
        let Some(store) = &self.store else {
            return;
        };
        match load_global_feed(store.as_ref()) {
            Ok(feed) => {
                if feed.next_id >= buffers.next_id {
                    buffers.next_id = feed.next_id.max(1);
                    buffers.global = feed.events;
                }
            }
            Err(err) => warn!("failed to reload global event feed: {err:#}"),
        }
    }

    fn buffers(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn push_capped(ring: &mut VecDeque<Event>, event: Event, capacity: usize) {
    while ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(event);
}

fn resource_feed_key(resource: &str) -> String {
    format!("events/resource/{resource}")
}

fn load_global_feed(store: &dyn KvStore) -> Result<GlobalFeedFile> {
    let Some(raw) = store.get(GLOBAL_FEED_KEY)? else {
        return Ok(GlobalFeedFile {
            next_id: 1,
            events: VecDeque::new(),
        });
    };
    serde_json::from_str(&raw).context("failed parsing global event feed")
}

fn load_resource_feed(store: &dyn KvStore, resource: &str) -> Result<ResourceFeedFile> {
    let Some(raw) = store.get(&resource_feed_key(resource))? else {
        return Ok(ResourceFeedFile::default());
    };
    serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing event feed for '{resource}'"))
}

fn persist(store: &dyn KvStore, buffers: &Buffers, resource: Option<&str>) -> Result<()> {
    let global = GlobalFeedFile {
        next_id: buffers.next_id,
        events: buffers.global.clone(),
    };
    store.set(
        GLOBAL_FEED_KEY,
        &serde_json::to_string(&global).context("failed serializing global event feed")?,
        None,
    )?;

    if let Some(resource) = resource {
        let events = buffers.resources.get(resource).cloned().unwrap_or_default();
        let feed = ResourceFeedFile { events };
        store.set(
            &resource_feed_key(resource),
            &serde_json::to_string(&feed)
                .with_context(|| format!("failed serializing event feed for '{resource}'"))?,
            None,
        )?;
    }
    Ok(())
}
