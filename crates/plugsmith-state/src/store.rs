use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use plugsmith_core::{
    Clock, ErrorContext, ErrorKind, EventType, ResourceKey, ResourceState, TransitionContext,
};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::cache::ProcessingCache;
use crate::events::EventBroadcaster;
use crate::host::HostInspector;
use crate::kv::KvStore;
use crate::reconcile::{Correction, ReconcileReport, Reconciler};
use crate::snapshot::{load_snapshot, save_snapshot, ResourceRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied {
        from: ResourceState,
        to: ResourceState,
    },
    /// Not in the transition table and not forced; nothing changed.
    Rejected {
        from: ResourceState,
        to: ResourceState,
    },
}

impl TransitionOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    pub fn state(self) -> ResourceState {
        match self {
            Self::Applied { to, .. } => to,
            Self::Rejected { from, .. } => from,
        }
    }
}

/// Authoritative per-resource state.
///
/// Reads are served from memory and fall through to the persisted snapshot on
/// a miss. Every mutation re-reads the latest snapshot, applies the one
/// resource's change and writes it back, so writers in other processes only
/// race on the same resource. Mutations also notify the event broadcaster
/// and invalidate the resource's processing cache entry.
pub struct StateStore {
    store: Arc<dyn KvStore>,
    reconciler: Reconciler,
    events: Arc<EventBroadcaster>,
    cache: ProcessingCache,
    clock: Arc<dyn Clock>,
    records: Mutex<BTreeMap<String, ResourceRecord>>,
}

impl StateStore {
    /// Loads the persisted snapshot and reconciles it against the host.
    pub fn open(
        store: Arc<dyn KvStore>,
        inspector: Arc<dyn HostInspector>,
        events: Arc<EventBroadcaster>,
        cache: ProcessingCache,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let snapshot = load_snapshot(store.as_ref())?;
        let state_store = Self {
            store,
            reconciler: Reconciler::new(inspector),
            events,
            cache,
            clock,
            records: Mutex::new(snapshot.resources),
        };
        state_store.reconcile_all()?;
        Ok(state_store)
    }

    pub fn cache(&self) -> &ProcessingCache {
        &self.cache
    }

    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.events
    }

    pub fn get(&self, resource: &ResourceKey, force_refresh: bool) -> Result<ResourceState> {
        if !force_refresh {
            if let Some(record) = self.record(resource)? {
                return Ok(record.state);
            }
        }
        self.refresh(resource)
    }

    pub fn error_context(&self, resource: &ResourceKey) -> Result<Option<ErrorContext>> {
        Ok(self.record(resource)?.and_then(|record| record.error))
    }

    /// Keys of every persisted record.
    pub fn tracked_keys(&self) -> Result<Vec<ResourceKey>> {
        Ok(self
            .records()?
            .keys()
            .filter_map(|raw_key| ResourceKey::parse(raw_key).ok())
            .collect())
    }

    /// All persisted records, freshly read from the backend.
    pub fn records(&self) -> Result<BTreeMap<String, ResourceRecord>> {
        let snapshot = load_snapshot(self.store.as_ref())?;
        *self.memory() = snapshot.resources.clone();
        Ok(snapshot.resources)
    }

    pub fn transition(
        &self,
        resource: &ResourceKey,
        target: ResourceState,
        context: TransitionContext,
        force: bool,
    ) -> Result<TransitionOutcome> {
        let from = self.get(resource, false)?;
        if !force && !from.can_transition_to(target) {
            warn!(
                resource = %resource,
                from = %from,
                to = %target,
                "ignoring transition not present in the transition table"
            );
            self.events.log_event(
                resource,
                EventType::InvalidTransition,
                json!({ "from": from, "to": target, "message": context.message }),
            );
            return Ok(TransitionOutcome::Rejected { from, to: target });
        }

        self.apply(resource, from, target, &context, force)?;
        Ok(TransitionOutcome::Applied { from, to: target })
    }

    /// Re-checks every persisted resource that claims something about the
    /// host and corrects drift with forced transitions.
    pub fn reconcile_all(&self) -> Result<ReconcileReport> {
        let records = self.records()?;
        let resources = records
            .iter()
            .filter_map(|(raw_key, record)| match ResourceKey::parse(raw_key) {
                Ok(key) => Some((key, record.state)),
                Err(err) => {
                    warn!(key = %raw_key, "skipping unparseable resource in snapshot: {err:#}");
                    None
                }
            })
            .collect::<Vec<_>>();
        let checked = resources
            .iter()
            .filter(|(_, state)| state.claims_host_reality())
            .count();

        let plugins = match self.reconciler.host_plugins() {
            Ok(plugins) => plugins,
            Err(err) => {
                warn!("host inspection failed, reconciliation skipped: {err:#}");
                return Ok(ReconcileReport {
                    checked: 0,
                    corrected: Vec::new(),
                    skipped: true,
                });
            }
        };

        let known = resources.iter().map(|(key, _)| key.clone()).collect::<Vec<_>>();
        let corrections = self.reconciler.plan(&resources, &known, &plugins);
        for correction in &corrections {
            self.apply_correction(correction)?;
        }
        debug!(checked, corrected = corrections.len(), "reconciliation pass complete");
        Ok(ReconcileReport {
            checked,
            corrected: corrections,
            skipped: false,
        })
    }

    fn refresh(&self, resource: &ResourceKey) -> Result<ResourceState> {
        let current = self.record(resource)?.map(|record| record.state);
        match current {
            Some(state) if state.claims_host_reality() => {
                let plugins = match self.reconciler.host_plugins() {
                    Ok(plugins) => plugins,
                    Err(err) => {
                        warn!(resource = %resource, "host inspection failed during refresh: {err:#}");
                        return Ok(state);
                    }
                };
                let known = self.tracked_keys()?;
                let corrections = self.reconciler.plan(&[(resource.clone(), state)], &known, &plugins);
                match corrections.first() {
                    Some(correction) => {
                        self.apply_correction(correction)?;
                        Ok(correction.to)
                    }
                    None => Ok(state),
                }
            }
            Some(state) => Ok(state),
            None => self.first_contact(resource),
        }
    }

    fn first_contact(&self, resource: &ResourceKey) -> Result<ResourceState> {
        let host = match self.reconciler.host_plugins() {
            Ok(plugins) => {
                let known = self.tracked_keys()?;
                Reconciler::host_match(resource, &known, &plugins)
                    .map(|plugin| (plugin.identifier.clone(), plugin.active))
            }
            Err(err) => {
                warn!(resource = %resource, "host inspection failed on first contact: {err:#}");
                None
            }
        };

        let Some((identifier, active)) = host else {
            let record = ResourceRecord::new(ResourceState::Unknown, self.clock.now_unix());
            self.write_record(resource, record)?;
            return Ok(ResourceState::Unknown);
        };

        let target = ResourceState::installed(active);
        let context = TransitionContext::with_message("resource found on host at first contact")
            .source("reconciliation")
            .detail("host_identifier", identifier);
        self.apply(resource, ResourceState::Unknown, target, &context, false)?;
        Ok(target)
    }

    fn apply_correction(&self, correction: &Correction) -> Result<()> {
        info!(
            resource = %correction.resource,
            from = %correction.from,
            to = %correction.to,
            host_identifier = ?correction.host_identifier,
            "correcting state drift from host"
        );
        self.events.log_event(
            &correction.resource,
            EventType::Reconciliation,
            json!({
                "kind": ErrorKind::ReconciliationMismatch,
                "from": correction.from,
                "to": correction.to,
                "host_identifier": correction.host_identifier,
            }),
        );
        let mut context = TransitionContext::with_message("state corrected from host")
            .source("reconciliation");
        if let Some(identifier) = &correction.host_identifier {
            context = context.detail("host_identifier", identifier.clone());
        }
        self.apply(&correction.resource, correction.from, correction.to, &context, true)
    }

    fn apply(
        &self,
        resource: &ResourceKey,
        from: ResourceState,
        target: ResourceState,
        context: &TransitionContext,
        forced: bool,
    ) -> Result<()> {
        let now = self.clock.now_unix();
        let mut record = ResourceRecord::new(target, now);
        if target == ResourceState::Error {
            record.error = Some(context.to_error_context(now));
        }
        let error = record.error.clone();
        self.write_record(resource, record)?;
        self.cache.invalidate(resource)?;

        let mut payload = Map::new();
        payload.insert("from".to_string(), json!(from));
        payload.insert("to".to_string(), json!(target));
        payload.insert("forced".to_string(), Value::Bool(forced));
        if let Some(message) = &context.message {
            payload.insert("message".to_string(), Value::String(message.clone()));
        }
        if let Some(source) = &context.source {
            payload.insert("source".to_string(), Value::String(source.clone()));
        }
        if let Some(error) = error {
            payload.insert("error".to_string(), json!(error));
        }
        for (key, value) in &context.details {
            payload.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self.events
            .broadcast_for(resource, EventType::StateTransition, Value::Object(payload));

        info!(resource = %resource, from = %from, to = %target, forced, "state transition");
        Ok(())
    }

    fn record(&self, resource: &ResourceKey) -> Result<Option<ResourceRecord>> {
        let key = resource.to_string();
        if let Some(record) = self.memory().get(&key) {
            return Ok(Some(record.clone()));
        }

        let snapshot = load_snapshot(self.store.as_ref())?;
        let record = snapshot.resources.get(&key).cloned();
        if let Some(record) = &record {
            self.memory().insert(key, record.clone());
        }
        Ok(record)
    }

    fn write_record(&self, resource: &ResourceKey, record: ResourceRecord) -> Result<()> {
        let key = resource.to_string();
        let mut snapshot = load_snapshot(self.store.as_ref())?;
        snapshot.resources.insert(key.clone(), record.clone());
        save_snapshot(self.store.as_ref(), &snapshot)?;
        self.memory().insert(key, record);
        Ok(())
    }

    fn memory(&self) -> MutexGuard<'_, BTreeMap<String, ResourceRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
