use std::sync::Arc;

use anyhow::Result;
use plugsmith_core::{find_host_match, ResourceKey, ResourceState};

use crate::host::{HostInspector, HostPlugin};

/// One drift correction between a persisted state and the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    pub resource: ResourceKey,
    pub from: ResourceState,
    pub to: ResourceState,
    pub host_identifier: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub corrected: Vec<Correction>,
    /// Set when the host could not be inspected and nothing was compared.
    pub skipped: bool,
}

/// Compares persisted states against what the host reports.
///
/// Only states that claim something about the host (`Available` and the two
/// installed states) are compared; the others carry no such claim and are
/// never touched.
#[derive(Clone)]
pub struct Reconciler {
    inspector: Arc<dyn HostInspector>,
}

impl Reconciler {
    pub fn new(inspector: Arc<dyn HostInspector>) -> Self {
        Self { inspector }
    }

    pub fn host_plugins(&self) -> Result<Vec<HostPlugin>> {
        self.inspector.installed_plugins()
    }

    /// The host plugin belonging to `resource`.
    ///
    /// A plugin the resource owns wins outright. Plugins owned by other
    /// resources are never considered; the rest go through name matching
    /// against `known`, the other tracked resources.
    pub fn host_match<'a>(
        resource: &ResourceKey,
        known: &[ResourceKey],
        plugins: &'a [HostPlugin],
    ) -> Option<&'a HostPlugin> {
        if let Some(owned) = plugins
            .iter()
            .find(|plugin| plugin.owner.as_ref() == Some(resource))
        {
            return Some(owned);
        }
        let unowned: Vec<&HostPlugin> = plugins.iter().filter(|plugin| plugin.owner.is_none()).collect();
        find_host_match(resource, known, &unowned, |plugin| plugin.identifier.as_str()).copied()
    }

    /// State the resource should be in given the host's view, when it differs.
    pub fn correction(state: ResourceState, host: Option<&HostPlugin>) -> Option<ResourceState> {
        use ResourceState::*;
        match (state, host) {
            (Available, Some(plugin)) => Some(ResourceState::installed(plugin.active)),
            (InstalledInactive | InstalledActive, None) => Some(Available),
            (InstalledInactive, Some(plugin)) if plugin.active => Some(InstalledActive),
            (InstalledActive, Some(plugin)) if !plugin.active => Some(InstalledInactive),
            _ => None,
        }
    }

    pub fn plan(
        &self,
        resources: &[(ResourceKey, ResourceState)],
        known: &[ResourceKey],
        plugins: &[HostPlugin],
    ) -> Vec<Correction> {
        resources
            .iter()
            .filter(|(_, state)| state.claims_host_reality())
            .filter_map(|(resource, state)| {
                let host = Self::host_match(resource, known, plugins);
                Self::correction(*state, host).map(|to| Correction {
                    resource: resource.clone(),
                    from: *state,
                    to,
                    host_identifier: host.map(|plugin| plugin.identifier.clone()),
                })
            })
            .collect()
    }
}
