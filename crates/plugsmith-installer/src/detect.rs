use std::sync::Arc;

use anyhow::Result;
use plugsmith_core::{ResourceKey, ResourceState, TransitionContext};
use plugsmith_state::{HostInspector, Reconciler, StateStore};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::source::SourceInspector;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionOutcome {
    /// The current state already answers the question.
    Skipped,
    /// The host reports the resource as installed.
    Host,
    /// A cached decision for the current content version was reused.
    Cached,
    /// The source was probed and the decision cached.
    Probed,
    /// Detection failed and the resource moved to `Error`.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub resource: ResourceKey,
    pub state: ResourceState,
    pub content_version: Option<String>,
    pub outcome: DetectionOutcome,
}

/// Decides whether a resource is installed, installable or not a plugin.
pub struct Detector {
    state: Arc<StateStore>,
    source: Arc<dyn SourceInspector>,
    host: Arc<dyn HostInspector>,
    max_retries: u32,
}

impl Detector {
    pub fn new(
        state: Arc<StateStore>,
        source: Arc<dyn SourceInspector>,
        host: Arc<dyn HostInspector>,
        max_retries: u32,
    ) -> Self {
        Self {
            state,
            source,
            host,
            max_retries,
        }
    }

    pub fn detect(
        &self,
        resource: &ResourceKey,
        branch: Option<&str>,
        force: bool,
    ) -> Result<Detection> {
        let current = self.state.get(resource, force)?;
        let skipped = || Detection {
            resource: resource.clone(),
            state: current,
            content_version: None,
            outcome: DetectionOutcome::Skipped,
        };

        if current.is_installed() {
            return Ok(skipped());
        }
        let mut retry_count = 0;
        match current {
            ResourceState::Available | ResourceState::NotPlugin if !force => return Ok(skipped()),
            ResourceState::Error => {
                let (recoverable, previous) = self
                    .state
                    .error_context(resource)?
                    .map(|context| (context.recoverable, context.retry_count))
                    .unwrap_or((true, 0));
                if !force && (!recoverable || previous >= self.max_retries) {
                    debug!(resource = %resource, previous, recoverable, "not retrying detection");
                    return Ok(skipped());
                }
                retry_count = previous.saturating_add(1);
            }
            _ => {}
        }

        let metadata = match self.source.inspect(resource, branch) {
            Ok(metadata) => metadata,
            Err(err) => return self.fail(resource, current, retry_count, err),
        };
        let version = Some(metadata.content_version.clone());

        let plugins = match self.host.installed_plugins() {
            Ok(plugins) => plugins,
            Err(err) => return self.fail(resource, current, retry_count, err),
        };
        let known = self.state.tracked_keys()?;
        if let Some(plugin) = Reconciler::host_match(resource, &known, &plugins) {
            let target = ResourceState::installed(plugin.active);
            self.settle(resource, current, target, "found on host")?;
            return Ok(Detection {
                resource: resource.clone(),
                state: target,
                content_version: version,
                outcome: DetectionOutcome::Host,
            });
        }

        let cache = self.state.cache();
        let cached = cache
            .get(resource, &metadata.content_version)?
            .as_ref()
            .and_then(cached_decision);
        if let Some(decision) = cached {
            self.settle(resource, current, decision, "cached decision")?;
            return Ok(Detection {
                resource: resource.clone(),
                state: decision,
                content_version: version,
                outcome: DetectionOutcome::Cached,
            });
        }

        let from = if current.can_transition_to(ResourceState::Checking) {
            self.state.transition(
                resource,
                ResourceState::Checking,
                TransitionContext::with_message("probing source").source("detection"),
                false,
            )?;
            ResourceState::Checking
        } else {
            current
        };

        let decision = match self.source.probe_entry_point(resource, &metadata.branch) {
            Ok(true) => ResourceState::Available,
            Ok(false) => ResourceState::NotPlugin,
            Err(err) => return self.fail(resource, from, retry_count, err),
        };
        self.settle(resource, from, decision, "probed source")?;
        // after the transition, which invalidates the resource's entry
        cache.set(
            resource,
            &metadata.content_version,
            json!({ "state": decision, "branch": metadata.branch }),
        )?;
        info!(resource = %resource, state = %decision, "detection complete");

        Ok(Detection {
            resource: resource.clone(),
            state: decision,
            content_version: version,
            outcome: DetectionOutcome::Probed,
        })
    }

    fn settle(
        &self,
        resource: &ResourceKey,
        from: ResourceState,
        target: ResourceState,
        message: &str,
    ) -> Result<()> {
        if from == target {
            return Ok(());
        }
        let force = !from.can_transition_to(target);
        self.state.transition(
            resource,
            target,
            TransitionContext::with_message(message).source("detection"),
            force,
        )?;
        Ok(())
    }

    fn fail(
        &self,
        resource: &ResourceKey,
        from: ResourceState,
        retry_count: u32,
        err: anyhow::Error,
    ) -> Result<Detection> {
        let message = format!("{err:#}");
        warn!(resource = %resource, retry_count, "detection failed: {message}");
        let context = TransitionContext::with_message(message.clone())
            .source("detection")
            .retry_count(retry_count);
        self.state.transition(
            resource,
            ResourceState::Error,
            context,
            !from.can_transition_to(ResourceState::Error),
        )?;
        Ok(Detection {
            resource: resource.clone(),
            state: ResourceState::Error,
            content_version: None,
            outcome: DetectionOutcome::Failed(message),
        })
    }
}

fn cached_decision(payload: &Value) -> Option<ResourceState> {
    let state = payload.get("state")?.as_str().and_then(ResourceState::parse)?;
    matches!(state, ResourceState::Available | ResourceState::NotPlugin).then_some(state)
}
