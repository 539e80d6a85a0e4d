use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use plugsmith_core::{Clock, ErrorKind, EventType, ResourceKey, ResourceState, TransitionContext};
use plugsmith_state::{HostInspector, LockGuard, LockManager, Reconciler, StateStore};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::entry::EntryPointLocator;
use crate::error::{PipelineError, PipelineResult, PipelineStep};
use crate::extract::{promote_extracted, ArchiveExtractor};
use crate::fs_utils::ConfinedRoots;
use crate::host::{host_identifier, PluginActivator};
use crate::layout::HostLayout;
use crate::receipts::{read_install_receipt, remove_install_receipt, write_install_receipt, InstallReceipt};
use crate::source::{SourceInspector, SourceMetadata, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Started,
    Ok,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub lock_ttl: Duration,
    /// `None` fails immediately on contention.
    pub lock_wait: Option<Duration>,
    pub lock_poll: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(300),
            lock_wait: None,
            lock_poll: Duration::from_secs(1),
        }
    }
}

/// External systems the pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourceInspector>,
    pub transport: Arc<dyn Transport>,
    pub extractor: Arc<dyn ArchiveExtractor>,
    pub host: Arc<dyn HostInspector>,
    pub activator: Arc<dyn PluginActivator>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub resource: ResourceKey,
    pub branch: Option<String>,
    pub activate: bool,
}

impl InstallRequest {
    pub fn new(resource: ResourceKey) -> Self {
        Self {
            resource,
            branch: None,
            activate: false,
        }
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn activate(mut self, activate: bool) -> Self {
        self.activate = activate;
        self
    }
}

#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub resource: ResourceKey,
    pub branch: String,
    pub directory: String,
    pub host_identifier: String,
    pub archive_sha256: String,
    pub state: ResourceState,
    /// Set when the chained activation failed; the install itself stands.
    pub activation_error: Option<PipelineError>,
}

struct Materialized {
    entry_point: String,
    archive_sha256: String,
}

/// Install, activate and deactivate for one resource at a time.
///
/// Every mutating operation runs under the resource's processing lock, which
/// is released on every exit path. A failure after the download has started
/// rolls back everything the install wrote and restores the pre-install
/// state.
pub struct InstallPipeline {
    layout: HostLayout,
    state: Arc<StateStore>,
    locks: Arc<LockManager>,
    collaborators: Collaborators,
    locator: EntryPointLocator,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
}

impl InstallPipeline {
    pub fn new(
        layout: HostLayout,
        state: Arc<StateStore>,
        locks: Arc<LockManager>,
        collaborators: Collaborators,
        locator: EntryPointLocator,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            layout,
            state,
            locks,
            collaborators,
            locator,
            clock,
            config,
        }
    }

    pub fn install(&self, request: &InstallRequest) -> PipelineResult<InstallOutcome> {
        let resource = &request.resource;
        info!(resource = %resource, branch = ?request.branch, "starting install");

        self.progress(resource, PipelineStep::Verify, StepStatus::Started, "inspecting source");
        let metadata = self
            .collaborators
            .source
            .inspect(resource, request.branch.as_deref())
            .map_err(|err| {
                self.failed(PipelineError::new(
                    ErrorKind::VerifyFailure,
                    resource,
                    PipelineStep::Verify,
                    format!("{err:#}"),
                ))
            })?;
        self.progress(
            resource,
            PipelineStep::Verify,
            StepStatus::Ok,
            &format!("branch {} at {}", metadata.branch, metadata.content_version),
        );

        let directory = resource.target_dir_name(&metadata.branch);
        self.progress(resource, PipelineStep::Preflight, StepStatus::Started, &directory);
        self.preflight(resource, &metadata, &directory)
            .map_err(|err| self.failed(err))?;
        self.progress(resource, PipelineStep::Preflight, StepStatus::Ok, &directory);

        let guard = self.lock(resource)?;
        let result = self.install_locked(resource, &metadata, &directory, request.activate);
        self.release(resource, guard);

        if let Ok(outcome) = &result {
            self.progress(resource, PipelineStep::Done, StepStatus::Ok, outcome.state.as_str());
            info!(resource = %resource, state = %outcome.state, directory = %outcome.directory, "install complete");
        }
        result
    }

    pub fn activate(&self, resource: &ResourceKey) -> PipelineResult<ResourceState> {
        self.toggle(resource, true)
    }

    pub fn deactivate(&self, resource: &ResourceKey) -> PipelineResult<ResourceState> {
        self.toggle(resource, false)
    }

    fn toggle(&self, resource: &ResourceKey, active: bool) -> PipelineResult<ResourceState> {
        let guard = self.lock(resource)?;
        let result = self.toggle_locked(resource, active);
        self.release(resource, guard);
        result
    }

    fn toggle_locked(&self, resource: &ResourceKey, active: bool) -> PipelineResult<ResourceState> {
        let step = toggle_step(active);
        let expected = ResourceState::installed(!active);
        let current = self
            .state
            .get(resource, true)
            .map_err(|err| self.failed(PipelineError::backend(resource, step, err)))?;
        if current != expected {
            return Err(self.failed(PipelineError::new(
                ErrorKind::InvalidTransition,
                resource,
                step,
                format!("expected {expected}, found {current}"),
            )));
        }

        let identifier = self
            .identifier_for(resource, step)
            .map_err(|err| self.failed(err))?;
        let state = self.switch_locked(resource, &identifier, active)?;
        self.invalidate(resource);
        Ok(state)
    }

    fn install_locked(
        &self,
        resource: &ResourceKey,
        metadata: &SourceMetadata,
        directory: &str,
        activate: bool,
    ) -> PipelineResult<InstallOutcome> {
        let current = self.state.get(resource, true).map_err(|err| {
            self.failed(PipelineError::backend(resource, PipelineStep::Preflight, err))
        })?;
        if current.is_installed() {
            return Err(self.failed(PipelineError::new(
                ErrorKind::PreflightFailure,
                resource,
                PipelineStep::Preflight,
                format!("already installed ({current})"),
            )));
        }
        let target = self.layout.plugin_dir(directory);
        if target.exists() {
            return Err(self.failed(PipelineError::new(
                ErrorKind::PreflightFailure,
                resource,
                PipelineStep::Preflight,
                format!("target directory already exists: {}", target.display()),
            )));
        }
        let restore = if current == ResourceState::NotPlugin {
            ResourceState::NotPlugin
        } else {
            ResourceState::Available
        };
        if current != ResourceState::Available {
            self.transition(
                resource,
                ResourceState::Available,
                TransitionContext::with_message("preparing install").source("pipeline"),
                PipelineStep::Preflight,
            )
            .map_err(|err| self.failed(err))?;
        }

        let mut owns_target = false;
        let materialized = match self.materialize(resource, metadata, directory, &mut owns_target) {
            Ok(materialized) => materialized,
            Err(err) => {
                let err = self.failed(err);
                self.rollback(resource, directory, restore, owns_target);
                return Err(err);
            }
        };

        let context = TransitionContext::with_message("installed")
            .source("pipeline")
            .detail("directory", directory)
            .detail("entry_point", materialized.entry_point.as_str());
        let installed = match self.state.transition(
            resource,
            ResourceState::InstalledInactive,
            context.clone(),
            false,
        ) {
            Ok(outcome) if outcome.state().is_installed() => Ok(outcome.state()),
            Ok(_) => self
                .state
                .transition(resource, ResourceState::InstalledInactive, context, true)
                .map(|outcome| outcome.state()),
            Err(err) => Err(err),
        };
        let installed = match installed {
            Ok(state) => state,
            Err(err) => {
                let err = self.failed(PipelineError::backend(
                    resource,
                    PipelineStep::LocateEntryPoint,
                    err,
                ));
                self.rollback(resource, directory, restore, true);
                return Err(err);
            }
        };

        let identifier = host_identifier(directory, &materialized.entry_point);
        let mut outcome = InstallOutcome {
            resource: resource.clone(),
            branch: metadata.branch.clone(),
            directory: directory.to_string(),
            host_identifier: identifier.clone(),
            archive_sha256: materialized.archive_sha256,
            state: installed,
            activation_error: None,
        };

        if activate && installed == ResourceState::InstalledInactive {
            match self.switch_locked(resource, &identifier, true) {
                Ok(state) => outcome.state = state,
                Err(err) => outcome.activation_error = Some(err),
            }
        } else {
            self.progress(resource, PipelineStep::Activate, StepStatus::Skipped, &identifier);
        }

        self.invalidate(resource);
        Ok(outcome)
    }

    fn preflight(
        &self,
        resource: &ResourceKey,
        metadata: &SourceMetadata,
        directory: &str,
    ) -> PipelineResult<()> {
        let fail = |message: String| {
            PipelineError::new(ErrorKind::PreflightFailure, resource, PipelineStep::Preflight, message)
        };

        for dir in [self.layout.plugins_dir(), self.layout.upgrade_dir()] {
            fs::create_dir_all(&dir)
                .map_err(|err| fail(format!("failed to create {}: {err}", dir.display())))?;
            probe_writable(&dir).map_err(|err| fail(format!("{err:#}")))?;
        }

        if !self.collaborators.extractor.supports(metadata.archive_type) {
            return Err(fail(format!(
                "no extractor available for {} archives",
                metadata.archive_type.as_str()
            )));
        }

        let target = self.layout.plugin_dir(directory);
        if target.exists() {
            return Err(fail(format!(
                "target directory already exists: {}",
                target.display()
            )));
        }
        Ok(())
    }

    /// Sets `owns_target` once this attempt starts writing `plugins/{directory}`.
    fn materialize(
        &self,
        resource: &ResourceKey,
        metadata: &SourceMetadata,
        directory: &str,
        owns_target: &mut bool,
    ) -> PipelineResult<Materialized> {
        self.progress(resource, PipelineStep::Download, StepStatus::Started, &metadata.archive_url);
        let archive = self.layout.archive_path(directory, metadata.archive_type);
        let (bytes, archive_sha256) =
            self.download(&metadata.archive_url, &archive).map_err(|err| {
                PipelineError::new(
                    ErrorKind::DownloadFailure,
                    resource,
                    PipelineStep::Download,
                    format!("{err:#}"),
                )
            })?;
        self.progress(
            resource,
            PipelineStep::Download,
            StepStatus::Ok,
            &format!("{bytes} bytes, sha256 {archive_sha256}"),
        );

        self.progress(resource, PipelineStep::Extract, StepStatus::Started, directory);
        let target = self.layout.plugin_dir(directory);
        self.extract(&archive, metadata, directory, &target, owns_target)
            .map_err(|err| {
                PipelineError::new(
                    ErrorKind::ExtractFailure,
                    resource,
                    PipelineStep::Extract,
                    format!("{err:#}"),
                )
            })?;
        self.progress(resource, PipelineStep::Extract, StepStatus::Ok, directory);

        self.progress(resource, PipelineStep::LocateEntryPoint, StepStatus::Started, directory);
        let not_found = |message: String| {
            PipelineError::new(
                ErrorKind::EntryPointNotFound,
                resource,
                PipelineStep::LocateEntryPoint,
                message,
            )
        };
        let entry = match self.locator.locate(&target) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                return Err(not_found(format!(
                    "no file in {} carries the '{}' header",
                    target.display(),
                    self.locator.header()
                )));
            }
            Err(err) => return Err(not_found(format!("{err:#}"))),
        };

        let receipt = InstallReceipt {
            key: resource.clone(),
            branch: metadata.branch.clone(),
            content_version: metadata.content_version.clone(),
            archive_url: metadata.archive_url.clone(),
            archive_sha256: archive_sha256.clone(),
            directory: directory.to_string(),
            entry_point: entry.relative.clone(),
            installed_at_unix: self.clock.now_unix(),
        };
        write_install_receipt(&self.layout, &receipt).map_err(|err| {
            PipelineError::backend(resource, PipelineStep::LocateEntryPoint, err)
        })?;
        self.purge_scratch(directory);
        self.progress(resource, PipelineStep::LocateEntryPoint, StepStatus::Ok, &entry.relative);

        Ok(Materialized {
            entry_point: entry.relative,
            archive_sha256,
        })
    }

    fn download(&self, url: &str, archive: &Path) -> Result<(u64, String)> {
        if let Some(parent) = archive.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let part = part_path(archive);
        let bytes = match self.collaborators.transport.download(url, &part) {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = fs::remove_file(&part);
                return Err(err);
            }
        };
        fs::rename(&part, archive).with_context(|| {
            format!("failed to move downloaded archive into place: {}", archive.display())
        })?;
        Ok((bytes, sha256_file(archive)?))
    }

    fn extract(
        &self,
        archive: &Path,
        metadata: &SourceMetadata,
        directory: &str,
        target: &Path,
        owns_target: &mut bool,
    ) -> Result<()> {
        let scratch = self.layout.extraction_scratch_dir(directory);
        ConfinedRoots::for_layout(&self.layout).remove_confined(&scratch)?;
        fs::create_dir_all(&scratch)
            .with_context(|| format!("failed to create {}", scratch.display()))?;
        self.collaborators
            .extractor
            .extract(archive, &scratch, metadata.archive_type)?;
        if target.exists() {
            return Err(anyhow!(
                "target directory appeared during install: {}",
                target.display()
            ));
        }
        *owns_target = true;
        promote_extracted(&scratch, target)
    }

    /// Undoes an install attempt. `plugins/{directory}` is only removed when
    /// the attempt wrote it.
    fn rollback(&self, resource: &ResourceKey, directory: &str, restore: ResourceState, owns_target: bool) {
        self.progress(resource, PipelineStep::Rollback, StepStatus::Started, directory);
        let roots = ConfinedRoots::for_layout(&self.layout);
        let mut problems = Vec::new();

        if owns_target {
            if let Err(err) = roots.remove_confined(&self.layout.plugin_dir(directory)) {
                problems.push(format!("{err:#}"));
            }
        }
        if let Err(err) = roots.purge_prefixed(&self.layout.upgrade_dir(), &scratch_prefix(directory)) {
            problems.push(format!("{err:#}"));
        }
        if let Err(err) = remove_install_receipt(&self.layout, resource) {
            problems.push(format!("{err:#}"));
        }
        let context = TransitionContext::with_message("install rolled back").source("pipeline");
        if let Err(err) = self.state.transition(resource, restore, context, true) {
            problems.push(format!("{err:#}"));
        }
        self.invalidate(resource);

        if problems.is_empty() {
            self.progress(
                resource,
                PipelineStep::Rollback,
                StepStatus::Ok,
                &format!("restored {restore}"),
            );
        } else {
            let message = problems.join("; ");
            warn!(resource = %resource, "rollback incomplete: {message}");
            self.progress(resource, PipelineStep::Rollback, StepStatus::Failed, &message);
        }
    }

    fn switch_locked(
        &self,
        resource: &ResourceKey,
        identifier: &str,
        active: bool,
    ) -> PipelineResult<ResourceState> {
        let step = toggle_step(active);
        self.progress(resource, step, StepStatus::Started, identifier);

        let switched = if active {
            self.collaborators.activator.activate(identifier)
        } else {
            self.collaborators.activator.deactivate(identifier)
        };
        if let Err(err) = switched {
            return Err(self.failed(PipelineError::new(
                ErrorKind::ActivationFailure,
                resource,
                step,
                format!("{err:#}"),
            )));
        }

        let target = ResourceState::installed(active);
        let context = TransitionContext::with_message(format!("{step} {identifier}"))
            .source("pipeline")
            .detail("host_identifier", identifier);
        self.transition(resource, target, context, step)
            .map_err(|err| self.failed(err))?;
        self.progress(resource, step, StepStatus::Ok, identifier);
        Ok(target)
    }

    fn identifier_for(&self, resource: &ResourceKey, step: PipelineStep) -> PipelineResult<String> {
        let receipt = read_install_receipt(&self.layout, resource)
            .map_err(|err| PipelineError::backend(resource, step, err))?;
        if let Some(receipt) = receipt {
            return Ok(receipt.host_identifier());
        }

        let plugins = self
            .collaborators
            .host
            .installed_plugins()
            .map_err(|err| PipelineError::backend(resource, step, err))?;
        let known = self
            .state
            .tracked_keys()
            .map_err(|err| PipelineError::backend(resource, step, err))?;
        Reconciler::host_match(resource, &known, &plugins)
            .map(|plugin| plugin.identifier.clone())
            .ok_or_else(|| {
                PipelineError::new(
                    ErrorKind::ActivationFailure,
                    resource,
                    step,
                    "resource is not present on the host",
                )
            })
    }

    fn transition(
        &self,
        resource: &ResourceKey,
        target: ResourceState,
        context: TransitionContext,
        step: PipelineStep,
    ) -> PipelineResult<()> {
        let outcome = self
            .state
            .transition(resource, target, context, false)
            .map_err(|err| PipelineError::backend(resource, step, err))?;
        if outcome.is_applied() {
            return Ok(());
        }
        Err(PipelineError::new(
            ErrorKind::InvalidTransition,
            resource,
            step,
            format!("cannot move from {} to {target}", outcome.state()),
        ))
    }

    fn lock(&self, resource: &ResourceKey) -> PipelineResult<LockGuard> {
        self.progress(resource, PipelineStep::AcquireLock, StepStatus::Started, self.locks.holder_id());
        let acquired = self.locks.acquire_guard(
            resource,
            self.config.lock_ttl,
            self.config.lock_wait,
            self.config.lock_poll,
        );
        match acquired {
            Ok(Some(guard)) => {
                self.progress(resource, PipelineStep::AcquireLock, StepStatus::Ok, self.locks.holder_id());
                Ok(guard)
            }
            Ok(None) => {
                let holder = self
                    .locks
                    .holder(resource)
                    .ok()
                    .flatten()
                    .map(|lock| lock.holder_id);
                let message = match holder {
                    Some(holder) => format!("processing lock is held by {holder}"),
                    None => "processing lock is held by another operation".to_string(),
                };
                Err(self.failed(PipelineError::new(
                    ErrorKind::LockContention,
                    resource,
                    PipelineStep::AcquireLock,
                    message,
                )))
            }
            Err(err) => Err(self.failed(PipelineError::backend(
                resource,
                PipelineStep::AcquireLock,
                err,
            ))),
        }
    }

    fn release(&self, resource: &ResourceKey, guard: LockGuard) {
        match guard.release() {
            Ok(true) => {
                self.progress(resource, PipelineStep::ReleaseLock, StepStatus::Ok, self.locks.holder_id());
            }
            Ok(false) => {
                warn!(resource = %resource, "processing lock was no longer held at release");
                self.progress(
                    resource,
                    PipelineStep::ReleaseLock,
                    StepStatus::Skipped,
                    "lock was no longer held",
                );
            }
            Err(err) => {
                warn!(resource = %resource, "failed to release processing lock: {err:#}");
                self.progress(
                    resource,
                    PipelineStep::ReleaseLock,
                    StepStatus::Failed,
                    &format!("{err:#}"),
                );
            }
        }
    }

    fn purge_scratch(&self, directory: &str) {
        let roots = ConfinedRoots::for_layout(&self.layout);
        if let Err(err) = roots.purge_prefixed(&self.layout.upgrade_dir(), &scratch_prefix(directory)) {
            warn!(directory, "failed to clean upgrade scratch: {err:#}");
        }
    }

    fn invalidate(&self, resource: &ResourceKey) {
        if let Err(err) = self.state.cache().invalidate(resource) {
            warn!(resource = %resource, "failed to invalidate processing cache: {err:#}");
        }
    }

    fn failed(&self, err: PipelineError) -> PipelineError {
        warn!(resource = %err.resource, step = %err.step, kind = %err.kind, "{}", err.message);
        self.progress(&err.resource, err.step, StepStatus::Failed, &err.message);
        err
    }

    fn progress(&self, resource: &ResourceKey, step: PipelineStep, status: StepStatus, message: &str) {
        info!(resource = %resource, step = %step, status = status.as_str(), "{message}");
        self.state.events().broadcast_for(
            resource,
            EventType::InstallProgress,
            json!({ "step": step.as_str(), "status": status.as_str(), "message": message }),
        );
    }
}

fn toggle_step(active: bool) -> PipelineStep {
    if active {
        PipelineStep::Activate
    } else {
        PipelineStep::Deactivate
    }
}

/// Every upgrade artifact of `directory` starts with this prefix.
fn scratch_prefix(directory: &str) -> String {
    format!("{directory}.")
}

fn part_path(archive: &Path) -> PathBuf {
    let mut name = OsString::from(archive.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

fn probe_writable(dir: &Path) -> Result<()> {
    let probe = dir.join(format!(".plugsmith-probe-{}", std::process::id()));
    fs::write(&probe, b"probe").with_context(|| format!("{} is not writable", dir.display()))?;
    fs::remove_file(&probe)
        .with_context(|| format!("failed to remove write probe: {}", probe.display()))
}

pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to hash {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}
