use super::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use plugsmith_core::{ArchiveType, ErrorKind, EventType, ManualClock, ResourceKey, ResourceState, TransitionContext};
use plugsmith_state::{
    EventBroadcaster, FsKvStore, HostInspector, KvStore, LockManager, ProcessingCache, StateStore,
};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::github::{archive_url, contents_url, parse_repo_info, probe_candidates, ContentEntry};
use crate::receipts::parse_receipt;

const PLUGIN_MAIN: &str = "<?php\n/**\n * Plugin Name: Widget\n * Version: 1.2.0\n */\n";
const ARCHIVE_BYTES: &[u8] = b"PK\x03\x04 widget archive bytes";

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn build_test_layout_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    let sequence = TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "plugsmith-installer-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    path
}

fn test_layout() -> HostLayout {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    HostLayout::new(build_test_layout_path(nanos))
}

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("must create parent dir");
    }
    fs::write(path, content).expect("must write file");
}

fn widget() -> ResourceKey {
    ResourceKey::parse("acme/widget").expect("valid key")
}

fn upgrade_leftovers(layout: &HostLayout, prefix: &str) -> Vec<String> {
    let Ok(entries) = fs::read_dir(layout.upgrade_dir()) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| name.starts_with(prefix))
        .collect()
}

struct FakeSource {
    content_version: Mutex<String>,
    fail_inspect: AtomicBool,
    is_plugin: AtomicBool,
    probe_calls: AtomicUsize,
}

impl Default for FakeSource {
    fn default() -> Self {
        Self {
            content_version: Mutex::new("v1".to_string()),
            fail_inspect: AtomicBool::new(false),
            is_plugin: AtomicBool::new(true),
            probe_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeSource {
    fn set_version(&self, version: &str) {
        *self.content_version.lock().expect("version") = version.to_string();
    }
}

impl SourceInspector for FakeSource {
    fn inspect(&self, resource: &ResourceKey, branch: Option<&str>) -> anyhow::Result<SourceMetadata> {
        if self.fail_inspect.load(Ordering::SeqCst) {
            return Err(anyhow!("repository {resource} was not found"));
        }
        let branch = branch.unwrap_or("main").to_string();
        Ok(SourceMetadata {
            archive_url: format!("https://example.test/{resource}/{branch}.zip"),
            archive_type: ArchiveType::Zip,
            content_version: self.content_version.lock().expect("version").clone(),
            branch,
        })
    }

    fn probe_entry_point(&self, _resource: &ResourceKey, _branch: &str) -> anyhow::Result<bool> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.is_plugin.load(Ordering::SeqCst))
    }
}

struct FakeTransport {
    fail: bool,
}

impl Transport for FakeTransport {
    fn download(&self, _url: &str, dest: &Path) -> anyhow::Result<u64> {
        if self.fail {
            fs::write(dest, b"PK\x03").expect("write partial download");
            return Err(anyhow!("connection reset"));
        }
        fs::write(dest, ARCHIVE_BYTES).expect("write download");
        Ok(ARCHIVE_BYTES.len() as u64)
    }
}

enum ExtractBehavior {
    Tree(Vec<(&'static str, String)>),
    FailAfterPartial,
    /// Extracts the plugin while someone else creates the given target.
    TargetAppears(PathBuf),
}

struct FakeExtractor {
    supported: bool,
    behavior: ExtractBehavior,
}

impl FakeExtractor {
    fn plugin() -> Self {
        Self {
            supported: true,
            behavior: ExtractBehavior::Tree(vec![
                ("widget-main/widget.php", PLUGIN_MAIN.to_string()),
                ("widget-main/readme.txt", "=== Widget ===".to_string()),
            ]),
        }
    }

    fn without_entry_point() -> Self {
        Self {
            supported: true,
            behavior: ExtractBehavior::Tree(vec![(
                "widget-main/index.php",
                "<?php echo 'hello';".to_string(),
            )]),
        }
    }

    fn failing() -> Self {
        Self {
            supported: true,
            behavior: ExtractBehavior::FailAfterPartial,
        }
    }
}

impl ArchiveExtractor for FakeExtractor {
    fn supports(&self, _archive_type: ArchiveType) -> bool {
        self.supported
    }

    fn extract(&self, archive_path: &Path, dst: &Path, _archive_type: ArchiveType) -> anyhow::Result<()> {
        assert!(archive_path.is_file(), "archive must be in place before extraction");
        match &self.behavior {
            ExtractBehavior::Tree(files) => {
                for (relative, content) in files {
                    write_file(&dst.join(relative), content);
                }
                Ok(())
            }
            ExtractBehavior::FailAfterPartial => {
                write_file(&dst.join("widget-main/partial.php"), "<?php");
                Err(anyhow!("unexpected end of archive"))
            }
            ExtractBehavior::TargetAppears(target) => {
                write_file(&dst.join("widget-main/widget.php"), PLUGIN_MAIN);
                write_file(&target.join("keep.txt"), "user data");
                Ok(())
            }
        }
    }
}

struct FailingActivator;

impl PluginActivator for FailingActivator {
    fn activate(&self, identifier: &str) -> anyhow::Result<()> {
        Err(anyhow!("host refused to activate {identifier}"))
    }

    fn deactivate(&self, identifier: &str) -> anyhow::Result<()> {
        Err(anyhow!("host refused to deactivate {identifier}"))
    }
}

struct Harness {
    layout: HostLayout,
    clock: Arc<ManualClock>,
    kv: Arc<dyn KvStore>,
    events: Arc<EventBroadcaster>,
    host: Arc<FsPluginHost>,
    state: Arc<StateStore>,
    locks: Arc<LockManager>,
    source: Arc<FakeSource>,
}

impl Harness {
    fn new() -> Self {
        let layout = test_layout();
        layout.ensure_base_dirs().expect("must create base dirs");
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let kv: Arc<dyn KvStore> = Arc::new(FsKvStore::new(layout.kv_dir(), clock.clone()));
        let events = Arc::new(EventBroadcaster::in_memory(clock.clone()));
        let cache = ProcessingCache::new(kv.clone(), clock.clone(), events.clone(), None);
        let host = Arc::new(FsPluginHost::new(layout.clone(), EntryPointLocator::default()));
        let state = Arc::new(
            StateStore::open(kv.clone(), host.clone(), events.clone(), cache, clock.clone())
                .expect("must open state store"),
        );
        let locks = Arc::new(LockManager::new(
            kv.clone(),
            clock.clone(),
            events.clone(),
            "pipeline-holder",
        ));
        Self {
            layout,
            clock,
            kv,
            events,
            host,
            state,
            locks,
            source: Arc::new(FakeSource::default()),
        }
    }

    fn pipeline_with(
        &self,
        extractor: FakeExtractor,
        transport: FakeTransport,
        activator: Arc<dyn PluginActivator>,
    ) -> InstallPipeline {
        InstallPipeline::new(
            self.layout.clone(),
            self.state.clone(),
            self.locks.clone(),
            Collaborators {
                source: self.source.clone(),
                transport: Arc::new(transport),
                extractor: Arc::new(extractor),
                host: self.host.clone(),
                activator,
            },
            EntryPointLocator::default(),
            self.clock.clone(),
            PipelineConfig::default(),
        )
    }

    fn pipeline(&self) -> InstallPipeline {
        self.pipeline_with(
            FakeExtractor::plugin(),
            FakeTransport { fail: false },
            self.host.clone(),
        )
    }

    fn detector(&self) -> Detector {
        Detector::new(
            self.state.clone(),
            self.source.clone(),
            self.host.clone(),
            DEFAULT_MAX_RETRIES,
        )
    }

    fn state_of(&self, resource: &ResourceKey) -> ResourceState {
        self.state.get(resource, false).expect("state lookup")
    }

    fn force(&self, resource: &ResourceKey, state: ResourceState) {
        self.state
            .transition(resource, state, TransitionContext::default(), true)
            .expect("forced transition");
    }

    fn progress_steps(&self, status: &str) -> Vec<String> {
        self.events
            .get_events_since(0)
            .into_iter()
            .filter(|event| event.event_type == EventType::InstallProgress)
            .filter(|event| event.payload["status"] == json!(status))
            .filter_map(|event| event.payload["step"].as_str().map(str::to_string))
            .collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(self.layout.root());
    }
}

#[test]
fn build_test_layout_path_disambiguates_same_timestamp_calls() {
    assert_ne!(build_test_layout_path(42), build_test_layout_path(42));
}

#[test]
fn install_places_plugin_and_records_receipt() {
    let harness = Harness::new();
    let key = widget();

    let outcome = harness
        .pipeline()
        .install(&InstallRequest::new(key.clone()))
        .expect("install must succeed");

    assert_eq!(outcome.state, ResourceState::InstalledInactive);
    assert_eq!(outcome.directory, "widget-main");
    assert_eq!(outcome.host_identifier, "widget-main/widget.php");
    assert!(outcome.activation_error.is_none());
    assert_eq!(outcome.archive_sha256, hex::encode(Sha256::digest(ARCHIVE_BYTES)));
    assert!(harness.layout.plugin_dir("widget-main").join("widget.php").is_file());
    assert_eq!(harness.state_of(&key), ResourceState::InstalledInactive);

    let receipt = read_install_receipt(&harness.layout, &key)
        .expect("must read receipt")
        .expect("receipt present");
    assert_eq!(receipt.directory, "widget-main");
    assert_eq!(receipt.entry_point, "widget.php");
    assert_eq!(receipt.content_version, "v1");
    assert_eq!(receipt.installed_at_unix, 1_700_000_000);

    assert!(upgrade_leftovers(&harness.layout, "widget-main.").is_empty());
    assert!(harness.locks.holder(&key).expect("holder").is_none());
    assert_eq!(
        harness.host.installed_plugins().expect("host plugins"),
        vec![plugsmith_state::HostPlugin::new("widget-main/widget.php", false).owned_by(key.clone())]
    );

    let ok_steps = harness.progress_steps("ok");
    for step in ["verify", "preflight", "acquire_lock", "download", "extract", "locate_entry_point", "release_lock", "done"] {
        assert!(ok_steps.iter().any(|seen| seen == step), "missing ok step {step}");
    }
}

#[test]
fn install_can_chain_activation() {
    let harness = Harness::new();
    let key = widget();

    let outcome = harness
        .pipeline()
        .install(&InstallRequest::new(key.clone()).activate(true))
        .expect("install must succeed");

    assert_eq!(outcome.state, ResourceState::InstalledActive);
    assert_eq!(harness.state_of(&key), ResourceState::InstalledActive);
    assert!(harness
        .host
        .active_identifiers()
        .expect("active set")
        .contains("widget-main/widget.php"));
}

#[test]
fn extract_failure_rolls_back_completely() {
    let harness = Harness::new();
    let key = widget();
    let pipeline = harness.pipeline_with(
        FakeExtractor::failing(),
        FakeTransport { fail: false },
        harness.host.clone(),
    );

    let err = pipeline
        .install(&InstallRequest::new(key.clone()))
        .expect_err("install must fail");

    assert_eq!(err.kind, ErrorKind::ExtractFailure);
    assert_eq!(err.step, PipelineStep::Extract);
    assert!(err.is_recoverable());
    assert!(!harness.layout.plugin_dir("widget-main").exists());
    assert!(upgrade_leftovers(&harness.layout, "widget-main").is_empty());
    assert!(read_install_receipt(&harness.layout, &key)
        .expect("must read receipt")
        .is_none());
    assert!(harness.locks.holder(&key).expect("holder").is_none());
    assert_eq!(harness.state_of(&key), ResourceState::Available);
    assert!(harness.progress_steps("ok").iter().any(|step| step == "rollback"));
}

#[test]
fn missing_entry_point_rolls_back_to_not_plugin() {
    let harness = Harness::new();
    let key = widget();
    harness.force(&key, ResourceState::NotPlugin);
    let pipeline = harness.pipeline_with(
        FakeExtractor::without_entry_point(),
        FakeTransport { fail: false },
        harness.host.clone(),
    );

    let err = pipeline
        .install(&InstallRequest::new(key.clone()))
        .expect_err("install must fail");

    assert_eq!(err.kind, ErrorKind::EntryPointNotFound);
    assert!(err.message.contains("Plugin Name:"));
    assert!(!harness.layout.plugin_dir("widget-main").exists());
    assert_eq!(harness.state_of(&key), ResourceState::NotPlugin);
}

#[test]
fn download_failure_leaves_no_partial_archive() {
    let harness = Harness::new();
    let key = widget();
    let pipeline = harness.pipeline_with(
        FakeExtractor::plugin(),
        FakeTransport { fail: true },
        harness.host.clone(),
    );

    let err = pipeline
        .install(&InstallRequest::new(key.clone()))
        .expect_err("install must fail");

    assert_eq!(err.kind, ErrorKind::DownloadFailure);
    assert!(err.message.contains("connection reset"));
    assert!(upgrade_leftovers(&harness.layout, "widget-main").is_empty());
    assert_eq!(harness.state_of(&key), ResourceState::Available);
    assert!(harness.locks.holder(&key).expect("holder").is_none());
}

#[test]
fn verify_failure_mutates_nothing() {
    let harness = Harness::new();
    let key = widget();
    harness.source.fail_inspect.store(true, Ordering::SeqCst);

    let err = harness
        .pipeline()
        .install(&InstallRequest::new(key.clone()))
        .expect_err("install must fail");

    assert_eq!(err.kind, ErrorKind::VerifyFailure);
    assert!(!err.is_recoverable());
    assert!(!harness
        .state
        .records()
        .expect("records")
        .contains_key("acme/widget"));
    assert!(harness.locks.holder(&key).expect("holder").is_none());
}

#[test]
fn preflight_rejects_existing_target_directory() {
    let harness = Harness::new();
    let key = widget();
    let sentinel = harness.layout.plugin_dir("widget-main").join("keep.txt");
    write_file(&sentinel, "user data");

    let err = harness
        .pipeline()
        .install(&InstallRequest::new(key.clone()))
        .expect_err("install must fail");

    assert_eq!(err.kind, ErrorKind::PreflightFailure);
    assert!(err.message.contains("already exists"));
    assert!(sentinel.is_file());
    assert!(upgrade_leftovers(&harness.layout, "widget-main").is_empty());
}

#[test]
fn target_created_before_lock_is_rechecked() {
    let harness = Harness::new();
    let key = widget();
    let target = harness.layout.plugin_dir("widget-main");
    let listener_target = target.clone();
    harness.events.subscribe(Box::new(move |event| {
        if event.event_type == EventType::InstallProgress
            && event.payload["step"] == json!("acquire_lock")
            && event.payload["status"] == json!("started")
        {
            write_file(&listener_target.join("keep.txt"), "user data");
        }
    }));

    let err = harness
        .pipeline()
        .install(&InstallRequest::new(key.clone()))
        .expect_err("install must fail");

    assert_eq!(err.kind, ErrorKind::PreflightFailure);
    assert!(err.message.contains("already exists"));
    assert!(target.join("keep.txt").is_file());
    assert!(harness.locks.holder(&key).expect("holder").is_none());
    assert!(upgrade_leftovers(&harness.layout, "widget-main.").is_empty());
}

#[test]
fn rollback_leaves_a_target_it_did_not_create() {
    let harness = Harness::new();
    let key = widget();
    let target = harness.layout.plugin_dir("widget-main");
    let pipeline = harness.pipeline_with(
        FakeExtractor {
            supported: true,
            behavior: ExtractBehavior::TargetAppears(target.clone()),
        },
        FakeTransport { fail: false },
        harness.host.clone(),
    );

    let err = pipeline
        .install(&InstallRequest::new(key.clone()))
        .expect_err("install must fail");

    assert_eq!(err.kind, ErrorKind::ExtractFailure);
    assert!(err.message.contains("appeared during install"));
    assert!(target.join("keep.txt").is_file());
    assert!(!target.join("widget.php").exists());
    assert!(upgrade_leftovers(&harness.layout, "widget-main.").is_empty());
    assert!(read_install_receipt(&harness.layout, &key).expect("receipt").is_none());
    assert_eq!(harness.state_of(&key), ResourceState::Available);
    assert!(harness.locks.holder(&key).expect("holder").is_none());
}

#[test]
fn preflight_requires_extractor_support() {
    let harness = Harness::new();
    let pipeline = harness.pipeline_with(
        FakeExtractor {
            supported: false,
            behavior: ExtractBehavior::FailAfterPartial,
        },
        FakeTransport { fail: false },
        harness.host.clone(),
    );

    let err = pipeline
        .install(&InstallRequest::new(widget()))
        .expect_err("install must fail");
    assert_eq!(err.kind, ErrorKind::PreflightFailure);
    assert!(err.message.contains("no extractor available for zip"));
}

#[test]
fn lock_contention_fails_without_side_effects() {
    let harness = Harness::new();
    let key = widget();
    let other = LockManager::new(
        harness.kv.clone(),
        harness.clock.clone(),
        harness.events.clone(),
        "other-holder",
    );
    assert!(other
        .acquire(&key, std::time::Duration::from_secs(300))
        .expect("acquire"));

    let err = harness
        .pipeline()
        .install(&InstallRequest::new(key.clone()))
        .expect_err("install must fail");

    assert_eq!(err.kind, ErrorKind::LockContention);
    assert!(err.message.contains("other-holder"));
    assert!(err.is_recoverable());
    assert!(err.hint().is_some());
    assert!(!harness.layout.plugin_dir("widget-main").exists());
    assert_eq!(
        other.holder(&key).expect("holder").map(|lock| lock.holder_id),
        Some("other-holder".to_string())
    );
}

#[test]
fn installed_resource_is_not_reinstalled() {
    let harness = Harness::new();
    let key = widget();
    let pipeline = harness.pipeline();
    pipeline
        .install(&InstallRequest::new(key.clone()))
        .expect("first install");

    let err = pipeline
        .install(&InstallRequest::new(key.clone()).branch("dev"))
        .expect_err("second install must fail");

    assert_eq!(err.kind, ErrorKind::PreflightFailure);
    assert!(err.message.contains("already installed"));
    assert!(!harness.layout.plugin_dir("widget-dev").exists());
    assert!(harness.locks.holder(&key).expect("holder").is_none());
    assert_eq!(harness.state_of(&key), ResourceState::InstalledInactive);
}

#[test]
fn failed_chained_activation_keeps_install() {
    let harness = Harness::new();
    let key = widget();
    let pipeline = harness.pipeline_with(
        FakeExtractor::plugin(),
        FakeTransport { fail: false },
        Arc::new(FailingActivator),
    );

    let outcome = pipeline
        .install(&InstallRequest::new(key.clone()).activate(true))
        .expect("install itself succeeds");

    assert_eq!(outcome.state, ResourceState::InstalledInactive);
    let activation_error = outcome.activation_error.expect("activation error");
    assert_eq!(activation_error.kind, ErrorKind::ActivationFailure);
    assert_eq!(activation_error.step, PipelineStep::Activate);
    assert_eq!(harness.state_of(&key), ResourceState::InstalledInactive);
    assert!(harness.layout.plugin_dir("widget-main").join("widget.php").is_file());
}

#[test]
fn activate_and_deactivate_round_trip() {
    let harness = Harness::new();
    let key = widget();
    let pipeline = harness.pipeline();
    pipeline
        .install(&InstallRequest::new(key.clone()))
        .expect("install");

    assert_eq!(pipeline.activate(&key).expect("activate"), ResourceState::InstalledActive);
    assert_eq!(harness.state_of(&key), ResourceState::InstalledActive);
    assert!(harness
        .host
        .active_identifiers()
        .expect("active set")
        .contains("widget-main/widget.php"));

    let err = pipeline.activate(&key).expect_err("already active");
    assert_eq!(err.kind, ErrorKind::InvalidTransition);

    assert_eq!(
        pipeline.deactivate(&key).expect("deactivate"),
        ResourceState::InstalledInactive
    );
    assert!(harness.host.active_identifiers().expect("active set").is_empty());
    assert!(harness.locks.holder(&key).expect("holder").is_none());
}

#[test]
fn sibling_plugin_on_host_is_not_claimed() {
    let harness = Harness::new();
    let key = widget();
    write_file(
        &harness.layout.plugin_dir("widget-pro-main").join("widget-pro.php"),
        PLUGIN_MAIN,
    );

    assert_eq!(harness.state.get(&key, true).expect("first contact"), ResourceState::Unknown);

    let pipeline = harness.pipeline();
    let outcome = pipeline
        .install(&InstallRequest::new(key.clone()))
        .expect("install next to sibling");
    assert_eq!(outcome.directory, "widget-main");
    assert_eq!(pipeline.activate(&key).expect("activate"), ResourceState::InstalledActive);

    let active = harness.host.active_identifiers().expect("active set");
    assert!(active.contains("widget-main/widget.php"));
    assert!(!active.contains("widget-pro-main/widget-pro.php"));

    let report = harness.state.reconcile_all().expect("reconcile");
    assert!(report.corrected.is_empty());
}

#[test]
fn fs_host_marks_plugins_owned_by_receipts() {
    let harness = Harness::new();
    let key = widget();
    harness
        .pipeline()
        .install(&InstallRequest::new(key.clone()))
        .expect("install");
    write_file(&harness.layout.plugin_dir("widget-pro").join("widget-pro.php"), PLUGIN_MAIN);

    let plugins = harness.host.installed_plugins().expect("plugins");
    let owner_of = |identifier: &str| {
        plugins
            .iter()
            .find(|plugin| plugin.identifier == identifier)
            .and_then(|plugin| plugin.owner.clone())
    };
    assert_eq!(owner_of("widget-main/widget.php"), Some(key));
    assert_eq!(owner_of("widget-pro/widget-pro.php"), None);
}

#[test]
fn activate_requires_installed_inactive() {
    let harness = Harness::new();
    let key = widget();
    harness.force(&key, ResourceState::Available);

    let err = harness.pipeline().activate(&key).expect_err("not installed");
    assert_eq!(err.kind, ErrorKind::InvalidTransition);
    assert!(err.message.contains("found available"));
    assert_eq!(harness.state_of(&key), ResourceState::Available);
    assert!(harness.locks.holder(&key).expect("holder").is_none());
}

#[test]
fn activation_failure_leaves_state_unchanged() {
    let harness = Harness::new();
    let key = widget();
    harness
        .pipeline()
        .install(&InstallRequest::new(key.clone()))
        .expect("install");
    let failing = harness.pipeline_with(
        FakeExtractor::plugin(),
        FakeTransport { fail: false },
        Arc::new(FailingActivator),
    );

    let err = failing.activate(&key).expect_err("activation must fail");
    assert_eq!(err.kind, ErrorKind::ActivationFailure);
    assert!(!err.is_recoverable());
    assert_eq!(harness.state_of(&key), ResourceState::InstalledInactive);
    assert!(harness.locks.holder(&key).expect("holder").is_none());
}

#[test]
fn install_invalidates_processing_cache() {
    let harness = Harness::new();
    let key = widget();
    harness.force(&key, ResourceState::Available);
    harness
        .state
        .cache()
        .set(&key, "v1", json!({ "state": "available" }))
        .expect("seed cache");

    harness
        .pipeline()
        .install(&InstallRequest::new(key.clone()))
        .expect("install");
    assert!(harness.state.cache().entry(&key).expect("entry").is_none());
}

#[test]
fn remove_confined_refuses_paths_outside_roots() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create base dirs");
    let roots = ConfinedRoots::for_layout(&layout);

    let outside = layout.root().join("precious.txt");
    write_file(&outside, "keep");
    assert!(roots.remove_confined(&outside).is_err());
    assert!(outside.is_file());

    assert!(roots.remove_confined(&layout.plugins_dir()).is_err());
    assert!(layout.plugins_dir().is_dir());

    let escaped = layout.plugins_dir().join("../precious.txt");
    assert!(roots.remove_confined(&escaped).is_err());
    assert!(outside.is_file());

    assert!(!roots
        .remove_confined(&layout.plugin_dir("missing"))
        .expect("missing path is a no-op"));

    let inside = layout.plugin_dir("widget-main").join("widget.php");
    write_file(&inside, PLUGIN_MAIN);
    assert!(roots
        .remove_confined(&layout.plugin_dir("widget-main"))
        .expect("must remove"));
    assert!(!layout.plugin_dir("widget-main").exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[cfg(unix)]
#[test]
fn remove_confined_refuses_symlink_escape() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create base dirs");
    let roots = ConfinedRoots::for_layout(&layout);
    let outside = layout.root().join("outside");
    write_file(&outside.join("data.txt"), "keep");
    let link = layout.plugin_dir("evil");
    std::os::unix::fs::symlink(&outside, &link).expect("must create symlink");

    assert!(roots.remove_confined(&link).is_err());
    assert!(outside.join("data.txt").is_file());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn purge_prefixed_keeps_other_resources() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create base dirs");
    let roots = ConfinedRoots::for_layout(&layout);
    write_file(&layout.upgrade_dir().join("widget-main.zip"), "zip");
    write_file(&layout.upgrade_dir().join("widget-main.extract/a.php"), "a");
    write_file(&layout.upgrade_dir().join("widget-main-2.zip"), "other");

    let removed = roots
        .purge_prefixed(&layout.upgrade_dir(), "widget-main.")
        .expect("must purge");
    assert_eq!(removed.len(), 2);
    assert_eq!(upgrade_leftovers(&layout, "widget-main"), vec!["widget-main-2.zip".to_string()]);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn promote_extracted_unwraps_single_top_level_directory() {
    let layout = test_layout();
    let wrapped = layout.root().join("wrapped");
    write_file(&wrapped.join("widget-main/widget.php"), PLUGIN_MAIN);
    let flat = layout.root().join("flat");
    write_file(&flat.join("widget.php"), PLUGIN_MAIN);
    write_file(&flat.join("readme.txt"), "readme");

    promote_extracted(&wrapped, &layout.root().join("out-wrapped")).expect("promote wrapped");
    promote_extracted(&flat, &layout.root().join("out-flat")).expect("promote flat");

    assert!(layout.root().join("out-wrapped/widget.php").is_file());
    assert!(layout.root().join("out-flat/widget.php").is_file());
    assert!(layout.root().join("out-flat/readme.txt").is_file());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn locator_prefers_top_level_entry_points() {
    let layout = test_layout();
    let dir = layout.root().join("plugin");
    write_file(&dir.join("readme.php"), "<?php // nothing here");
    write_file(&dir.join("main.php"), PLUGIN_MAIN);
    write_file(&dir.join("inner/other.php"), PLUGIN_MAIN);

    let found = EntryPointLocator::default()
        .locate(&dir)
        .expect("locate")
        .expect("entry point");
    assert_eq!(found.relative, "main.php");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn locator_searches_one_nested_level() {
    let layout = test_layout();
    let dir = layout.root().join("plugin");
    write_file(&dir.join("index.php"), "<?php");
    write_file(&dir.join("src/widget.php"), "<?php\n/* plugin name: lower case */");
    write_file(&dir.join("src/deeper/buried.php"), PLUGIN_MAIN);

    let found = EntryPointLocator::default()
        .locate(&dir)
        .expect("locate")
        .expect("entry point");
    assert_eq!(found.relative, "src/widget.php");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn locator_ignores_late_headers_and_other_extensions() {
    let layout = test_layout();
    let dir = layout.root().join("plugin");
    let late = format!("<?php\n{}\n/* Plugin Name: Late */", "x".repeat(DEFAULT_SCAN_LIMIT));
    write_file(&dir.join("late.php"), &late);
    write_file(&dir.join("notes.txt"), PLUGIN_MAIN);

    assert!(EntryPointLocator::default()
        .locate(&dir)
        .expect("locate")
        .is_none());

    let text_locator = EntryPointLocator::new(DEFAULT_HEADER, [".TXT"]);
    assert_eq!(
        text_locator
            .locate(&dir)
            .expect("locate")
            .map(|entry| entry.relative),
        Some("notes.txt".to_string())
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn fs_host_lists_plugins_and_toggles_activation() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create base dirs");
    write_file(&layout.plugin_dir("widget-main").join("widget.php"), PLUGIN_MAIN);
    write_file(&layout.plugin_dir("assets").join("style.css"), "body {}");
    let host = FsPluginHost::new(layout.clone(), EntryPointLocator::default());

    host.activate("widget-main/widget.php").expect("activate");
    let plugins = host.installed_plugins().expect("plugins");
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0].identifier, "widget-main/widget.php");
    assert!(plugins[0].active);

    assert!(host.activate("gadget/gadget.php").is_err());
    host.deactivate("widget-main/widget.php").expect("deactivate");
    assert!(!host.installed_plugins().expect("plugins")[0].active);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn receipt_round_trip_and_listing() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create base dirs");
    let receipt = InstallReceipt {
        key: widget(),
        branch: "main".to_string(),
        content_version: "main@2026-01-02T03:04:05Z".to_string(),
        archive_url: "https://github.com/acme/widget/archive/refs/heads/main.zip".to_string(),
        archive_sha256: "ab".repeat(32),
        directory: "widget-main".to_string(),
        entry_point: "widget.php".to_string(),
        installed_at_unix: 42,
    };
    let other = InstallReceipt {
        key: ResourceKey::parse("acme/gadget").expect("key"),
        directory: "gadget-main".to_string(),
        entry_point: "gadget.php".to_string(),
        ..receipt.clone()
    };

    let path = write_install_receipt(&layout, &receipt).expect("must write receipt");
    assert!(path.ends_with("acme__widget.receipt"));
    write_install_receipt(&layout, &other).expect("must write receipt");

    assert_eq!(
        read_install_receipt(&layout, &widget()).expect("read"),
        Some(receipt.clone())
    );
    let all = read_install_receipts(&layout).expect("read all");
    assert_eq!(
        all.iter().map(|r| r.key.to_string()).collect::<Vec<_>>(),
        vec!["acme/gadget", "acme/widget"]
    );
    assert_eq!(receipt.host_identifier(), "widget-main/widget.php");

    assert!(remove_install_receipt(&layout, &widget()).expect("remove"));
    assert!(!remove_install_receipt(&layout, &widget()).expect("second remove"));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn parse_receipt_requires_identity_fields() {
    let err = parse_receipt("branch=main\ndirectory=widget-main\n").expect_err("missing key");
    assert!(err.to_string().contains("missing key"));

    let parsed = parse_receipt(
        "key=acme/widget\nbranch=main\ndirectory=widget-main\nentry_point=widget.php\ninstalled_at_unix=7\nfuture_field=x\n",
    )
    .expect("minimal receipt");
    assert_eq!(parsed.installed_at_unix, 7);
    assert!(parsed.archive_sha256.is_empty());
}

#[test]
fn pipeline_error_classification_and_display() {
    let err = PipelineError::new(
        ErrorKind::LockContention,
        &widget(),
        PipelineStep::AcquireLock,
        "held by 42-abc",
    );
    assert_eq!(
        err.to_string(),
        "acme/widget: acquire_lock failed (lock-contention): held by 42-abc"
    );
    assert!(err.is_recoverable());

    for kind in [ErrorKind::DownloadFailure, ErrorKind::ExtractFailure, ErrorKind::EntryPointNotFound] {
        assert!(PipelineError::new(kind, &widget(), PipelineStep::Extract, "x").is_recoverable());
    }
    for kind in [ErrorKind::VerifyFailure, ErrorKind::PreflightFailure, ErrorKind::ActivationFailure, ErrorKind::Backend] {
        assert!(!PipelineError::new(kind, &widget(), PipelineStep::Verify, "x").is_recoverable());
    }
    for kind in [ErrorKind::Backend, ErrorKind::ReconciliationMismatch] {
        assert!(PipelineError::new(kind, &widget(), PipelineStep::Verify, "x").hint().is_none());
    }
    for kind in [ErrorKind::LockContention, ErrorKind::ExtractFailure, ErrorKind::ActivationFailure] {
        assert_eq!(
            PipelineError::new(kind, &widget(), PipelineStep::Verify, "x").is_recoverable(),
            kind.is_recoverable()
        );
    }
}

#[test]
fn detection_probes_once_per_content_version() {
    let harness = Harness::new();
    let key = widget();
    let detector = harness.detector();

    let first = detector.detect(&key, None, false).expect("detect");
    assert_eq!(first.state, ResourceState::Available);
    assert_eq!(first.outcome, DetectionOutcome::Probed);
    assert_eq!(first.content_version.as_deref(), Some("v1"));

    let again = detector.detect(&key, None, true).expect("detect");
    assert_eq!(again.outcome, DetectionOutcome::Cached);
    assert_eq!(harness.source.probe_calls.load(Ordering::SeqCst), 1);

    harness.source.set_version("v2");
    let changed = detector.detect(&key, None, true).expect("detect");
    assert_eq!(changed.outcome, DetectionOutcome::Probed);
    assert_eq!(harness.source.probe_calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.state_of(&key), ResourceState::Available);
}

#[test]
fn detection_skips_settled_states_unless_forced() {
    let harness = Harness::new();
    let key = widget();
    harness.source.is_plugin.store(false, Ordering::SeqCst);
    let detector = harness.detector();

    assert_eq!(
        detector.detect(&key, None, false).expect("detect").state,
        ResourceState::NotPlugin
    );
    let skipped = detector.detect(&key, None, false).expect("detect");
    assert_eq!(skipped.outcome, DetectionOutcome::Skipped);
    assert_eq!(harness.source.probe_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn detection_failures_count_retries_until_the_limit() {
    let harness = Harness::new();
    let key = widget();
    harness.source.fail_inspect.store(true, Ordering::SeqCst);
    let detector = harness.detector();

    for expected_retry in 0..=DEFAULT_MAX_RETRIES {
        let detection = detector.detect(&key, None, false).expect("detect");
        assert!(matches!(detection.outcome, DetectionOutcome::Failed(_)));
        let context = harness
            .state
            .error_context(&key)
            .expect("error context")
            .expect("error context present");
        assert_eq!(context.retry_count, expected_retry);
        assert_eq!(context.source, "detection");
    }

    let exhausted = detector.detect(&key, None, false).expect("detect");
    assert_eq!(exhausted.outcome, DetectionOutcome::Skipped);
    assert_eq!(exhausted.state, ResourceState::Error);

    harness.source.fail_inspect.store(false, Ordering::SeqCst);
    let forced = detector.detect(&key, None, true).expect("detect");
    assert_eq!(forced.state, ResourceState::Available);
    assert!(harness.state.error_context(&key).expect("error context").is_none());
}

#[test]
fn detection_adopts_host_install() {
    let harness = Harness::new();
    let key = widget();
    harness.force(&key, ResourceState::NotPlugin);
    write_file(&harness.layout.plugin_dir("widget").join("widget.php"), PLUGIN_MAIN);

    let detection = harness.detector().detect(&key, None, true).expect("detect");
    assert_eq!(detection.outcome, DetectionOutcome::Host);
    assert_eq!(detection.state, ResourceState::InstalledInactive);
    assert_eq!(harness.state_of(&key), ResourceState::InstalledInactive);
    assert_eq!(harness.source.probe_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn layout_paths_follow_directory_names() {
    let layout = HostLayout::new("/srv/plugsmith");
    assert_eq!(
        layout.archive_path("widget-main", ArchiveType::TarGz),
        PathBuf::from("/srv/plugsmith/upgrade/widget-main.tar.gz")
    );
    assert_eq!(
        layout.extraction_scratch_dir("widget-main"),
        PathBuf::from("/srv/plugsmith/upgrade/widget-main.extract")
    );
    assert_eq!(
        layout.receipt_path(&widget()),
        PathBuf::from("/srv/plugsmith/state/installed/acme__widget.receipt")
    );
}

#[test]
fn sha256_file_matches_digest() {
    let layout = test_layout();
    let path = layout.root().join("archive.zip");
    fs::create_dir_all(layout.root()).expect("must create root");
    fs::write(&path, ARCHIVE_BYTES).expect("must write archive");

    assert_eq!(
        crate::pipeline::sha256_file(&path).expect("hash"),
        hex::encode(Sha256::digest(ARCHIVE_BYTES))
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn github_urls_target_branch_archives() {
    let key = widget();
    assert_eq!(
        archive_url("https://github.com/", &key, "main").expect("archive url"),
        "https://github.com/acme/widget/archive/refs/heads/main.zip"
    );
    assert_eq!(
        contents_url("https://api.github.com", &key, "dev").expect("contents url"),
        "https://api.github.com/repos/acme/widget/contents?ref=dev"
    );
    assert_eq!(
        contents_url("https://ghe.example/api/v3/", &key, "dev").expect("contents url"),
        "https://ghe.example/api/v3/repos/acme/widget/contents?ref=dev"
    );
}

#[test]
fn github_urls_encode_unusual_branch_names() {
    let key = widget();
    assert_eq!(
        contents_url("https://api.github.com", &key, "fix&patch #2").expect("contents url"),
        "https://api.github.com/repos/acme/widget/contents?ref=fix%26patch+%232"
    );
    assert_eq!(
        archive_url("https://github.com", &key, "feature/new ui#2").expect("archive url"),
        "https://github.com/acme/widget/archive/refs/heads/feature/new%20ui%232.zip"
    );
    assert!(archive_url("not a url", &key, "main").is_err());
}

#[test]
fn github_repo_info_reads_default_branch_and_push_marker() {
    let info = parse_repo_info(
        r#"{"name":"widget","default_branch":"trunk","pushed_at":"2026-01-02T03:04:05Z"}"#,
    )
    .expect("repo info");
    assert_eq!(info.default_branch, "trunk");
    assert_eq!(info.pushed_at.as_deref(), Some("2026-01-02T03:04:05Z"));
    assert!(parse_repo_info(r#"{"name":"widget"}"#).is_err());
}

#[test]
fn github_probe_candidates_keep_matching_files_only() {
    let entries: Vec<ContentEntry> = serde_json::from_str(
        r#"[
            {"name":"widget.php","type":"file","download_url":"https://raw.test/widget.php"},
            {"name":"README.md","type":"file","download_url":"https://raw.test/README.md"},
            {"name":"includes","type":"dir","download_url":null},
            {"name":"uninstall.PHP","type":"file","download_url":"https://raw.test/uninstall.PHP"}
        ]"#,
    )
    .expect("entries");
    assert_eq!(
        probe_candidates(&EntryPointLocator::default(), &entries),
        vec!["https://raw.test/widget.php", "https://raw.test/uninstall.PHP"]
    );
}
