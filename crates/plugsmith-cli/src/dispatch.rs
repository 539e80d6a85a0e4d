use std::io;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use plugsmith_core::{Clock, ResourceKey, SystemClock};
use plugsmith_installer::{
    default_root, read_install_receipts, CommandExtractor, Collaborators, Detector, FsPluginHost,
    GithubSource, HostLayout, HttpTransport, InstallPipeline, InstallRequest,
};
use plugsmith_state::{
    default_holder_id, EventBroadcaster, FsKvStore, KvStore, LockManager, ProcessingCache,
    StateStore,
};
use serde_json::json;
use tracing::debug;

use crate::completion::write_completions_script;
use crate::config::Config;
use crate::render::{
    current_output_style, format_detection_lines, format_event_line, format_install_outcome_lines,
    format_list_lines, format_reconcile_lines, format_status_lines, render_status_line,
    InstallProgress, OutputStyle,
};
use crate::{init_logging, Cli, Commands};

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    if let Commands::Completion { shell } = cli.command {
        let mut stdout = io::stdout().lock();
        return write_completions_script(shell, &mut stdout);
    }

    let root = match cli.root {
        Some(root) => root,
        None => default_root()?,
    };
    let layout = HostLayout::new(root);
    let config_path = cli.config.unwrap_or_else(|| layout.config_path());
    let config = Config::load(&config_path)?;
    init_logging(cli.verbose, config.json_logs());
    debug!(root = %layout.root().display(), config = %config_path.display(), "starting");

    let style = current_output_style();
    let runtime = Runtime::open(layout, config, cli.token)?;
    let lines = match cli.command {
        Commands::Status { key, refresh, json } => {
            runtime.status_lines(&parse_key(&key)?, refresh, json)?
        }
        Commands::Check { key, branch, force } => {
            runtime.check_lines(&parse_key(&key)?, branch.as_deref(), force)?
        }
        Commands::Install {
            key,
            branch,
            activate,
            wait,
        } => runtime.install_lines(&parse_key(&key)?, branch.as_deref(), activate, wait, style)?,
        Commands::Activate { key } => runtime.toggle_lines(&parse_key(&key)?, true, style)?,
        Commands::Deactivate { key } => runtime.toggle_lines(&parse_key(&key)?, false, style)?,
        Commands::Reconcile => runtime.reconcile_lines(style)?,
        Commands::List { json } => runtime.list_lines(json)?,
        Commands::Events {
            since,
            resource,
            json,
        } => {
            let resource = resource.as_deref().map(parse_key).transpose()?;
            runtime.event_lines(since, resource.as_ref(), json)?
        }
        Commands::Unlock { key, force } => runtime.unlock_lines(&parse_key(&key)?, force, style)?,
        Commands::CacheClear { key } => runtime.cache_clear_lines(&parse_key(&key)?, style)?,
        Commands::Completion { .. } => Vec::new(),
    };

    for line in lines {
        println!("{line}");
    }
    Ok(())
}

pub(crate) fn parse_key(input: &str) -> Result<ResourceKey> {
    ResourceKey::parse(input).with_context(|| format!("invalid resource key '{input}'"))
}

/// Everything the commands share, wired over the filesystem backend.
pub(crate) struct Runtime {
    layout: HostLayout,
    config: Config,
    token: Option<String>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBroadcaster>,
    host: Arc<FsPluginHost>,
    state: Arc<StateStore>,
    locks: Arc<LockManager>,
}

impl Runtime {
    pub(crate) fn open(layout: HostLayout, config: Config, token: Option<String>) -> Result<Self> {
        layout.ensure_base_dirs()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let kv: Arc<dyn KvStore> = Arc::new(FsKvStore::new(layout.kv_dir(), clock.clone()));
        let events = Arc::new(if config.events.persist {
            EventBroadcaster::persistent(kv.clone(), clock.clone())?
        } else {
            EventBroadcaster::in_memory(clock.clone())
        });
        let cache = ProcessingCache::new(kv.clone(), clock.clone(), events.clone(), config.cache_ttl());
        let host = Arc::new(FsPluginHost::new(layout.clone(), config.locator()));
        let state = Arc::new(StateStore::open(
            kv.clone(),
            host.clone(),
            events.clone(),
            cache,
            clock.clone(),
        )?);
        let locks = Arc::new(LockManager::new(
            kv,
            clock.clone(),
            events.clone(),
            default_holder_id(),
        ));

        Ok(Self {
            layout,
            config,
            token,
            clock,
            events,
            host,
            state,
            locks,
        })
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    #[cfg(test)]
    pub(crate) fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    fn source(&self) -> Result<Arc<GithubSource>> {
        let settings = self.config.github_settings(self.token.clone());
        Ok(Arc::new(GithubSource::new(settings, self.config.locator())?))
    }

    fn pipeline(&self, wait: Option<u64>) -> Result<InstallPipeline> {
        let settings = self.config.github_settings(self.token.clone());
        let collaborators = Collaborators {
            source: self.source()?,
            transport: Arc::new(HttpTransport::new(&settings)?),
            extractor: Arc::new(CommandExtractor),
            host: self.host.clone(),
            activator: self.host.clone(),
        };
        Ok(InstallPipeline::new(
            self.layout.clone(),
            self.state.clone(),
            self.locks.clone(),
            collaborators,
            self.config.locator(),
            self.clock.clone(),
            self.config.pipeline_config(wait),
        ))
    }

    pub(crate) fn status_lines(
        &self,
        key: &ResourceKey,
        refresh: bool,
        json: bool,
    ) -> Result<Vec<String>> {
        let state = self.state.get(key, refresh)?;
        let error = self.state.error_context(key)?;
        if json {
            let value = json!({ "key": key.to_string(), "state": state, "error": error });
            return Ok(vec![serde_json::to_string_pretty(&value)?]);
        }
        Ok(format_status_lines(key, state, error.as_ref()))
    }

    fn check_lines(&self, key: &ResourceKey, branch: Option<&str>, force: bool) -> Result<Vec<String>> {
        let detector = Detector::new(
            self.state.clone(),
            self.source()?,
            self.host.clone(),
            self.config.detection.max_retries,
        );
        let detection = detector.detect(key, self.config.branch(branch), force)?;
        Ok(format_detection_lines(&detection))
    }

    fn install_lines(
        &self,
        key: &ResourceKey,
        branch: Option<&str>,
        activate: bool,
        wait: Option<u64>,
        style: OutputStyle,
    ) -> Result<Vec<String>> {
        let pipeline = self.pipeline(wait)?;
        let mut request = InstallRequest::new(key.clone()).activate(activate);
        if let Some(branch) = self.config.branch(branch) {
            request = request.branch(branch);
        }

        let progress = InstallProgress::attach(&self.events, style, key);
        let result = pipeline.install(&request);
        progress.finish();
        let outcome = result?;

        let lines = format_install_outcome_lines(&outcome, style);
        if let Some(err) = outcome.activation_error {
            for line in lines {
                println!("{line}");
            }
            return Err(err.into());
        }
        Ok(lines)
    }

    fn toggle_lines(&self, key: &ResourceKey, active: bool, style: OutputStyle) -> Result<Vec<String>> {
        let pipeline = self.pipeline(None)?;
        let (verb, state) = if active {
            ("activated", pipeline.activate(key)?)
        } else {
            ("deactivated", pipeline.deactivate(key)?)
        };
        Ok(vec![render_status_line(
            style,
            "ok",
            &format!("{verb} {key} ({state})"),
        )])
    }

    pub(crate) fn reconcile_lines(&self, style: OutputStyle) -> Result<Vec<String>> {
        let report = self.state.reconcile_all()?;
        Ok(format_reconcile_lines(&report, style))
    }

    pub(crate) fn list_lines(&self, json: bool) -> Result<Vec<String>> {
        let records = self.state.records()?;
        let receipts = read_install_receipts(&self.layout)?;
        if json {
            let entries = records
                .iter()
                .map(|(key, record)| {
                    let receipt = receipts.iter().find(|receipt| receipt.key.to_string() == *key);
                    json!({
                        "key": key,
                        "state": record.state,
                        "updated_at_unix": record.updated_at_unix,
                        "directory": receipt.map(|receipt| receipt.directory.clone()),
                        "content_version": receipt.map(|receipt| receipt.content_version.clone()),
                    })
                })
                .collect::<Vec<_>>();
            return Ok(vec![serde_json::to_string_pretty(&entries)?]);
        }
        Ok(format_list_lines(&records, &receipts))
    }

    pub(crate) fn event_lines(
        &self,
        since: u64,
        resource: Option<&ResourceKey>,
        json: bool,
    ) -> Result<Vec<String>> {
        let events = match resource {
            Some(resource) => self
                .events
                .resource_events(resource)
                .into_iter()
                .filter(|event| event.id > since)
                .collect(),
            None => self.events.get_events_since(since),
        };
        if json {
            return events
                .iter()
                .map(|event| serde_json::to_string(event).context("failed to encode event"))
                .collect();
        }
        Ok(events.iter().map(format_event_line).collect())
    }

    pub(crate) fn unlock_lines(
        &self,
        key: &ResourceKey,
        force: bool,
        style: OutputStyle,
    ) -> Result<Vec<String>> {
        let holder = self.locks.holder(key)?;
        if self.locks.release(key, force)? {
            let previous = holder
                .map(|lock| lock.holder_id)
                .unwrap_or_else(|| "expired".to_string());
            return Ok(vec![render_status_line(
                style,
                "ok",
                &format!("released lock on {key} (holder {previous})"),
            )]);
        }
        match holder {
            Some(lock) => Err(anyhow!(
                "lock on {key} is held by {}; pass --force to release it",
                lock.holder_id
            )),
            None => Ok(vec![render_status_line(
                style,
                "step",
                &format!("no lock held on {key}"),
            )]),
        }
    }

    pub(crate) fn cache_clear_lines(&self, key: &ResourceKey, style: OutputStyle) -> Result<Vec<String>> {
        let message = if self.state.cache().invalidate(key)? {
            format!("cleared cached detection for {key}")
        } else {
            format!("nothing cached for {key}")
        };
        Ok(vec![render_status_line(style, "ok", &message)])
    }
}
