use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use plugsmith_state::{HostInspector, HostPlugin};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::entry::EntryPointLocator;
use crate::layout::HostLayout;
use crate::receipts::read_install_receipts;

/// Switches a plugin on or off in the host.
pub trait PluginActivator: Send + Sync {
    fn activate(&self, identifier: &str) -> Result<()>;

    fn deactivate(&self, identifier: &str) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ActivePluginsFile {
    #[serde(default)]
    active: BTreeSet<String>,
}

/// Host backed by the layout's `plugins/` directory and the
/// `active-plugins.toml` activation list.
#[derive(Debug, Clone)]
pub struct FsPluginHost {
    layout: HostLayout,
    locator: EntryPointLocator,
}

impl FsPluginHost {
    pub fn new(layout: HostLayout, locator: EntryPointLocator) -> Self {
        Self { layout, locator }
    }

    pub fn active_identifiers(&self) -> Result<BTreeSet<String>> {
        Ok(self.read_active()?.active)
    }

    fn read_active(&self) -> Result<ActivePluginsFile> {
        let path = self.layout.active_plugins_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(ActivePluginsFile::default())
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", path.display()));
            }
        };
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn write_active(&self, file: &ActivePluginsFile) -> Result<()> {
        let path = self.layout.active_plugins_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = toml::to_string(file).context("failed to serialize active plugin list")?;
        let tmp = path.with_extension(format!("toml.tmp-{}", std::process::id()));
        fs::write(&tmp, raw).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move active plugin list into place: {}", path.display()))
    }

    fn ensure_present(&self, identifier: &str) -> Result<()> {
        let (directory, entry) = identifier
            .split_once('/')
            .ok_or_else(|| anyhow!("invalid plugin identifier '{identifier}'"))?;
        let entry_path = self.layout.plugin_dir(directory).join(entry);
        if !entry_path.is_file() {
            return Err(anyhow!(
                "plugin '{identifier}' is not installed (missing {})",
                entry_path.display()
            ));
        }
        Ok(())
    }
}

impl HostInspector for FsPluginHost {
    fn installed_plugins(&self) -> Result<Vec<HostPlugin>> {
        let plugins_dir = self.layout.plugins_dir();
        let entries = match fs::read_dir(&plugins_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", plugins_dir.display()));
            }
        };
        let active = self.read_active()?.active;
        let owners = match read_install_receipts(&self.layout) {
            Ok(receipts) => receipts
                .into_iter()
                .map(|receipt| (receipt.directory, receipt.key))
                .collect::<BTreeMap<_, _>>(),
            Err(err) => {
                warn!("failed to read install receipts, plugin ownership unknown: {err:#}");
                BTreeMap::new()
            }
        };

        let mut plugins = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", plugins_dir.display()))?;
            if !entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
                continue;
            }
            let Some(directory) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.locator.locate(&entry.path()) {
                Ok(Some(found)) => {
                    let identifier = format!("{directory}/{}", found.relative);
                    let is_active = active.contains(&identifier);
                    let mut plugin = HostPlugin::new(identifier, is_active);
                    if let Some(owner) = owners.get(&directory) {
                        plugin = plugin.owned_by(owner.clone());
                    }
                    plugins.push(plugin);
                }
                Ok(None) => debug!(directory, "plugins entry without an entry point"),
                Err(err) => warn!(directory, "failed to inspect plugin directory: {err:#}"),
            }
        }
        plugins.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(plugins)
    }
}

impl PluginActivator for FsPluginHost {
    fn activate(&self, identifier: &str) -> Result<()> {
        self.ensure_present(identifier)?;
        let mut file = self.read_active()?;
        if file.active.insert(identifier.to_string()) {
            self.write_active(&file)?;
        }
        Ok(())
    }

    fn deactivate(&self, identifier: &str) -> Result<()> {
        let mut file = self.read_active()?;
        if file.active.remove(identifier) {
            self.write_active(&file)?;
        }
        Ok(())
    }
}

pub(crate) fn host_identifier(directory: &str, entry_point: &str) -> String {
    let entry = Path::new(entry_point)
        .components()
        .filter_map(|component| component.as_os_str().to_str())
        .collect::<Vec<_>>()
        .join("/");
    format!("{directory}/{entry}")
}
