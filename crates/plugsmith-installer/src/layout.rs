use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use plugsmith_core::{ArchiveType, ResourceKey};

/// On-disk layout of one managed host root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    root: PathBuf,
}

impl HostLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.root.join("plugins")
    }

    /// Scratch area for downloads and extraction.
    pub fn upgrade_dir(&self) -> PathBuf {
        self.root.join("upgrade")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn kv_dir(&self) -> PathBuf {
        self.state_dir().join("kv")
    }

    pub fn installed_state_dir(&self) -> PathBuf {
        self.state_dir().join("installed")
    }

    pub fn active_plugins_path(&self) -> PathBuf {
        self.root.join("active-plugins.toml")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("plugsmith.toml")
    }

    pub fn plugin_dir(&self, directory: &str) -> PathBuf {
        self.plugins_dir().join(directory)
    }

    pub fn receipt_path(&self, resource: &ResourceKey) -> PathBuf {
        self.installed_state_dir()
            .join(format!("{}.receipt", resource.file_token()))
    }

    pub fn archive_path(&self, directory: &str, archive_type: ArchiveType) -> PathBuf {
        self.upgrade_dir()
            .join(format!("{directory}.{}", archive_type.extension()))
    }

    pub fn extraction_scratch_dir(&self, directory: &str) -> PathBuf {
        self.upgrade_dir().join(format!("{directory}.extract"))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.plugins_dir(),
            self.upgrade_dir(),
            self.state_dir(),
            self.kv_dir(),
            self.installed_state_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_root() -> Result<PathBuf> {
    if let Some(root) = std::env::var_os("PLUGSMITH_ROOT").filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(root));
    }

    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows plugsmith root")?;
        return Ok(PathBuf::from(app_data).join("Plugsmith"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve plugsmith root")?;
    Ok(PathBuf::from(home).join(".plugsmith"))
}
