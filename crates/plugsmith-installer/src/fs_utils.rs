use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::layout::HostLayout;

/// Directories the installer is allowed to delete beneath.
#[derive(Debug, Clone)]
pub struct ConfinedRoots {
    roots: Vec<PathBuf>,
}

impl ConfinedRoots {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
        }
    }

    pub fn for_layout(layout: &HostLayout) -> Self {
        Self::new([layout.plugins_dir(), layout.upgrade_dir()])
    }

    /// Resolved real path of `path` when it is a strict descendant of one of
    /// the roots. `Ok(None)` when `path` does not exist.
    pub fn confine(&self, path: &Path) -> Result<Option<PathBuf>> {
        let real = match fs::canonicalize(path) {
            Ok(real) => real,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to resolve {}", path.display()));
            }
        };

        for root in &self.roots {
            let Ok(real_root) = fs::canonicalize(root) else {
                continue;
            };
            if real != real_root && real.starts_with(&real_root) {
                return Ok(Some(real));
            }
        }

        Err(anyhow!(
            "refusing to remove {} (resolves to {}): outside the managed directories",
            path.display(),
            real.display()
        ))
    }

    /// Deletes `path` (file or tree) after confinement. Returns whether
    /// anything was removed.
    pub fn remove_confined(&self, path: &Path) -> Result<bool> {
        let Some(real) = self.confine(path)? else {
            return Ok(false);
        };

        let link = fs::symlink_metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if link.file_type().is_symlink() {
            fs::remove_file(path)
                .with_context(|| format!("failed to remove link {}", path.display()))?;
            debug!(path = %path.display(), "removed confined link");
            return Ok(true);
        }

        let metadata = fs::symlink_metadata(&real)
            .with_context(|| format!("failed to stat {}", real.display()))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&real)
                .with_context(|| format!("failed to remove {}", real.display()))?;
        } else {
            fs::remove_file(&real)
                .with_context(|| format!("failed to remove {}", real.display()))?;
        }
        debug!(path = %real.display(), "removed confined path");
        Ok(true)
    }

    /// Removes every direct entry of `dir` whose file name starts with
    /// `prefix`.
    pub fn purge_prefixed(&self, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()));
            }
        };

        let mut removed = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
            let matches = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(prefix));
            if !matches {
                continue;
            }
            let path = entry.path();
            if self.remove_confined(&path)? {
                removed.push(path);
            }
        }
        removed.sort();
        Ok(removed)
    }
}

pub fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

pub fn move_dir_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    copy_dir_recursive(src, dst)?;
    fs::remove_dir_all(src)
        .with_context(|| format!("failed to clean up staging dir: {}", src.display()))
}

pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let metadata = fs::symlink_metadata(&src_path)
            .with_context(|| format!("failed to stat {}", src_path.display()))?;
        if metadata.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
            continue;
        }
        // archives from remote sources never get to place links
        if metadata.file_type().is_symlink() {
            continue;
        }
        fs::copy(&src_path, &dst_path).with_context(|| {
            format!(
                "failed to copy {} to {}",
                src_path.display(),
                dst_path.display()
            )
        })?;
    }
    Ok(())
}
