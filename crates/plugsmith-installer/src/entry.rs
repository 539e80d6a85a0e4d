use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const DEFAULT_HEADER: &str = "Plugin Name:";
pub const DEFAULT_SCAN_LIMIT: usize = 8 * 1024;

/// Entry point found inside an installed plugin directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    /// Path relative to the plugin directory, `/`-separated.
    pub relative: String,
    pub path: PathBuf,
}

/// Finds a plugin's entry file: a file with one of `extensions` whose first
/// `scan_limit` bytes contain the header marker. The top level is searched
/// first, then one nested level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPointLocator {
    header: String,
    extensions: Vec<String>,
    scan_limit: usize,
}

impl Default for EntryPointLocator {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER, ["php"])
    }
}

impl EntryPointLocator {
    pub fn new<I, S>(header: impl Into<String>, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            header: header.into(),
            extensions: extensions
                .into_iter()
                .map(|ext| ext.into().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            scan_limit: DEFAULT_SCAN_LIMIT,
        }
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn scan_limit(&self) -> usize {
        self.scan_limit
    }

    pub fn has_candidate_extension(&self, file_name: &str) -> bool {
        let Some((_, ext)) = file_name.rsplit_once('.') else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.extensions.iter().any(|candidate| *candidate == ext)
    }

    /// Case-insensitive search for the header in the first `scan_limit`
    /// bytes.
    pub fn contains_header(&self, content: &[u8]) -> bool {
        let window = &content[..content.len().min(self.scan_limit)];
        let haystack = String::from_utf8_lossy(window).to_ascii_lowercase();
        haystack.contains(&self.header.to_ascii_lowercase())
    }

    pub fn locate(&self, dir: &Path) -> Result<Option<EntryPoint>> {
        let (files, subdirs) = list_dir(dir)?;
        if let Some(found) = self.first_match(&files, "")? {
            return Ok(Some(found));
        }

        for subdir in subdirs {
            let Some(prefix) = subdir.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let (files, _) = list_dir(&subdir)?;
            if let Some(found) = self.first_match(&files, prefix)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn first_match(&self, files: &[PathBuf], prefix: &str) -> Result<Option<EntryPoint>> {
        for path in files {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !self.has_candidate_extension(name) {
                continue;
            }
            if self.contains_header(&self.read_head(path)?) {
                let relative = if prefix.is_empty() {
                    name.to_string()
                } else {
                    format!("{prefix}/{name}")
                };
                return Ok(Some(EntryPoint {
                    relative,
                    path: path.clone(),
                }));
            }
        }
        Ok(None)
    }

    fn read_head(&self, path: &Path) -> Result<Vec<u8>> {
        let file = File::open(path)
            .with_context(|| format!("failed to open candidate entry point: {}", path.display()))?;
        let mut head = Vec::with_capacity(self.scan_limit);
        file.take(self.scan_limit as u64)
            .read_to_end(&mut head)
            .with_context(|| format!("failed to read candidate entry point: {}", path.display()))?;
        Ok(head)
    }
}

/// Regular files and directories directly under `dir`, each sorted by name.
fn list_dir(dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;
        if file_type.is_file() {
            files.push(entry.path());
        } else if file_type.is_dir() {
            dirs.push(entry.path());
        }
    }
    files.sort();
    dirs.sort();
    Ok((files, dirs))
}
