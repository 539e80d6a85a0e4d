use std::path::Path;

use anyhow::Result;
use plugsmith_core::{ArchiveType, ResourceKey};
use serde::{Deserialize, Serialize};

/// What the source reports about one resource at one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub branch: String,
    /// Opaque token that changes whenever the resource's content does.
    pub content_version: String,
    pub archive_url: String,
    pub archive_type: ArchiveType,
}

pub trait SourceInspector: Send + Sync {
    /// `branch = None` selects the source's default branch.
    fn inspect(&self, resource: &ResourceKey, branch: Option<&str>) -> Result<SourceMetadata>;

    /// Whether the resource at `branch` looks like a plugin without
    /// downloading its archive.
    fn probe_entry_point(&self, resource: &ResourceKey, branch: &str) -> Result<bool>;
}

pub trait Transport: Send + Sync {
    /// Writes the body at `url` to `dest`, returning the byte count.
    fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}
