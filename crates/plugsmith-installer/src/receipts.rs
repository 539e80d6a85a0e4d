use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use plugsmith_core::ResourceKey;

use crate::fs_utils::remove_file_if_exists;
use crate::host::host_identifier;
use crate::layout::HostLayout;

/// Record of a completed install, one file per resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReceipt {
    pub key: ResourceKey,
    pub branch: String,
    pub content_version: String,
    pub archive_url: String,
    pub archive_sha256: String,
    /// Directory name under `plugins/`.
    pub directory: String,
    /// Entry file relative to `directory`.
    pub entry_point: String,
    pub installed_at_unix: u64,
}

impl InstallReceipt {
    pub fn host_identifier(&self) -> String {
        host_identifier(&self.directory, &self.entry_point)
    }
}

pub fn write_install_receipt(layout: &HostLayout, receipt: &InstallReceipt) -> Result<PathBuf> {
    let mut payload = String::new();
    payload.push_str(&format!("key={}\n", receipt.key));
    payload.push_str(&format!("branch={}\n", receipt.branch));
    payload.push_str(&format!("content_version={}\n", receipt.content_version));
    payload.push_str(&format!("archive_url={}\n", receipt.archive_url));
    payload.push_str(&format!("archive_sha256={}\n", receipt.archive_sha256));
    payload.push_str(&format!("directory={}\n", receipt.directory));
    payload.push_str(&format!("entry_point={}\n", receipt.entry_point));
    payload.push_str(&format!(
        "installed_at_unix={}\n",
        receipt.installed_at_unix
    ));

    let path = layout.receipt_path(&receipt.key);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&path, payload.as_bytes())
        .with_context(|| format!("failed to write install receipt: {}", path.display()))?;
    Ok(path)
}

pub fn read_install_receipt(
    layout: &HostLayout,
    resource: &ResourceKey,
) -> Result<Option<InstallReceipt>> {
    let path = layout.receipt_path(resource);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read install receipt: {}", path.display()));
        }
    };
    let receipt = parse_receipt(&raw)
        .with_context(|| format!("failed to parse install receipt: {}", path.display()))?;
    Ok(Some(receipt))
}

pub fn read_install_receipts(layout: &HostLayout) -> Result<Vec<InstallReceipt>> {
    let dir = layout.installed_state_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut receipts = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("failed to read install state directory: {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let path = entry.path();
        if path.extension().and_then(|v| v.to_str()) != Some("receipt") {
            continue;
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read install receipt: {}", path.display()))?;
        let receipt = parse_receipt(&raw)
            .with_context(|| format!("failed to parse install receipt: {}", path.display()))?;
        receipts.push(receipt);
    }

    receipts.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(receipts)
}

pub fn remove_install_receipt(layout: &HostLayout, resource: &ResourceKey) -> Result<bool> {
    let path = layout.receipt_path(resource);
    remove_file_if_exists(&path)
        .with_context(|| format!("failed to remove install receipt: {}", path.display()))
}

pub(crate) fn parse_receipt(raw: &str) -> Result<InstallReceipt> {
    let mut key = None;
    let mut branch = None;
    let mut content_version = None;
    let mut archive_url = None;
    let mut archive_sha256 = None;
    let mut directory = None;
    let mut entry_point = None;
    let mut installed_at_unix = None;

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k {
            "key" => key = Some(ResourceKey::parse(v)?),
            "branch" => branch = Some(v.to_string()),
            "content_version" => content_version = Some(v.to_string()),
            "archive_url" => archive_url = Some(v.to_string()),
            "archive_sha256" => archive_sha256 = Some(v.to_string()),
            "directory" => directory = Some(v.to_string()),
            "entry_point" => entry_point = Some(v.to_string()),
            "installed_at_unix" => {
                installed_at_unix = Some(v.parse().context("installed_at_unix must be u64")?)
            }
            _ => {}
        }
    }

    Ok(InstallReceipt {
        key: key.context("missing key")?,
        branch: branch.context("missing branch")?,
        content_version: content_version.unwrap_or_default(),
        archive_url: archive_url.unwrap_or_default(),
        archive_sha256: archive_sha256.unwrap_or_default(),
        directory: directory.context("missing directory")?,
        entry_point: entry_point.context("missing entry_point")?,
        installed_at_unix: installed_at_unix.context("missing installed_at_unix")?,
    })
}
