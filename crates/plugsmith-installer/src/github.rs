use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use plugsmith_core::{ArchiveType, ResourceKey};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use crate::entry::EntryPointLocator;
use crate::source::{SourceInspector, SourceMetadata, Transport};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_ARCHIVE_BASE: &str = "https://github.com";
pub const DEFAULT_USER_AGENT: &str = concat!("plugsmith/", env!("CARGO_PKG_VERSION"));

/// Files fetched at most when probing a repository for an entry point.
const MAX_PROBED_FILES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubSettings {
    pub api_base: String,
    pub archive_base: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for GithubSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            archive_base: DEFAULT_ARCHIVE_BASE.to_string(),
            token: None,
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RepoInfo {
    pub(crate) default_branch: String,
    #[serde(default)]
    pub(crate) pushed_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContentEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    download_url: Option<String>,
}

pub fn build_client(settings: &GithubSettings) -> Result<Client> {
    Client::builder()
        .timeout(settings.timeout)
        .user_agent(settings.user_agent.clone())
        .build()
        .context("failed to build HTTP client")
}

/// GitHub repositories as plugin sources.
pub struct GithubSource {
    client: Client,
    settings: GithubSettings,
    locator: EntryPointLocator,
}

impl GithubSource {
    pub fn new(settings: GithubSettings, locator: EntryPointLocator) -> Result<Self> {
        Ok(Self {
            client: build_client(&settings)?,
            settings,
            locator,
        })
    }

    fn get(&self, url: &str) -> RequestBuilder {
        let request = self
            .client
            .get(url)
            .header(ACCEPT, "application/vnd.github+json");
        match &self.settings.token {
            Some(token) if !token.is_empty() => request.header(AUTHORIZATION, format!("Bearer {token}")),
            _ => request,
        }
    }

    fn fetch_repo(&self, resource: &ResourceKey) -> Result<RepoInfo> {
        let url = repo_url(&self.settings.api_base, resource)?;
        debug!(%url, "fetching repository metadata");
        let response = self
            .get(&url)
            .send()
            .with_context(|| format!("failed to reach {url}"))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(anyhow!("repository {resource} was not found"));
        }
        if !status.is_success() {
            return Err(anyhow!("repository lookup for {resource} returned status {status}"));
        }
        let body = response
            .text()
            .with_context(|| format!("failed to read response from {url}"))?;
        parse_repo_info(&body)
    }

    fn file_has_header(&self, url: &str) -> Result<bool> {
        let response = self
            .get(url)
            .send()
            .with_context(|| format!("failed to reach {url}"))?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let mut head = Vec::with_capacity(self.locator.scan_limit());
        response
            .take(self.locator.scan_limit() as u64)
            .read_to_end(&mut head)
            .with_context(|| format!("failed to read {url}"))?;
        Ok(self.locator.contains_header(&head))
    }
}

impl SourceInspector for GithubSource {
    fn inspect(&self, resource: &ResourceKey, branch: Option<&str>) -> Result<SourceMetadata> {
        let repo = self.fetch_repo(resource)?;
        let branch = branch
            .map(str::trim)
            .filter(|branch| !branch.is_empty())
            .map(str::to_string)
            .unwrap_or(repo.default_branch);
        let content_version = match repo.pushed_at {
            Some(pushed_at) => format!("{branch}@{pushed_at}"),
            None => branch.clone(),
        };

        Ok(SourceMetadata {
            archive_url: archive_url(&self.settings.archive_base, resource, &branch)?,
            archive_type: ArchiveType::Zip,
            branch,
            content_version,
        })
    }

    fn probe_entry_point(&self, resource: &ResourceKey, branch: &str) -> Result<bool> {
        let url = contents_url(&self.settings.api_base, resource, branch)?;
        let response = self
            .get(&url)
            .send()
            .with_context(|| format!("failed to reach {url}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("listing {resource} at {branch} returned status {status}"));
        }
        let body = response
            .text()
            .with_context(|| format!("failed to read response from {url}"))?;
        let entries = serde_json::from_str::<Vec<ContentEntry>>(&body)
            .with_context(|| format!("failed to parse repository contents of {resource}"))?;

        for download_url in probe_candidates(&self.locator, &entries) {
            if self.file_has_header(download_url)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Streams response bodies to disk.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(settings: &GithubSettings) -> Result<Self> {
        Ok(Self {
            client: build_client(settings)?,
        })
    }
}

impl Transport for HttpTransport {
    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to reach {url}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("download of {url} returned status {status}"));
        }

        let file =
            File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
        let mut writer = BufWriter::new(file);
        let bytes = response
            .copy_to(&mut writer)
            .with_context(|| format!("failed to download {url}"))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush {}", dest.display()))?;
        debug!(%url, bytes, "download complete");
        Ok(bytes)
    }
}

fn repo_url(api_base: &str, resource: &ResourceKey) -> Result<String> {
    Ok(join_segments(api_base, ["repos", resource.owner(), resource.name()])?.into())
}

pub(crate) fn contents_url(api_base: &str, resource: &ResourceKey, branch: &str) -> Result<String> {
    let mut url = join_segments(api_base, ["repos", resource.owner(), resource.name(), "contents"])?;
    url.query_pairs_mut().append_pair("ref", branch);
    Ok(url.into())
}

/// Branch names keep their `/` separators as path segments; everything else
/// is percent-encoded.
pub(crate) fn archive_url(archive_base: &str, resource: &ResourceKey, branch: &str) -> Result<String> {
    let reference = format!("{branch}.zip");
    let segments = [resource.owner(), resource.name(), "archive", "refs", "heads"]
        .into_iter()
        .chain(reference.split('/'));
    Ok(join_segments(archive_base, segments)?.into())
}

fn join_segments<'a>(base: &str, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("invalid base url '{base}'"))?;
    url.path_segments_mut()
        .map_err(|()| anyhow!("base url '{base}' cannot carry a path"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

pub(crate) fn parse_repo_info(body: &str) -> Result<RepoInfo> {
    serde_json::from_str(body).context("failed to parse repository metadata")
}

pub(crate) fn probe_candidates<'a>(locator: &EntryPointLocator, entries: &'a [ContentEntry]) -> Vec<&'a str> {
    entries
        .iter()
        .filter(|entry| entry.kind == "file" && locator.has_candidate_extension(&entry.name))
        .filter_map(|entry| entry.download_url.as_deref())
        .take(MAX_PROBED_FILES)
        .collect()
}
