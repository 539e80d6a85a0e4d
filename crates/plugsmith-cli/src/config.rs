use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use plugsmith_installer::{
    EntryPointLocator, GithubSettings, PipelineConfig, DEFAULT_API_BASE, DEFAULT_ARCHIVE_BASE,
    DEFAULT_HEADER, DEFAULT_MAX_RETRIES, DEFAULT_USER_AGENT,
};
use serde::{Deserialize, Serialize};

/// `plugsmith.toml`. Every section and field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub source: SourceConfig,
    pub locks: LocksConfig,
    pub cache: CacheConfig,
    pub events: EventsConfig,
    pub detection: DetectionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// "text" or "json"
    pub log_format: String,
    /// Branch used when a command does not name one; the repository default otherwise.
    pub default_branch: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            default_branch: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub api_base: String,
    pub archive_base: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            archive_base: DEFAULT_ARCHIVE_BASE.to_string(),
            token: None,
            timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    pub ttl_secs: u64,
    /// 0 fails immediately on contention.
    pub wait_secs: u64,
    pub poll_secs: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            wait_secs: 0,
            poll_secs: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 0 keeps entries until the content version changes.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 43_200 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Keep the event feed in the state directory so `plugsmith events`
    /// sees what other invocations emitted.
    pub persist: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { persist: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub max_retries: u32,
    pub header: String,
    pub extensions: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            header: DEFAULT_HEADER.to_string(),
            extensions: vec!["php".to_string()],
        }
    }
}

impl Config {
    /// Reads `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read config {}", path.display()));
            }
        };
        Self::parse(&raw, path)
    }

    pub fn parse(raw: &str, path: &Path) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|err| anyhow!("invalid config {}: {}", path.display(), err.message()))?;
        config
            .validate()
            .map_err(|reason| anyhow!("invalid config {}: {reason}", path.display()))?;
        Ok(config)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if !matches!(self.general.log_format.as_str(), "text" | "json") {
            return Err(format!(
                "general.log_format must be \"text\" or \"json\", got \"{}\"",
                self.general.log_format
            ));
        }
        if self.locks.ttl_secs == 0 {
            return Err("locks.ttl_secs must be greater than zero".to_string());
        }
        if self.locks.poll_secs == 0 {
            return Err("locks.poll_secs must be greater than zero".to_string());
        }
        if self.detection.header.trim().is_empty() {
            return Err("detection.header must not be empty".to_string());
        }
        if self.detection.extensions.is_empty() {
            return Err("detection.extensions must list at least one extension".to_string());
        }
        Ok(())
    }

    pub fn json_logs(&self) -> bool {
        self.general.log_format == "json"
    }

    pub fn github_settings(&self, token_override: Option<String>) -> GithubSettings {
        GithubSettings {
            api_base: self.source.api_base.clone(),
            archive_base: self.source.archive_base.clone(),
            token: token_override.or_else(|| self.source.token.clone()),
            timeout: Duration::from_secs(self.source.timeout_secs),
            user_agent: self.source.user_agent.clone(),
        }
    }

    /// `wait_override` (seconds) replaces `locks.wait_secs`.
    pub fn pipeline_config(&self, wait_override: Option<u64>) -> PipelineConfig {
        let wait = wait_override.unwrap_or(self.locks.wait_secs);
        PipelineConfig {
            lock_ttl: Duration::from_secs(self.locks.ttl_secs),
            lock_wait: (wait > 0).then(|| Duration::from_secs(wait)),
            lock_poll: Duration::from_secs(self.locks.poll_secs),
        }
    }

    pub fn locator(&self) -> EntryPointLocator {
        EntryPointLocator::new(
            self.detection.header.clone(),
            self.detection.extensions.iter().cloned(),
        )
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache.ttl_secs > 0).then(|| Duration::from_secs(self.cache.ttl_secs))
    }

    pub fn branch<'a>(&'a self, requested: Option<&'a str>) -> Option<&'a str> {
        requested.or(self.general.default_branch.as_deref())
    }
}
