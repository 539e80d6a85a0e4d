use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// `owner/name` identifier of an installable unit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    owner: String,
    name: String,
}

impl ResourceKey {
    pub fn new(owner: &str, name: &str) -> Result<Self> {
        validate_segment("owner", owner)?;
        validate_segment("name", name)?;
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let (owner, name) = trimmed
            .split_once('/')
            .ok_or_else(|| anyhow!("invalid resource key '{trimmed}': expected owner/name"))?;
        Self::new(owner, name)
            .map_err(|err| anyhow!("invalid resource key '{trimmed}': {err}"))
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory an archive of `branch` unpacks into, e.g. `widget-main`.
    pub fn target_dir_name(&self, branch: &str) -> String {
        let branch = branch.trim().replace(['/', '\\'], "-");
        format!("{}-{}", self.name, branch)
    }

    /// Flat token usable as a file name, e.g. `acme__widget`.
    pub fn file_token(&self) -> String {
        format!("{}__{}", self.owner, self.name)
    }
}

fn validate_segment(label: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > 100 {
        return Err(anyhow!("{label} must be 1-100 characters"));
    }
    if value == "." || value == ".." {
        return Err(anyhow!("{label} must not be '{value}'"));
    }
    if !value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
    {
        return Err(anyhow!("{label} contains unsupported characters: '{value}'"));
    }
    Ok(())
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ResourceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
