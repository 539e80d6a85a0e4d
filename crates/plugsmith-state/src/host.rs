use anyhow::Result;
use plugsmith_core::ResourceKey;

/// A plugin as the host environment reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPlugin {
    /// Host-side identifier, usually `"{directory}/{entry file}"`.
    pub identifier: String,
    pub active: bool,
    /// Resource whose install record names this plugin's directory.
    pub owner: Option<ResourceKey>,
}

impl HostPlugin {
    pub fn new(identifier: impl Into<String>, active: bool) -> Self {
        Self {
            identifier: identifier.into(),
            active,
            owner: None,
        }
    }

    pub fn owned_by(mut self, owner: ResourceKey) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn directory(&self) -> &str {
        let trimmed = self.identifier.trim_matches('/');
        trimmed.split_once('/').map_or(trimmed, |(directory, _)| directory)
    }
}

/// Ground truth about what is installed on the host. The host can change
/// outside this system, so callers must not cache the answer.
pub trait HostInspector: Send + Sync {
    fn installed_plugins(&self) -> Result<Vec<HostPlugin>>;
}
