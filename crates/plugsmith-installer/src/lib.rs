mod detect;
mod entry;
mod error;
mod extract;
mod fs_utils;
mod github;
mod host;
mod layout;
mod pipeline;
mod receipts;
mod source;

pub use detect::{Detection, DetectionOutcome, Detector, DEFAULT_MAX_RETRIES};
pub use entry::{EntryPoint, EntryPointLocator, DEFAULT_HEADER, DEFAULT_SCAN_LIMIT};
pub use error::{PipelineError, PipelineResult, PipelineStep};
pub use extract::{promote_extracted, ArchiveExtractor, CommandExtractor};
pub use fs_utils::{move_dir_or_copy, remove_file_if_exists, ConfinedRoots};
pub use github::{
    build_client, GithubSettings, GithubSource, HttpTransport, DEFAULT_API_BASE,
    DEFAULT_ARCHIVE_BASE, DEFAULT_USER_AGENT,
};
pub use host::{FsPluginHost, PluginActivator};
pub use layout::{default_root, HostLayout};
pub use pipeline::{
    Collaborators, InstallOutcome, InstallPipeline, InstallRequest, PipelineConfig, StepStatus,
};
pub use receipts::{
    read_install_receipt, read_install_receipts, remove_install_receipt, write_install_receipt,
    InstallReceipt,
};
pub use source::{SourceInspector, SourceMetadata, Transport};

#[cfg(test)]
mod tests;
