use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use plugsmith_core::ArchiveType;

use crate::fs_utils::move_dir_or_copy;

pub trait ArchiveExtractor: Send + Sync {
    /// Whether this extractor can handle `archive_type` on this machine.
    fn supports(&self, archive_type: ArchiveType) -> bool;

    fn extract(&self, archive_path: &Path, dst: &Path, archive_type: ArchiveType) -> Result<()>;
}

/// Extracts through the platform's `unzip`/`tar` (or PowerShell on Windows).
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExtractor;

impl ArchiveExtractor for CommandExtractor {
    fn supports(&self, archive_type: ArchiveType) -> bool {
        match archive_type {
            ArchiveType::Zip => {
                find_on_path("unzip").is_some()
                    || (cfg!(windows) && find_on_path("powershell").is_some())
            }
            ArchiveType::TarGz => find_on_path("tar").is_some(),
        }
    }

    fn extract(&self, archive_path: &Path, dst: &Path, archive_type: ArchiveType) -> Result<()> {
        fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
        match archive_type {
            ArchiveType::Zip => extract_zip(archive_path, dst),
            ArchiveType::TarGz => run_command(
                Command::new("tar")
                    .arg("-xzf")
                    .arg(archive_path)
                    .arg("-C")
                    .arg(dst),
                "failed to extract tar archive",
            ),
        }
    }
}

fn extract_zip(archive_path: &Path, dst: &Path) -> Result<()> {
    if cfg!(windows) && find_on_path("unzip").is_none() {
        let mut command = Command::new("powershell");
        command.arg("-NoProfile").arg("-Command").arg(format!(
            "Expand-Archive -LiteralPath '{}' -DestinationPath '{}' -Force",
            escape_ps_single_quote(archive_path),
            escape_ps_single_quote(dst)
        ));
        return run_command(&mut command, "failed to extract zip archive with powershell");
    }

    run_command(
        Command::new("unzip")
            .arg("-q")
            .arg("-o")
            .arg(archive_path)
            .arg("-d")
            .arg(dst),
        "failed to extract zip archive with unzip",
    )
}

/// Moves the extracted tree into `dst`. Source archives usually wrap their
/// content in one top-level directory, which is unwrapped.
pub fn promote_extracted(scratch: &Path, dst: &Path) -> Result<()> {
    let entries = fs::read_dir(scratch)
        .with_context(|| format!("failed to read extraction dir: {}", scratch.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to read extraction dir: {}", scratch.display()))?;
    if entries.is_empty() {
        return Err(anyhow!("archive extracted no files into {}", scratch.display()));
    }

    let source = match entries.as_slice() {
        [only] if only.file_type().map(|kind| kind.is_dir()).unwrap_or(false) => only.path(),
        _ => scratch.to_path_buf(),
    };

    if dst.exists() {
        return Err(anyhow!("target directory already exists: {}", dst.display()));
    }
    move_dir_or_copy(&source, dst)
}

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}

pub(crate) fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    let names = if cfg!(windows) {
        vec![format!("{program}.exe"), program.to_string()]
    } else {
        vec![program.to_string()]
    };
    std::env::split_paths(&path)
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

fn escape_ps_single_quote(path: &Path) -> String {
    let mut os = OsString::new();
    os.push(path.as_os_str());
    os.to_string_lossy().replace('\'', "''")
}
