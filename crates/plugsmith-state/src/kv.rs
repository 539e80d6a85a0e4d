use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use plugsmith_core::Clock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Persistent key/value backend shared by every process touching the same
/// root.
///
/// `create_if_absent` must be atomic: when several callers race on the same
/// key, exactly one of them observes `true`. Entries whose TTL has passed read
/// as absent, but are not reclaimed by `create_if_absent`.
///
/// `delete_if_equals` only removes the entry while it still holds `expected`,
/// so a caller acting on a value it read earlier never deletes a newer write.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    fn delete(&self, key: &str) -> Result<bool>;

    fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    fn create_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    value: String,
    #[serde(default)]
    expires_at_unix: Option<u64>,
}

impl Envelope {
    fn new(value: &str, ttl: Option<Duration>, now_unix: u64) -> Self {
        Self {
            value: value.to_string(),
            expires_at_unix: ttl.map(|ttl| now_unix.saturating_add(ttl.as_secs())),
        }
    }

    fn is_expired(&self, now_unix: u64) -> bool {
        self.expires_at_unix
            .is_some_and(|expires_at| now_unix >= expires_at)
    }
}

static TMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// One JSON envelope file per key.
pub struct FsKvStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FsKvStore {
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", encode_key(key)))
    }

    fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create kv root: {}", self.root.display()))
    }

    fn read_envelope(&self, path: &Path) -> Result<Option<Envelope>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read kv entry: {}", path.display()));
            }
        };
        let envelope = serde_json::from_str::<Envelope>(&raw)
            .with_context(|| format!("failed to parse kv entry: {}", path.display()))?;
        Ok(Some(envelope))
    }
}

impl KvStore for FsKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.entry_path(key);
        let Some(envelope) = self.read_envelope(&path)? else {
            return Ok(None);
        };
        if envelope.is_expired(self.clock.now_unix()) {
            debug!(key, "kv entry expired");
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to remove expired kv entry: {}", path.display())
                    });
                }
            }
            return Ok(None);
        }
        Ok(Some(envelope.value))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.ensure_root()?;
        let path = self.entry_path(key);
        let envelope = Envelope::new(value, ttl, self.clock.now_unix());
        let content = serde_json::to_string(&envelope)
            .with_context(|| format!("failed to serialize kv entry '{key}'"))?;

        let tmp_path = path.with_extension(format!(
            "json.tmp-{}-{}",
            std::process::id(),
            TMP_SEQUENCE.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp_path, content)
            .with_context(|| format!("failed to write kv entry: {}", tmp_path.display()))?;
        if let Err(err) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err)
                .with_context(|| format!("failed to move kv entry into place: {}", path.display()));
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("failed to delete kv entry: {}", path.display()))
            }
        }
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let path = self.entry_path(key);
        match self.read_envelope(&path)? {
            Some(envelope) if envelope.value == expected => {}
            _ => return Ok(false),
        }

        // Move the entry aside first; whatever was renamed is what gets judged.
        let taken_path = path.with_extension(format!(
            "json.del-{}-{}",
            std::process::id(),
            TMP_SEQUENCE.fetch_add(1, Ordering::Relaxed)
        ));
        match fs::rename(&path, &taken_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to take kv entry: {}", path.display()));
            }
        }

        let taken = self.read_envelope(&taken_path);
        if matches!(&taken, Ok(Some(envelope)) if envelope.value == expected) {
            match fs::remove_file(&taken_path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to remove kv entry: {}", taken_path.display())
                    });
                }
            }
            return Ok(true);
        }

        // Replaced between the read and the rename: put it back, never over a
        // newer entry.
        let restored = fs::hard_link(&taken_path, &path);
        let _ = fs::remove_file(&taken_path);
        match restored {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                warn!(key, "kv entry was rewritten while restoring it; keeping the newer one");
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to restore kv entry: {}", path.display()));
            }
        }
        taken?;
        Ok(false)
    }

    fn create_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.ensure_root()?;
        let path = self.entry_path(key);
        let envelope = Envelope::new(value, ttl, self.clock.now_unix());
        let content = serde_json::to_string(&envelope)
            .with_context(|| format!("failed to serialize kv entry '{key}'"))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to claim kv entry: {}", path.display()));
            }
        };

        file.write_all(content.as_bytes())
            .with_context(|| format!("failed to write kv entry: {}", path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush kv entry: {}", path.display()))?;
        Ok(true)
    }
}

/// Percent-encodes every byte outside `[A-Za-z0-9._-]` so keys like
/// `lock/acme/widget` become flat, reversible file names.
pub(crate) fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Envelope>>,
    clock: Arc<dyn Clock>,
}

impl MemoryKvStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Envelope>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("memory kv store mutex poisoned"))
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now_unix();
        let mut entries = self.entries()?;
        let Some(envelope) = entries.get(key) else {
            return Ok(None);
        };
        if !envelope.is_expired(now) {
            return Ok(Some(envelope.value.clone()));
        }
        entries.remove(key);
        Ok(None)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let envelope = Envelope::new(value, ttl, self.clock.now_unix());
        self.entries()?.insert(key.to_string(), envelope);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries()?.remove(key).is_some())
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.entries()?;
        if entries
            .get(key)
            .is_some_and(|envelope| envelope.value == expected)
        {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    fn create_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let envelope = Envelope::new(value, ttl, self.clock.now_unix());
        let mut entries = self.entries()?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), envelope);
        Ok(true)
    }
}
