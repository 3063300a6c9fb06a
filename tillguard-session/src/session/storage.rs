//! Session Storage - Persistence layer for the credential record
//!
//! A [`CredentialStore`] writes one namespaced session record plus raw
//! access/refresh token entries through a [`StorageBackend`]. It performs no
//! validation; deciding whether a record is usable is the manager's job.

use super::SessionRecord;
use crate::{SessionError, SessionResult};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// String key/value persistence with atomic batches
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> SessionResult<Option<String>>;

    /// Apply every entry at once: `Some` sets the key, `None` removes it
    fn write_batch(&self, entries: &[(String, Option<String>)]) -> SessionResult<()>;
}

/// In-process backend, lost on exit
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> SessionResult<Option<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| SessionError::storage("Memory backend lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn write_batch(&self, batch: &[(String, Option<String>)]) -> SessionResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| SessionError::storage("Memory backend lock poisoned"))?;

        for (key, value) in batch {
            match value {
                Some(value) => entries.insert(key.clone(), value.clone()),
                None => entries.remove(key),
            };
        }

        Ok(())
    }
}

/// Single JSON document on disk, replaced via temp file + rename
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Backend storing `credentials.json` inside `dir`
    pub fn new<P: AsRef<Path>>(dir: P) -> SessionResult<Self> {
        let dir = dir.as_ref().to_path_buf();

        std::fs::create_dir_all(&dir).map_err(|e| {
            SessionError::storage_with_source(
                format!("Failed to create storage directory {}", dir.display()),
                e,
            )
        })?;

        info!("Credential storage initialized at: {}", dir.display());

        Ok(Self {
            path: dir.join("credentials.json"),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> SessionResult<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            SessionError::storage_with_source(
                format!("Failed to read credential file {}", self.path.display()),
                e,
            )
        })?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&raw).map_err(|e| {
            SessionError::storage_with_source(
                format!("Corrupt credential file {}", self.path.display()),
                e,
            )
        })
    }

    fn write_document(&self, document: &BTreeMap<String, String>) -> SessionResult<()> {
        let tmp_path = self.path.with_extension("json.tmp");
        let json_data = serde_json::to_string_pretty(document)?;

        write_private(&tmp_path, json_data.as_bytes()).map_err(|e| {
            SessionError::storage_with_source(
                format!("Failed to write {}", tmp_path.display()),
                e,
            )
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            SessionError::storage_with_source(
                format!("Failed to replace {}", self.path.display()),
                e,
            )
        })?;

        debug!("Wrote credential file {}", self.path.display());
        Ok(())
    }
}

/// Create or truncate `path` with owner-only permissions; it holds bearer tokens
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    // The mode only applies on creation; a leftover temp file keeps its old bits
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(contents)?;
    file.sync_all()
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> SessionResult<Option<String>> {
        Ok(self.read_document()?.get(key).cloned())
    }

    fn write_batch(&self, batch: &[(String, Option<String>)]) -> SessionResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| SessionError::storage("File backend lock poisoned"))?;

        // A corrupt document must never block a clear
        let mut document = self.read_document().unwrap_or_else(|e| {
            warn!("Discarding unreadable credential file: {}", e);
            BTreeMap::new()
        });

        for (key, value) in batch {
            match value {
                Some(value) => document.insert(key.clone(), value.clone()),
                None => document.remove(key),
            };
        }

        self.write_document(&document)
    }
}

/// Namespaced persistence of the single session record
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn StorageBackend>,
    namespace: String,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn StorageBackend>, namespace: &str) -> Self {
        Self {
            backend,
            namespace: namespace.to_string(),
        }
    }

    /// Ephemeral store, mostly for tests and previews
    pub fn in_memory(namespace: &str) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), namespace)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn session_key(&self) -> String {
        format!("{}.session", self.namespace)
    }

    pub fn access_token_key(&self) -> String {
        format!("{}.access_token", self.namespace)
    }

    pub fn refresh_token_key(&self) -> String {
        format!("{}.refresh_token", self.namespace)
    }

    /// Persist the record and its raw token entries in one batch
    pub fn save(&self, record: &SessionRecord) -> SessionResult<()> {
        let json_data = serde_json::to_string(record)?;

        self.backend.write_batch(&[
            (self.session_key(), Some(json_data)),
            (self.access_token_key(), Some(record.tokens.access.clone())),
            (self.refresh_token_key(), Some(record.tokens.refresh.clone())),
        ])?;

        debug!(username = %record.user.username, "Saved session record");
        Ok(())
    }

    pub fn load(&self) -> SessionResult<Option<SessionRecord>> {
        let Some(json_data) = self.backend.get(&self.session_key())? else {
            return Ok(None);
        };

        let record = serde_json::from_str(&json_data)
            .map_err(|e| SessionError::storage_with_source("Unreadable session record", e))?;

        Ok(Some(record))
    }

    /// Fast-path read of the raw access token entry
    pub fn access_token(&self) -> SessionResult<Option<String>> {
        Ok(self
            .backend
            .get(&self.access_token_key())?
            .filter(|t| !t.is_empty()))
    }

    /// Fast-path read of the raw refresh token entry
    pub fn refresh_token(&self) -> SessionResult<Option<String>> {
        Ok(self
            .backend
            .get(&self.refresh_token_key())?
            .filter(|t| !t.is_empty()))
    }

    /// Remove the record and both token entries in one batch
    pub fn clear(&self) -> SessionResult<()> {
        self.backend.write_batch(&[
            (self.session_key(), None),
            (self.access_token_key(), None),
            (self.refresh_token_key(), None),
        ])?;

        debug!(namespace = %self.namespace, "Cleared credential store");
        Ok(())
    }
}
