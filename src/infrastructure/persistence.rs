//! Durable storage of workspace snapshots in a key-value store.
//!
//! A snapshot is split into one entry per app, page and table plus a small
//! `workspace` entry holding the version, the id sequence, the app order and
//! the revision of every entity entry:
//!
//! ```text
//! <prefix>:workspace
//! <prefix>:app:<id>@<rev>      app record with its library components
//! <prefix>:page:<id>@<rev>     page record with its component tree
//! <prefix>:table:<id>@<rev>    table schema and records
//! ```
//!
//! `<rev>` is the version of the snapshot that last changed the entity. A
//! flush never overwrites an entry the current `workspace` entry points at.
//! Changed entities go to new keys and the `workspace` entry, written last,
//! is the commit point. Superseded keys are removed after it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::SnapshotSink;
use crate::domain::{
    App, AppId, Component, ComponentId, DomainError, DomainResult, Page, Table, Workspace,
};

/// Failures of a key-value backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage is unavailable")]
    Unavailable,
    #[error("storage quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded { needed: usize, quota: usize },
    #[error("storage I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl From<StorageError> for DomainError {
    fn from(err: StorageError) -> Self {
        DomainError::Persistence(err.to_string())
    }
}

/// A string-to-string store in the manner of browser local storage.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&mut self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

#[derive(Debug)]
struct MemoryState {
    entries: BTreeMap<String, String>,
    quota: Option<usize>,
    available: bool,
}

impl MemoryState {
    fn used_bytes(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

/// In-memory backend. Clones share the same entries, so a test can keep a
/// handle while the adapter owns another.
#[derive(Debug, Clone)]
pub struct MemoryKeyValueStore {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                entries: BTreeMap::new(),
                quota: None,
                available: true,
            })),
        }
    }

    /// Limits the total size of keys and values, in bytes.
    pub fn with_quota(quota: usize) -> Self {
        let store = Self::new();
        lock(&store.state).quota = Some(quota);
        store
    }

    /// Simulates storage being switched off (e.g. private browsing).
    pub fn set_available(&self, available: bool) {
        lock(&self.state).available = available;
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn usable(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        let state = lock(&self.state);
        if state.available {
            Ok(state)
        } else {
            Err(StorageError::Unavailable)
        }
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.usable()?.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut state = self.usable()?;
        if let Some(quota) = state.quota {
            let replaced = state.entries.get(key).map_or(0, |old| key.len() + old.len());
            let needed = state.used_bytes() - replaced + key.len() + value.len();
            if needed > quota {
                return Err(StorageError::QuotaExceeded { needed, quota });
            }
        }
        state.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.usable()?.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.usable()?.entries.keys().cloned().collect())
    }
}

/// Backend keeping one file per key in a directory.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    dir: PathBuf,
}

const FILE_EXTENSION: &str = "json";

impl FileKeyValueStore {
    /// Opens `dir`, creating it when missing.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{FILE_EXTENSION}", encode_key(key)))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes to a temporary file first and renames it over the old entry.
    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            if let Some(key) = path.file_stem().and_then(|s| s.to_str()).and_then(decode_key) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Escapes everything but ASCII alphanumerics, `-` and `_` as `%XX`.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkspaceEntry {
    version: u64,
    next_seq: u64,
    app_order: Vec<AppId>,
    /// Revision of every entity entry in this commit, by slot (`page:<id>`).
    revisions: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AppEntry {
    app: App,
    library: Vec<Component>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PageEntry {
    page: Page,
    components: Vec<Component>,
}

/// An entity entry referenced by the last commit.
#[derive(Debug, Clone)]
struct Committed {
    revision: u64,
    value: String,
}

/// Result of a [`PersistenceAdapter::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Written { written: usize, removed: usize },
    /// The snapshot was not newer than the last one written.
    Stale,
}

/// Maps workspace snapshots onto a [`KeyValueStore`].
///
/// # Examples
///
/// ```
/// use pagecraft::infrastructure::{FlushOutcome, MemoryKeyValueStore, PersistenceAdapter};
///
/// let backend = MemoryKeyValueStore::new();
/// let mut adapter = PersistenceAdapter::new(backend.clone(), "demo", "My App");
///
/// let workspace = adapter.hydrate().unwrap();
/// assert_eq!(workspace.apps.len(), 1);
/// assert_eq!(adapter.flush(&workspace).unwrap(), FlushOutcome::Stale);
/// assert_eq!(backend.len(), 3);
/// ```
pub struct PersistenceAdapter<S: KeyValueStore> {
    backend: S,
    prefix: String,
    default_app_name: String,
    last_version: Option<u64>,
    committed: HashMap<String, Committed>,
    /// Keys the backend holds that no commit references.
    garbage: BTreeSet<String>,
    /// Seed write failure, reported once through [`SnapshotSink::take_error`].
    pending_error: Option<DomainError>,
}

impl<S: KeyValueStore> PersistenceAdapter<S> {
    pub fn new(backend: S, prefix: impl Into<String>, default_app_name: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            default_app_name: default_app_name.into(),
            last_version: None,
            committed: HashMap::new(),
            garbage: BTreeSet::new(),
            pending_error: None,
        }
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    /// Version of the last snapshot known to be fully written.
    pub fn last_version(&self) -> Option<u64> {
        self.last_version
    }

    /// Loads the persisted workspace. The first call against empty storage
    /// writes the seed workspace; later calls read it back unchanged.
    ///
    /// If the seed cannot be written the seeded workspace is still returned
    /// and the failure is held for [`SnapshotSink::take_error`].
    pub fn hydrate(&mut self) -> DomainResult<Workspace> {
        let Some(raw) = self.backend.get(&self.workspace_key())? else {
            return self.seed();
        };
        let meta: WorkspaceEntry = serde_json::from_str(&raw)?;

        let mut workspace = Workspace::empty();
        workspace.version = meta.version;
        workspace.next_seq = meta.next_seq;
        for app_id in &meta.app_order {
            let entry: AppEntry = self.read_entity(&meta, "app", app_id.as_str())?;
            for page_id in &entry.app.pages {
                let page: PageEntry = self.read_entity(&meta, "page", page_id.as_str())?;
                insert_components(&mut workspace, page.components);
                workspace.pages.insert(page.page.id.clone(), page.page);
            }
            for table_id in &entry.app.tables {
                let table: Table = self.read_entity(&meta, "table", table_id.as_str())?;
                workspace.tables.insert(table.id.clone(), table);
            }
            insert_components(&mut workspace, entry.library);
            workspace.apps.insert(entry.app.id.clone(), entry.app);
        }
        workspace.app_order = meta.app_order;
        workspace.check_integrity()?;

        self.committed = encode_entities(&workspace)?
            .into_iter()
            .filter_map(|(slot, value)| {
                let revision = *meta.revisions.get(&slot)?;
                Some((slot, Committed { revision, value }))
            })
            .collect();
        self.scan_unreferenced()?;
        self.last_version = Some(workspace.version);
        debug!(
            version = workspace.version,
            apps = workspace.apps.len(),
            unreferenced = self.garbage.len(),
            "hydrated workspace"
        );
        Ok(workspace)
    }

    /// Writes the entities that changed since the last commit under keys
    /// tagged with the snapshot version, then the `workspace` entry that
    /// points at them. Entries no longer referenced are removed only after
    /// that. A failed flush leaves the previous commit readable.
    pub fn flush(&mut self, snapshot: &Workspace) -> DomainResult<FlushOutcome> {
        if self.last_version.is_some_and(|last| snapshot.version <= last) {
            debug!(version = snapshot.version, "discarding stale snapshot");
            return Ok(FlushOutcome::Stale);
        }

        let mut revisions = BTreeMap::new();
        let mut committed = HashMap::new();
        let mut written = 0;
        for (slot, value) in encode_entities(snapshot)? {
            let revision = match self.committed.get(&slot) {
                Some(previous) if previous.value == value => previous.revision,
                _ => {
                    let key = self.entity_key(&slot, snapshot.version);
                    // Unreferenced until the workspace entry is written.
                    self.garbage.insert(key.clone());
                    self.backend.set(&key, &value)?;
                    written += 1;
                    snapshot.version
                }
            };
            revisions.insert(slot.clone(), revision);
            committed.insert(slot, Committed { revision, value });
        }

        let meta = WorkspaceEntry {
            version: snapshot.version,
            next_seq: snapshot.next_seq,
            app_order: snapshot.app_order.clone(),
            revisions,
        };
        let workspace_key = self.workspace_key();
        self.backend.set(&workspace_key, &serde_json::to_string(&meta)?)?;
        written += 1;

        let superseded = std::mem::replace(&mut self.committed, committed);
        for (slot, previous) in superseded {
            let key = self.entity_key(&slot, previous.revision);
            self.garbage.insert(key);
        }
        let live: Vec<String> = self
            .committed
            .iter()
            .map(|(slot, entry)| self.entity_key(slot, entry.revision))
            .collect();
        for key in &live {
            self.garbage.remove(key);
        }
        self.last_version = Some(snapshot.version);

        let removed = self.sweep();
        debug!(version = snapshot.version, written, removed, "flushed workspace");
        Ok(FlushOutcome::Written { written, removed })
    }

    fn seed(&mut self) -> DomainResult<Workspace> {
        let workspace = Workspace::seeded(&self.default_app_name);
        self.last_version = None;
        self.committed.clear();
        self.scan_unreferenced()?;
        match self.flush(&workspace) {
            Ok(_) => {
                info!(
                    prefix = %self.prefix,
                    app = %self.default_app_name,
                    "seeded empty storage with default app"
                );
            }
            Err(err) => {
                warn!(prefix = %self.prefix, error = %err, "seed workspace could not be written");
                self.pending_error = Some(err);
            }
        }
        Ok(workspace)
    }

    /// Removes unreferenced entries. Whatever fails stays queued for the next
    /// flush.
    fn sweep(&mut self) -> usize {
        let mut removed = 0;
        let pending: Vec<String> = self.garbage.iter().cloned().collect();
        for key in pending {
            if let Err(err) = self.backend.remove(&key) {
                warn!(key = %key, error = %err, "could not remove unreferenced entry");
                break;
            }
            self.garbage.remove(&key);
            removed += 1;
        }
        removed
    }

    /// Marks every owned key the current commit does not reference.
    fn scan_unreferenced(&mut self) -> DomainResult<()> {
        let mut referenced: BTreeSet<String> = self
            .committed
            .iter()
            .map(|(slot, entry)| self.entity_key(slot, entry.revision))
            .collect();
        referenced.insert(self.workspace_key());

        let keys = self.backend.keys()?;
        self.garbage = keys
            .into_iter()
            .filter(|key| self.owns(key) && !referenced.contains(key))
            .collect();
        Ok(())
    }

    fn read_entity<T: DeserializeOwned>(
        &self,
        meta: &WorkspaceEntry,
        kind: &str,
        id: &str,
    ) -> DomainResult<T> {
        let slot = slot(kind, id);
        let revision = meta.revisions.get(&slot).ok_or_else(|| {
            DomainError::Persistence(format!("no revision recorded for '{slot}'"))
        })?;
        self.read(&self.entity_key(&slot, *revision))
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> DomainResult<T> {
        let raw = self
            .backend
            .get(key)?
            .ok_or_else(|| DomainError::Persistence(format!("missing entry '{key}'")))?;
        serde_json::from_str(&raw)
            .map_err(|e| DomainError::Persistence(format!("entry '{key}' is not readable: {e}")))
    }

    fn workspace_key(&self) -> String {
        format!("{}:workspace", self.prefix)
    }

    fn entity_key(&self, slot: &str, revision: u64) -> String {
        format!("{}:{slot}@{revision}", self.prefix)
    }

    fn owns(&self, key: &str) -> bool {
        key.strip_prefix(&self.prefix).is_some_and(|rest| rest.starts_with(':'))
    }
}

impl<S: KeyValueStore> SnapshotSink for PersistenceAdapter<S> {
    fn hydrate(&mut self) -> DomainResult<Workspace> {
        PersistenceAdapter::hydrate(self)
    }

    fn flush(&mut self, snapshot: &Workspace) -> DomainResult<()> {
        PersistenceAdapter::flush(self, snapshot).map(|_| ())
    }

    fn take_error(&mut self) -> Option<DomainError> {
        self.pending_error.take()
    }
}

fn slot(kind: &str, id: &str) -> String {
    format!("{kind}:{id}")
}

/// One serialized entry per app, page and table, keyed by slot.
fn encode_entities(workspace: &Workspace) -> DomainResult<BTreeMap<String, String>> {
    let mut entries = BTreeMap::new();
    for app in workspace.apps.values() {
        let entry = AppEntry {
            app: app.clone(),
            library: collect_components(workspace, &app.components),
        };
        entries.insert(slot("app", app.id.as_str()), serde_json::to_string(&entry)?);
    }
    for page in workspace.pages.values() {
        let entry = PageEntry {
            page: page.clone(),
            components: collect_components(workspace, &page.components),
        };
        entries.insert(slot("page", page.id.as_str()), serde_json::to_string(&entry)?);
    }
    for table in workspace.tables.values() {
        entries.insert(slot("table", table.id.as_str()), serde_json::to_string(table)?);
    }
    Ok(entries)
}

fn collect_components(workspace: &Workspace, roots: &[ComponentId]) -> Vec<Component> {
    roots
        .iter()
        .flat_map(|root| workspace.subtree(root))
        .filter_map(|id| workspace.components.get(&id).cloned())
        .collect()
}

fn insert_components(workspace: &mut Workspace, components: Vec<Component>) {
    for component in components {
        workspace.components.insert(component.id.clone(), component);
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
