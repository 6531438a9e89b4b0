//! pagecraft - state core of a no-code application builder.
//!
//! A workspace holds apps, their pages and component trees, a reusable
//! component library per app, and data tables. Every mutation goes through
//! [`application::Store`], which applies it atomically, records undo history,
//! notifies subscribers and writes the new snapshot through to a key-value
//! store.

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
pub use application::*;

use infrastructure::{BackgroundFlusher, BuilderConfig, FileKeyValueStore, PersistenceAdapter};

/// A store persisted to files by a background flusher.
pub type FileStore = Store<BackgroundFlusher<FileKeyValueStore>>;

/// Opens the file-backed workspace described by `config`, seeding it on first use.
pub fn open_workspace(config: &BuilderConfig) -> DomainResult<FileStore> {
    let backend = FileKeyValueStore::open(&config.storage_dir)?;
    let adapter = PersistenceAdapter::new(
        backend,
        config.key_prefix.clone(),
        config.default_app_name.clone(),
    );
    Store::open(BackgroundFlusher::spawn(adapter), config.undo_limit)
}
