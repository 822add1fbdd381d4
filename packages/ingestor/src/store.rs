//! Latest Result Store
//!
//! Durable single-slot persistence of the most recent successful parse.
//! Every save overwrites the slot; there is no history.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use thiserror::Error;
use tracing::debug;

/// Application directory name under the platform data directory
pub const APP_DIR_NAME: &str = "sms-ledger";

/// File name of the single result slot
pub const SLOT_FILE_NAME: &str = "latest.json";

/// Errors that can occur while reading or writing the slot
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No data directory available on this platform")]
    NoDataDir,

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Single named slot holding the latest serialized parse payload
#[cfg_attr(test, mockall::automock)]
pub trait ResultStore: Send + Sync {
    /// Overwrite the slot; durable once this returns
    fn save(&self, payload: &str) -> Result<(), StoreError>;

    /// Most recently saved payload, if any
    fn load(&self) -> Result<Option<String>, StoreError>;
}

/// Default store directory, e.g. `~/.local/share/sms-ledger` on Linux
pub fn default_store_dir() -> Result<PathBuf, StoreError> {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or(StoreError::NoDataDir)
}

/// File-backed slot
///
/// Saves write a sibling temp file, fsync it, rename it over the slot, and
/// fsync the directory, so a reader never observes a partial payload and a
/// completed save survives power loss.
pub struct FileResultStore {
    dir: PathBuf,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileResultStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            path: dir.join(SLOT_FILE_NAME),
            write_lock: Mutex::new(()),
        })
    }

    /// Open the store in the platform data directory
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(default_store_dir()?)
    }

    /// Path of the slot file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

/// Persist directory entries, making a finished rename durable
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

// directories cannot be opened for syncing here; rename durability is left to the OS
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

impl ResultStore for FileResultStore {
    fn save(&self, payload: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(io_error(&tmp))?;
        file.write_all(payload.as_bytes()).map_err(io_error(&tmp))?;
        file.sync_all().map_err(io_error(&tmp))?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(io_error(&self.path))?;
        sync_dir(&self.dir).map_err(io_error(&self.dir))?;
        debug!(path = %self.path.display(), bytes = payload.len(), "saved latest result");
        Ok(())
    }

    fn load(&self) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&self.path)(e)),
        }
    }
}

/// In-memory slot for tests and embedders that bring their own persistence
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    slot: RwLock<Option<String>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultStore for MemoryResultStore {
    fn save(&self, payload: &str) -> Result<(), StoreError> {
        let mut slot = self.slot.write().map_err(|_| StoreError::Poisoned)?;
        *slot = Some(payload.to_string());
        Ok(())
    }

    fn load(&self) -> Result<Option<String>, StoreError> {
        let slot = self.slot.read().map_err(|_| StoreError::Poisoned)?;
        Ok(slot.clone())
    }
}
