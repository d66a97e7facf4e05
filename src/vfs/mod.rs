//! Storage backends exposed to the embedded SQL engine.
//!
//! Three backends share one capability set: an in-process page store
//! (`memory`), the real filesystem (`disk`) and an S3-compatible object
//! store (`r2`). The stage manager depends only on this capability set,
//! never on a concrete backend.

pub mod ffi;
pub mod local;
pub mod lock;
pub mod memory;
pub mod remote;

use std::os::raw::c_int;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::ffi as sqlite;
use tracing::info;

use crate::error::VfsError;
use crate::object_store::ObjectStore;
pub use lock::{FileLock, LockLevel, LockState};

/// Open-time flags, decoded from the engine's raw bitmask.
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    pub raw: c_int,
    pub read_only: bool,
    pub create: bool,
    pub exclusive: bool,
    pub delete_on_close: bool,
}

impl OpenOptions {
    pub fn from_raw(raw: c_int) -> Self {
        Self {
            raw,
            read_only: raw & sqlite::SQLITE_OPEN_READONLY != 0,
            create: raw & sqlite::SQLITE_OPEN_CREATE != 0,
            exclusive: raw & sqlite::SQLITE_OPEN_EXCLUSIVE != 0,
            delete_on_close: raw & sqlite::SQLITE_OPEN_DELETEONCLOSE != 0,
        }
    }

    /// True when any of the given file-class bits are set.
    pub fn is_any_class(&self, mask: c_int) -> bool {
        self.raw & mask != 0
    }
}

/// Operations a backend supports on the namespace itself.
pub trait Vfs: Send + Sync {
    fn open(&self, name: &str, opts: &OpenOptions) -> Result<Box<dyn VfsFile>, VfsError>;

    fn delete(&self, name: &str) -> Result<(), VfsError>;

    fn access(&self, name: &str) -> Result<bool, VfsError>;

    fn full_pathname(&self, name: &str) -> String;
}

/// Operations on one open file.
///
/// Offsets and lengths are bytes; backends map them onto their own sector
/// granularity internally.
pub trait VfsFile: Send {
    /// Read into `buf` at `offset`; returns the bytes produced, which is
    /// short (or zero) at end of file.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, VfsError>;

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<(), VfsError>;

    fn truncate(&mut self, size: u64) -> Result<(), VfsError>;

    fn sync(&mut self) -> Result<(), VfsError>;

    fn size(&self) -> Result<u64, VfsError>;

    fn lock(&mut self, level: LockLevel) -> Result<(), VfsError>;

    fn unlock(&mut self, level: LockLevel) -> Result<(), VfsError>;

    fn check_reserved_lock(&self) -> Result<bool, VfsError>;

    fn sector_size(&self) -> c_int;

    fn device_characteristics(&self) -> c_int;

    fn close(&mut self) -> Result<(), VfsError>;
}

/// Register all three backends with the engine. Registration is process-wide
/// and one-shot; repeated calls are no-ops.
pub fn register_all(store: Arc<dyn ObjectStore>) -> Result<()> {
    info!("Registering memory VFS");
    memory::register().context("Failed to register memory VFS")?;

    info!("Registering local VFS");
    local::register().context("Failed to register local VFS")?;

    info!("Registering remote VFS");
    remote::register(store).context("Failed to register remote VFS")?;

    Ok(())
}
