//! Local filesystem backend, registered as `disk`.
//!
//! A thin adapter over `std::fs::File`. Locking is emulated per absolute
//! path through a process-wide map so multiple connections to the same file
//! coordinate exactly like the other backends; the entry is dropped when the
//! last handle closes clean.

use std::collections::HashMap;
use std::os::raw::c_int;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::ffi as sqlite;
use tracing::{debug, info};

use super::{ffi, FileLock, LockLevel, LockState, OpenOptions, Vfs, VfsFile};
use crate::error::{IoKind, VfsError};

const DISK_SECTOR_SIZE: c_int = 4096;

const ACCEPTED_TYPES: c_int = sqlite::SQLITE_OPEN_MAIN_DB
    | sqlite::SQLITE_OPEN_TEMP_DB
    | sqlite::SQLITE_OPEN_TRANSIENT_DB
    | sqlite::SQLITE_OPEN_MAIN_JOURNAL
    | sqlite::SQLITE_OPEN_TEMP_JOURNAL
    | sqlite::SQLITE_OPEN_SUBJOURNAL
    | sqlite::SQLITE_OPEN_WAL;

// Lock coordination between handles on the same absolute path.
fn file_locks() -> &'static Mutex<HashMap<String, Arc<Mutex<LockState>>>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<Mutex<LockState>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

static REGISTERED: OnceLock<()> = OnceLock::new();

/// Register the backend with the engine. One-shot per process.
pub fn register() -> Result<(), VfsError> {
    let mut result = Ok(());
    REGISTERED.get_or_init(|| {
        result = ffi::register("disk", Box::new(LocalVfs));
    });
    result
}

/// Ensure the configured storage directory exists and is empty. The service
/// treats it as a scratch area it exclusively manages.
pub fn prepare_directory(path: &str) -> Result<PathBuf> {
    let abs = absolute_path(path);

    if !abs.exists() {
        std::fs::create_dir_all(&abs)
            .with_context(|| format!("Failed to create local storage directory {:?}", abs))?;
        info!(directory = ?abs, "Created local storage directory");
        return Ok(abs);
    }

    let entries = std::fs::read_dir(&abs)
        .with_context(|| format!("Failed to read local storage directory {:?}", abs))?;
    for entry in entries {
        let entry = entry?;
        let entry_path = entry.path();
        if entry_path.is_dir() {
            std::fs::remove_dir_all(&entry_path)
        } else {
            std::fs::remove_file(&entry_path)
        }
        .with_context(|| format!("Failed to clear {:?} from local storage directory", entry_path))?;
        debug!(path = ?entry_path, "Removed stale entry from local storage directory");
    }

    Ok(abs)
}

fn absolute_path(name: &str) -> PathBuf {
    let path = Path::new(name);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    }
}

struct LocalVfs;

impl Vfs for LocalVfs {
    fn open(&self, name: &str, opts: &OpenOptions) -> Result<Box<dyn VfsFile>, VfsError> {
        if !opts.is_any_class(ACCEPTED_TYPES) {
            return Err(VfsError::CantOpen);
        }

        // Anonymous temp files get bare generated names; park them in the
        // system temp directory.
        let path = if Path::new(name).is_absolute() {
            PathBuf::from(name)
        } else if name.starts_with("temp_") {
            std::env::temp_dir().join(name)
        } else {
            absolute_path(name)
        };

        let mut options = std::fs::OpenOptions::new();
        options.read(true);
        if !opts.read_only {
            options.write(true);
            if opts.create {
                options.create(true);
            }
            if opts.exclusive {
                options.create_new(true);
            }
        }

        let file = options.open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VfsError::CantOpen
            } else {
                VfsError::Io(IoKind::Access)
            }
        })?;

        let key = path.to_string_lossy().to_string();
        let state = {
            let mut locks = file_locks().lock();
            Arc::clone(
                locks
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(LockState::default()))),
            )
        };

        Ok(Box::new(LocalFile {
            file,
            path: key,
            read_only: opts.read_only,
            lock: FileLock::new(state),
        }))
    }

    fn delete(&self, name: &str) -> Result<(), VfsError> {
        match std::fs::remove_file(name) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(_) => Err(VfsError::Io(IoKind::Delete)),
        }
    }

    fn access(&self, name: &str) -> Result<bool, VfsError> {
        match std::fs::metadata(name) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(_) => Err(VfsError::Io(IoKind::Access)),
        }
    }

    fn full_pathname(&self, name: &str) -> String {
        absolute_path(name).to_string_lossy().to_string()
    }
}

struct LocalFile {
    file: std::fs::File,
    path: String,
    read_only: bool,
    lock: FileLock,
}

impl VfsFile for LocalFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, VfsError> {
        let mut total = 0;
        while total < buf.len() {
            match self.file.read_at(&mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return Err(VfsError::Io(IoKind::Read)),
            }
        }
        Ok(total)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<(), VfsError> {
        if self.read_only {
            return Err(VfsError::Io(IoKind::Write));
        }
        self.file
            .write_all_at(buf, offset)
            .map_err(|_| VfsError::Io(IoKind::Write))
    }

    fn truncate(&mut self, size: u64) -> Result<(), VfsError> {
        if self.read_only {
            return Err(VfsError::Io(IoKind::Truncate));
        }
        self.file
            .set_len(size)
            .map_err(|_| VfsError::Io(IoKind::Truncate))
    }

    fn sync(&mut self) -> Result<(), VfsError> {
        if self.read_only {
            return Ok(());
        }
        self.file
            .sync_all()
            .map_err(|_| VfsError::Io(IoKind::Fsync))
    }

    fn size(&self) -> Result<u64, VfsError> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|_| VfsError::Io(IoKind::Fstat))
    }

    fn lock(&mut self, level: LockLevel) -> Result<(), VfsError> {
        self.lock.acquire(level, self.read_only)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<(), VfsError> {
        self.lock.release(level)
    }

    fn check_reserved_lock(&self) -> Result<bool, VfsError> {
        Ok(self.lock.is_reserved())
    }

    fn sector_size(&self) -> c_int {
        DISK_SECTOR_SIZE
    }

    fn device_characteristics(&self) -> c_int {
        let mut caps = sqlite::SQLITE_IOCAP_ATOMIC512 | sqlite::SQLITE_IOCAP_SAFE_APPEND;
        if cfg!(any(target_os = "linux", target_os = "macos")) {
            caps |= sqlite::SQLITE_IOCAP_ATOMIC1K
                | sqlite::SQLITE_IOCAP_ATOMIC2K
                | sqlite::SQLITE_IOCAP_ATOMIC4K;
        }
        caps
    }

    fn close(&mut self) -> Result<(), VfsError> {
        self.lock.release(LockLevel::None)?;

        // Drop the shared lock entry once nobody holds a claim.
        let mut locks = file_locks().lock();
        if let Some(state) = locks.get(&self.path) {
            if state.lock().is_unused() {
                locks.remove(&self.path);
            }
        }
        Ok(())
    }
}

/// List `.db` files in a directory, as `(name, absolute path)` pairs.
pub fn list_database_files(dir: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read local storage directory {}", dir))?;

    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        if let Some(base) = file_name.strip_suffix(".db") {
            out.push((
                base.to_string(),
                entry.path().to_string_lossy().to_string(),
            ));
        }
    }

    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_opts(create: bool) -> OpenOptions {
        let mut raw = sqlite::SQLITE_OPEN_MAIN_DB | sqlite::SQLITE_OPEN_READWRITE;
        if create {
            raw |= sqlite::SQLITE_OPEN_CREATE;
        }
        OpenOptions::from_raw(raw)
    }

    #[test]
    fn test_local_create_write_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("local.db");
        let vfs = LocalVfs;

        let mut file = vfs
            .open(path.to_str().unwrap(), &open_opts(true))
            .unwrap();
        file.write_at(b"abcdef", 0).unwrap();
        file.sync().unwrap();
        assert_eq!(file.size().unwrap(), 6);

        let mut buf = [0u8; 3];
        assert_eq!(file.read_at(&mut buf, 3).unwrap(), 3);
        assert_eq!(&buf, b"def");

        file.truncate(2).unwrap();
        assert_eq!(file.size().unwrap(), 2);
        file.close().unwrap();
    }

    #[test]
    fn test_local_open_missing_without_create() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.db");
        let vfs = LocalVfs;
        assert!(vfs.open(path.to_str().unwrap(), &open_opts(false)).is_err());
    }

    #[test]
    fn test_local_lock_entry_cleanup_on_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locked.db");
        let vfs = LocalVfs;

        let mut file = vfs.open(path.to_str().unwrap(), &open_opts(true)).unwrap();
        let key = path.to_string_lossy().to_string();
        assert!(file_locks().lock().contains_key(&key));

        file.lock(LockLevel::Shared).unwrap();
        file.unlock(LockLevel::None).unwrap();
        file.close().unwrap();
        assert!(!file_locks().lock().contains_key(&key));
    }

    #[test]
    fn test_prepare_directory_clears_existing_content() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("stale.db");
        std::fs::write(&stale, b"old").unwrap();

        prepare_directory(dir.path().to_str().unwrap()).unwrap();
        assert!(!stale.exists());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_list_database_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("users.db"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let found = list_database_files(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "users");
    }
}
