//! In-process scratch backend: `key → byte buffer`.
//!
//! The closest stage to the client. Contents live for the process lifetime
//! and are never a persistence target. Registered as `memory`; connection
//! URIs look like `file:/<name>?vfs=memory`.

use std::collections::HashMap;
use std::os::raw::c_int;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use rusqlite::ffi as sqlite;

use super::{ffi, FileLock, LockLevel, LockState, OpenOptions, Vfs, VfsFile};
use crate::error::{IoKind, VfsError};

const MEMORY_SECTOR_SIZE: c_int = 4096;

const ACCEPTED_TYPES: c_int = sqlite::SQLITE_OPEN_MAIN_DB
    | sqlite::SQLITE_OPEN_TEMP_DB
    | sqlite::SQLITE_OPEN_TRANSIENT_DB
    | sqlite::SQLITE_OPEN_MAIN_JOURNAL
    | sqlite::SQLITE_OPEN_TEMP_JOURNAL
    | sqlite::SQLITE_OPEN_SUBJOURNAL
    | sqlite::SQLITE_OPEN_SUPER_JOURNAL
    | sqlite::SQLITE_OPEN_WAL;

struct MemEntry {
    data: RwLock<Vec<u8>>,
    lock: Arc<Mutex<LockState>>,
}

fn files() -> &'static Mutex<HashMap<String, Arc<MemEntry>>> {
    static FILES: OnceLock<Mutex<HashMap<String, Arc<MemEntry>>>> = OnceLock::new();
    FILES.get_or_init(|| Mutex::new(HashMap::new()))
}

static REGISTERED: OnceLock<()> = OnceLock::new();

/// Register the backend with the engine. One-shot per process.
pub fn register() -> Result<(), VfsError> {
    let mut result = Ok(());
    REGISTERED.get_or_init(|| {
        result = ffi::register("memory", Box::new(MemoryVfs));
    });
    result
}

/// Remove a key from the store.
pub fn delete(key: &str) {
    files().lock().remove(key);
}

/// Keys currently held in the store.
pub fn list_keys() -> Vec<String> {
    let mut keys: Vec<String> = files().lock().keys().cloned().collect();
    keys.sort();
    keys
}

struct MemoryVfs;

impl Vfs for MemoryVfs {
    fn open(&self, name: &str, opts: &OpenOptions) -> Result<Box<dyn VfsFile>, VfsError> {
        if !opts.is_any_class(ACCEPTED_TYPES) {
            return Err(VfsError::CantOpen);
        }

        let entry = {
            let mut files = files().lock();
            match files.get(name) {
                Some(entry) => {
                    if opts.exclusive && opts.create {
                        return Err(VfsError::CantOpen);
                    }
                    Arc::clone(entry)
                }
                None => {
                    if !opts.create {
                        return Err(VfsError::CantOpen);
                    }
                    let entry = Arc::new(MemEntry {
                        data: RwLock::new(Vec::new()),
                        lock: Arc::new(Mutex::new(LockState::default())),
                    });
                    files.insert(name.to_string(), Arc::clone(&entry));
                    entry
                }
            }
        };

        let lock = FileLock::new(Arc::clone(&entry.lock));
        Ok(Box::new(MemoryFile {
            entry,
            read_only: opts.read_only,
            lock,
        }))
    }

    fn delete(&self, name: &str) -> Result<(), VfsError> {
        files().lock().remove(name);
        Ok(())
    }

    fn access(&self, name: &str) -> Result<bool, VfsError> {
        Ok(files().lock().contains_key(name))
    }

    fn full_pathname(&self, name: &str) -> String {
        name.to_string()
    }
}

struct MemoryFile {
    entry: Arc<MemEntry>,
    read_only: bool,
    lock: FileLock,
}

impl VfsFile for MemoryFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, VfsError> {
        let data = self.entry.data.read();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let available = data.len() - offset;
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<(), VfsError> {
        if self.read_only {
            return Err(VfsError::Io(IoKind::Write));
        }
        let mut data = self.entry.data.write();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<(), VfsError> {
        if self.read_only {
            return Err(VfsError::Io(IoKind::Truncate));
        }
        let mut data = self.entry.data.write();
        data.resize(size as usize, 0);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), VfsError> {
        Ok(())
    }

    fn size(&self) -> Result<u64, VfsError> {
        Ok(self.entry.data.read().len() as u64)
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
        MEMORY_SECTOR_SIZE
    }

    fn device_characteristics(&self) -> c_int {
        sqlite::SQLITE_IOCAP_ATOMIC
            | sqlite::SQLITE_IOCAP_SEQUENTIAL
            | sqlite::SQLITE_IOCAP_SAFE_APPEND
    }

    fn close(&mut self) -> Result<(), VfsError> {
        self.lock.release(LockLevel::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_opts(create: bool) -> OpenOptions {
        let mut raw = sqlite::SQLITE_OPEN_MAIN_DB | sqlite::SQLITE_OPEN_READWRITE;
        if create {
            raw |= sqlite::SQLITE_OPEN_CREATE;
        }
        OpenOptions::from_raw(raw)
    }

    #[test]
    fn test_memory_create_write_read() {
        let vfs = MemoryVfs;
        let mut file = vfs.open("/mem_rw", &open_opts(true)).unwrap();

        file.write_at(b"hello", 0).unwrap();
        file.write_at(b"world", 5).unwrap();
        assert_eq!(file.size().unwrap(), 10);

        let mut buf = [0u8; 10];
        let n = file.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf, b"helloworld");

        // Reading past the end yields nothing
        assert_eq!(file.read_at(&mut buf, 100).unwrap(), 0);

        delete("/mem_rw");
    }

    #[test]
    fn test_memory_open_missing_without_create() {
        let vfs = MemoryVfs;
        assert!(vfs.open("/mem_missing", &open_opts(false)).is_err());
    }

    #[test]
    fn test_memory_sparse_write_zero_fills() {
        let vfs = MemoryVfs;
        let mut file = vfs.open("/mem_sparse", &open_opts(true)).unwrap();

        file.write_at(b"x", 8).unwrap();
        let mut buf = [0xffu8; 9];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 9);
        assert_eq!(&buf[..8], &[0u8; 8]);
        assert_eq!(buf[8], b'x');

        delete("/mem_sparse");
    }

    #[test]
    fn test_memory_delete_and_access() {
        let vfs = MemoryVfs;
        let _file = vfs.open("/mem_del", &open_opts(true)).unwrap();
        assert!(vfs.access("/mem_del").unwrap());

        vfs.delete("/mem_del").unwrap();
        assert!(!vfs.access("/mem_del").unwrap());
    }
}
