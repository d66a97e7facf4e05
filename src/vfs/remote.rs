//! Object-store backend, registered as `r2`.
//!
//! Adapts the engine's random-access, lockable-file expectations onto a flat
//! store of whole objects: reads come in through a 64 KiB sector cache fed
//! by ranged GETs, writes stay local in dirty sectors, and sync rewrites the
//! whole object with one PUT. The object store has no partial-update
//! primitive, so whole-object writeback is the correct (if blunt) strategy;
//! the contract only requires the object to match the in-memory view at the
//! moment sync began.
//!
//! Lock state is per open handle: a single service instance owns each
//! object, and cross-instance writers are last-writer-wins by design.

use std::collections::{BTreeSet, HashMap};
use std::os::raw::c_int;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use rusqlite::ffi as sqlite;
use tracing::{debug, error};

use super::{ffi, FileLock, LockLevel, OpenOptions, Vfs, VfsFile};
use crate::error::{IoKind, VfsError};
use crate::object_store::{ObjectStore, StoreError};

/// 64 KiB sectors; must stay at least the engine's maximum page size.
pub const SECTOR_SIZE: usize = 65536;

/// 100 MiB sector cache per open file.
const MAX_CACHE_BYTES: usize = 100 * 1024 * 1024;
const MAX_CACHED_SECTORS: usize = MAX_CACHE_BYTES / SECTOR_SIZE;

// The sector size must be a multiple of the largest page size.
const _: () = assert!(SECTOR_SIZE % 65536 == 0);

const ACCEPTED_TYPES: c_int = sqlite::SQLITE_OPEN_MAIN_DB
    | sqlite::SQLITE_OPEN_TEMP_DB
    | sqlite::SQLITE_OPEN_TRANSIENT_DB
    | sqlite::SQLITE_OPEN_MAIN_JOURNAL
    | sqlite::SQLITE_OPEN_TEMP_JOURNAL
    | sqlite::SQLITE_OPEN_SUBJOURNAL
    | sqlite::SQLITE_OPEN_SUPER_JOURNAL;

static STORE: OnceLock<Arc<dyn ObjectStore>> = OnceLock::new();

/// Register the backend with the engine, bound to the given store. One-shot
/// per process; later calls are no-ops.
pub fn register(store: Arc<dyn ObjectStore>) -> Result<(), VfsError> {
    if STORE.set(Arc::clone(&store)).is_err() {
        return Ok(());
    }
    ffi::register("r2", Box::new(RemoteVfs { store }))
}

struct RemoteVfs {
    store: Arc<dyn ObjectStore>,
}

impl Vfs for RemoteVfs {
    fn open(&self, name: &str, opts: &OpenOptions) -> Result<Box<dyn VfsFile>, VfsError> {
        debug!(key = name, flags = opts.raw, "Opening remote object");

        if !opts.is_any_class(ACCEPTED_TYPES) {
            error!(flags = opts.raw, "Unsupported file type for remote backend");
            return Err(VfsError::CantOpen);
        }

        let size = match self.store.head(name) {
            Ok(Some(size)) => size,
            Ok(None) | Err(_) => {
                if !opts.create {
                    error!(key = name, "Object missing and CREATE flag not set");
                    return Err(VfsError::CantOpen);
                }
                0
            }
        };

        Ok(Box::new(RemoteFile::new(
            name.to_string(),
            Arc::clone(&self.store),
            opts.read_only,
            size,
            MAX_CACHED_SECTORS,
        )))
    }

    fn delete(&self, name: &str) -> Result<(), VfsError> {
        self.store
            .delete(name)
            .map_err(|_| VfsError::Io(IoKind::Delete))
    }

    fn access(&self, name: &str) -> Result<bool, VfsError> {
        Ok(matches!(self.store.head(name), Ok(Some(_))))
    }

    fn full_pathname(&self, name: &str) -> String {
        name.to_string()
    }
}

struct Sector {
    data: Box<[u8]>,
    dirty: bool,
    last_used: AtomicU64,
}

struct RemoteFile {
    key: String,
    store: Arc<dyn ObjectStore>,
    read_only: bool,
    size: u64,
    /// Resident sectors; reads take the reader side, population and eviction
    /// take the writer side.
    cache: RwLock<HashMap<u64, Sector>>,
    /// Sector indices pending writeback. Lock order: dirty set before cache.
    dirty: Mutex<BTreeSet<u64>>,
    lock: FileLock,
    use_clock: AtomicU64,
    max_cached_sectors: usize,
}

impl RemoteFile {
    fn new(
        key: String,
        store: Arc<dyn ObjectStore>,
        read_only: bool,
        size: u64,
        max_cached_sectors: usize,
    ) -> Self {
        Self {
            key,
            store,
            read_only,
            size,
            cache: RwLock::new(HashMap::new()),
            dirty: Mutex::new(BTreeSet::new()),
            lock: FileLock::standalone(),
            use_clock: AtomicU64::new(0),
            max_cached_sectors,
        }
    }

    fn tick(&self) -> u64 {
        self.use_clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Run `f` against a resident sector, fetching it on a miss.
    fn with_sector<R>(
        &self,
        index: u64,
        f: impl FnOnce(&Sector) -> R,
    ) -> Result<R, VfsError> {
        {
            let cache = self.cache.read();
            if let Some(sector) = cache.get(&index) {
                sector.last_used.store(self.tick(), Ordering::Relaxed);
                return Ok(f(sector));
            }
        }

        let mut cache = self.cache.write();
        // Another path may have populated it while we upgraded.
        if !cache.contains_key(&index) {
            if cache.len() >= self.max_cached_sectors {
                Self::evict_lru_clean(&mut cache);
            }
            let sector = self.fetch_sector(index)?;
            cache.insert(index, sector);
        }

        let sector = cache.get(&index).expect("sector resident after insert");
        sector.last_used.store(self.tick(), Ordering::Relaxed);
        Ok(f(sector))
    }

    /// Like [`with_sector`] but with mutable access, for the write path.
    fn with_sector_mut<R>(
        &self,
        index: u64,
        f: impl FnOnce(&mut Sector) -> R,
    ) -> Result<R, VfsError> {
        let mut cache = self.cache.write();
        if !cache.contains_key(&index) {
            if cache.len() >= self.max_cached_sectors {
                Self::evict_lru_clean(&mut cache);
            }
            let sector = self.fetch_sector(index)?;
            cache.insert(index, sector);
        }

        let sector = cache.get_mut(&index).expect("sector resident after insert");
        sector.last_used.store(self.tick(), Ordering::Relaxed);
        Ok(f(sector))
    }

    /// Drop the least-recently-used clean sector. Dirty sectors are pinned
    /// until writeback, so under heavy write load the cache may temporarily
    /// exceed capacity.
    fn evict_lru_clean(cache: &mut HashMap<u64, Sector>) {
        let oldest = cache
            .iter()
            .filter(|(_, sector)| !sector.dirty)
            .min_by_key(|(_, sector)| sector.last_used.load(Ordering::Relaxed))
            .map(|(&index, _)| index);

        if let Some(index) = oldest {
            cache.remove(&index);
        }
    }

    fn fetch_sector(&self, index: u64) -> Result<Sector, VfsError> {
        let start = index * SECTOR_SIZE as u64;
        let mut data = vec![0u8; SECTOR_SIZE].into_boxed_slice();

        if start < self.size {
            let end = (start + SECTOR_SIZE as u64 - 1).min(self.size - 1);
            debug!(
                key = %self.key,
                sector = index,
                start,
                end,
                size = self.size,
                "Fetching sector"
            );

            let bytes = self.store.get_range(&self.key, start, end).map_err(|e| {
                error!(key = %self.key, sector = index, error = %e, "Sector fetch failed");
                VfsError::Io(IoKind::Read)
            })?;

            let n = bytes.len().min(SECTOR_SIZE);
            data[..n].copy_from_slice(&bytes[..n]);
        }

        Ok(Sector {
            data,
            dirty: false,
            last_used: AtomicU64::new(self.tick()),
        })
    }

    #[cfg(test)]
    fn cached_sector_count(&self) -> usize {
        self.cache.read().len()
    }

    #[cfg(test)]
    fn dirty_sector_count(&self) -> usize {
        self.dirty.lock().len()
    }
}

impl VfsFile for RemoteFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, VfsError> {
        if offset >= self.size {
            return Ok(0);
        }

        let mut bytes_read = 0usize;
        while bytes_read < buf.len() {
            let current = offset + bytes_read as u64;
            if current >= self.size {
                break;
            }

            let index = current / SECTOR_SIZE as u64;
            let in_sector = (current % SECTOR_SIZE as u64) as usize;

            let remaining_in_sector = SECTOR_SIZE - in_sector;
            let remaining_in_file = (self.size - current) as usize;
            let to_read = remaining_in_sector
                .min(remaining_in_file)
                .min(buf.len() - bytes_read);

            self.with_sector(index, |sector| {
                buf[bytes_read..bytes_read + to_read]
                    .copy_from_slice(&sector.data[in_sector..in_sector + to_read]);
            })?;
            bytes_read += to_read;
        }

        Ok(bytes_read)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<(), VfsError> {
        if self.read_only {
            error!(key = %self.key, "Write on read-only handle");
            return Err(VfsError::Io(IoKind::Write));
        }

        let mut written = 0usize;
        while written < buf.len() {
            let current = offset + written as u64;
            let index = current / SECTOR_SIZE as u64;
            let in_sector = (current % SECTOR_SIZE as u64) as usize;
            let to_write = (SECTOR_SIZE - in_sector).min(buf.len() - written);

            // Fetch first so partial-sector writes preserve untouched bytes.
            let mut dirty = self.dirty.lock();
            self.with_sector_mut(index, |sector| {
                sector.data[in_sector..in_sector + to_write]
                    .copy_from_slice(&buf[written..written + to_write]);
                sector.dirty = true;
            })?;
            dirty.insert(index);
            drop(dirty);

            written += to_write;
        }

        let new_size = offset + buf.len() as u64;
        if new_size > self.size {
            self.size = new_size;
        }

        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<(), VfsError> {
        if self.read_only {
            return Err(VfsError::Io(IoKind::Truncate));
        }

        self.size = size;

        let mut dirty = self.dirty.lock();
        let mut cache = self.cache.write();

        let first_dropped = size.div_ceil(SECTOR_SIZE as u64);
        cache.retain(|&index, _| index < first_dropped);
        dirty.retain(|&index| index < first_dropped);

        if size % SECTOR_SIZE as u64 != 0 {
            let last = size / SECTOR_SIZE as u64;
            if let Some(sector) = cache.get_mut(&last) {
                let tail_start = (size % SECTOR_SIZE as u64) as usize;
                sector.data[tail_start..].fill(0);
                sector.dirty = true;
                dirty.insert(last);
            }
        }

        Ok(())
    }

    fn sync(&mut self) -> Result<(), VfsError> {
        if self.read_only {
            return Ok(());
        }

        let mut dirty = self.dirty.lock();
        if dirty.is_empty() {
            debug!(key = %self.key, "No dirty sectors to sync");
            return Ok(());
        }

        let mut buf = vec![0u8; self.size as usize];

        if self.size > 0 {
            match self.store.get(&self.key) {
                Ok(existing) => {
                    let n = existing.len().min(buf.len());
                    buf[..n].copy_from_slice(&existing[..n]);
                }
                Err(StoreError::NotFound) => {
                    debug!(key = %self.key, "Object absent; writeback creates it");
                }
                Err(e) => {
                    debug!(key = %self.key, error = %e, "Pre-writeback read failed; writing dirty view");
                }
            }
        }

        {
            let cache = self.cache.read();
            for &index in dirty.iter() {
                let Some(sector) = cache.get(&index) else {
                    continue;
                };
                let start = index as usize * SECTOR_SIZE;
                if start >= buf.len() {
                    continue;
                }
                let end = (start + SECTOR_SIZE).min(buf.len());
                buf[start..end].copy_from_slice(&sector.data[..end - start]);
            }
        }

        if let Err(e) = self.store.put(&self.key, &buf) {
            // Keep the dirty set; the next sync retries the writeback.
            error!(key = %self.key, error = %e, "Whole-object writeback failed");
            return Err(VfsError::Io(IoKind::Fsync));
        }

        let mut cache = self.cache.write();
        for index in dirty.iter() {
            if let Some(sector) = cache.get_mut(index) {
                sector.dirty = false;
            }
        }
        dirty.clear();

        debug!(key = %self.key, bytes = buf.len(), "Writeback complete");
        Ok(())
    }

    fn size(&self) -> Result<u64, VfsError> {
        Ok(self.size)
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
        SECTOR_SIZE as c_int
    }

    fn device_characteristics(&self) -> c_int {
        // Whole-object writeback is atomic once the PUT lands; no power-safe
        // overwrite or sector atomicity is claimed.
        sqlite::SQLITE_IOCAP_ATOMIC
            | sqlite::SQLITE_IOCAP_SEQUENTIAL
            | sqlite::SQLITE_IOCAP_SAFE_APPEND
    }

    fn close(&mut self) -> Result<(), VfsError> {
        self.sync()?;
        self.lock.release(LockLevel::None)
    }
}

/// A database discovered in the remote tier.
#[derive(Debug, Clone)]
pub struct RemoteDatabase {
    pub key: String,
    pub name: String,
}

/// List database objects, filtering out journal/wal/shm artifacts. A key
/// counts as a database when it ends in `.db`, or has neither a dot nor a
/// slash.
pub fn list_databases(store: &dyn ObjectStore) -> Result<Vec<RemoteDatabase>, StoreError> {
    let mut databases = Vec::new();

    for object in store.list()? {
        let key = object.key;

        if key.contains("temp_")
            || key.contains("-journal")
            || key.contains("-wal")
            || key.contains("-shm")
        {
            continue;
        }

        let name = if let Some(base) = key.strip_suffix(".db") {
            base.to_string()
        } else if !key.contains('.') && !key.contains('/') {
            key.clone()
        } else {
            continue;
        };

        if !name.is_empty() {
            databases.push(RemoteDatabase { key, name });
        }
    }

    Ok(databases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::InMemoryObjectStore;

    fn test_file(store: &Arc<InMemoryObjectStore>, key: &str, max_sectors: usize) -> RemoteFile {
        let size = store.head(key).unwrap().unwrap_or(0);
        let dyn_store: Arc<dyn ObjectStore> = Arc::clone(store) as Arc<dyn ObjectStore>;
        RemoteFile::new(key.to_string(), dyn_store, false, size, max_sectors)
    }

    #[test]
    fn test_write_read_round_trip_across_sectors() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut file = test_file(&store, "round.db", MAX_CACHED_SECTORS);

        // Straddle the first sector boundary.
        let offset = SECTOR_SIZE as u64 - 3;
        file.write_at(b"boundary", offset).unwrap();
        assert_eq!(file.size().unwrap(), offset + 8);

        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(&mut buf, offset).unwrap(), 8);
        assert_eq!(&buf, b"boundary");

        // Writes never touch the network before sync.
        assert_eq!(store.put_count(), 0);
    }

    #[test]
    fn test_read_at_eof_boundaries() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("eof.db", b"0123456789").unwrap();
        let mut file = test_file(&store, "eof.db", MAX_CACHED_SECTORS);

        let mut buf = [0u8; 4];
        // Exactly at size: nothing to read.
        assert_eq!(file.read_at(&mut buf, 10).unwrap(), 0);
        // Past size: same.
        assert_eq!(file.read_at(&mut buf, 99).unwrap(), 0);
        // Short read near the end.
        assert_eq!(file.read_at(&mut buf, 8).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
    }

    #[test]
    fn test_partial_sector_write_preserves_existing_bytes() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("partial.db", b"aaaaaaaaaa").unwrap();
        let mut file = test_file(&store, "partial.db", MAX_CACHED_SECTORS);

        file.write_at(b"XY", 4).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 10);
        assert_eq!(&buf, b"aaaaXYaaaa");
    }

    #[test]
    fn test_sync_whole_object_writeback_once() {
        let store = Arc::new(InMemoryObjectStore::new());
        let body = vec![7u8; 3 * SECTOR_SIZE + 100];
        store.put("big.db", &body).unwrap();
        let puts_before = store.put_count();

        let mut file = test_file(&store, "big.db", MAX_CACHED_SECTORS);
        file.write_at(&[42], 5).unwrap();
        file.sync().unwrap();

        // Exactly one PUT, covering the entire object.
        assert_eq!(store.put_count(), puts_before + 1);
        let stored = store.get("big.db").unwrap();
        assert_eq!(stored.len(), body.len());
        assert_eq!(stored[5], 42);
        assert_eq!(stored[6], 7);
        assert_eq!(file.dirty_sector_count(), 0);
    }

    #[test]
    fn test_sync_with_no_dirty_sectors_is_a_no_op() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("clean.db", b"data").unwrap();
        let puts_before = store.put_count();

        let mut file = test_file(&store, "clean.db", MAX_CACHED_SECTORS);
        let mut buf = [0u8; 4];
        file.read_at(&mut buf, 0).unwrap();
        file.sync().unwrap();

        assert_eq!(store.put_count(), puts_before);
    }

    #[test]
    fn test_failed_sync_retains_dirty_set() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut file = test_file(&store, "retry.db", MAX_CACHED_SECTORS);

        file.write_at(b"payload", 0).unwrap();
        store.set_fail_puts(true);
        assert!(file.sync().is_err());
        assert_eq!(file.dirty_sector_count(), 1);

        store.set_fail_puts(false);
        file.sync().unwrap();
        assert_eq!(file.dirty_sector_count(), 0);
        assert_eq!(store.get("retry.db").unwrap(), b"payload");
    }

    #[test]
    fn test_truncate_unaligned_zeroes_tail_and_dirties() {
        let store = Arc::new(InMemoryObjectStore::new());
        let body = vec![9u8; SECTOR_SIZE * 2];
        store.put("trunc.db", &body).unwrap();

        let mut file = test_file(&store, "trunc.db", MAX_CACHED_SECTORS);
        // Make both sectors resident.
        let mut buf = [0u8; 1];
        file.read_at(&mut buf, 0).unwrap();
        file.read_at(&mut buf, SECTOR_SIZE as u64).unwrap();
        assert_eq!(file.cached_sector_count(), 2);

        let new_size = (SECTOR_SIZE / 2) as u64;
        file.truncate(new_size).unwrap();
        assert_eq!(file.size().unwrap(), new_size);
        // Sector 1 dropped, sector 0 kept with its tail zeroed and dirty.
        assert_eq!(file.cached_sector_count(), 1);
        assert_eq!(file.dirty_sector_count(), 1);

        file.sync().unwrap();
        let stored = store.get("trunc.db").unwrap();
        assert_eq!(stored.len(), new_size as usize);
        assert!(stored.iter().all(|&b| b == 9));
    }

    #[test]
    fn test_eviction_skips_dirty_sectors() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut file = test_file(&store, "evict.db", 2);

        // Two dirty sectors fill the cache.
        file.write_at(&[1], 0).unwrap();
        file.write_at(&[2], SECTOR_SIZE as u64).unwrap();
        assert_eq!(file.cached_sector_count(), 2);

        // A third write cannot evict anything clean; the cache grows.
        file.write_at(&[3], 2 * SECTOR_SIZE as u64).unwrap();
        assert_eq!(file.cached_sector_count(), 3);
        assert_eq!(file.dirty_sector_count(), 3);

        // After writeback everything is clean and eviction resumes.
        file.sync().unwrap();
        file.write_at(&[4], 3 * SECTOR_SIZE as u64).unwrap();
        assert!(file.cached_sector_count() <= 3);

        // All data still reads back correctly.
        let mut buf = [0u8; 1];
        for (i, expected) in [1u8, 2, 3].iter().enumerate() {
            assert_eq!(
                file.read_at(&mut buf, i as u64 * SECTOR_SIZE as u64).unwrap(),
                1
            );
            assert_eq!(buf[0], *expected);
        }
    }

    #[test]
    fn test_clean_lru_eviction_caps_cache() {
        let store = Arc::new(InMemoryObjectStore::new());
        let body = vec![0u8; SECTOR_SIZE * 8];
        store.put("lru.db", &body).unwrap();

        let mut file = test_file(&store, "lru.db", 4);
        let mut buf = [0u8; 1];
        for i in 0..8 {
            file.read_at(&mut buf, i * SECTOR_SIZE as u64).unwrap();
        }
        assert!(file.cached_sector_count() <= 4);
    }

    #[test]
    fn test_open_missing_without_create_fails() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let vfs = RemoteVfs { store };
        let opts = OpenOptions::from_raw(
            sqlite::SQLITE_OPEN_MAIN_DB | sqlite::SQLITE_OPEN_READWRITE,
        );
        assert!(vfs.open("absent.db", &opts).is_err());
    }

    #[test]
    fn test_list_databases_filters_artifacts() {
        let store = InMemoryObjectStore::new();
        store.put("users.db", b"x").unwrap();
        store.put("users.db-journal", b"x").unwrap();
        store.put("cache.db-wal", b"x").unwrap();
        store.put("cache.db-shm", b"x").unwrap();
        store.put("temp_copy_1.db", b"x").unwrap();
        store.put("bare", b"x").unwrap();
        store.put("notes.txt", b"x").unwrap();
        store.put("dir/nested", b"x").unwrap();

        let mut names: Vec<String> = list_databases(&store)
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["bare", "users"]);
    }
}
