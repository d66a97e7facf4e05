//! Glue between the [`Vfs`]/[`VfsFile`] traits and the engine's C-level
//! `sqlite3_vfs` / `sqlite3_io_methods` extension point.
//!
//! The engine allocates `szOsFile` bytes per open file; that block starts
//! with the mandatory `sqlite3_file` header followed by our shim fields.
//! Every field is raw-initialized in `x_open` before any early return, so a
//! failed open never leaves the block half-built, and `pMethods` stays null
//! so the engine skips `xClose` on failure. Backend trait calls run under a
//! panic guard; unwinding across the C boundary is undefined.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::panic::AssertUnwindSafe;
use std::ptr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use rusqlite::ffi as sqlite;

use super::{LockLevel, OpenOptions, Vfs, VfsFile};
use crate::error::VfsError;

const MAX_PATHNAME: c_int = 512;

/// Milliseconds between the julian-day epoch and the unix epoch.
const JULIAN_UNIX_EPOCH_MS: i64 = 210_866_760_000_000;

struct VfsShell {
    name: CString,
    inner: Box<dyn Vfs>,
}

#[repr(C)]
struct FileShim {
    base: sqlite::sqlite3_file,
    shell: *const VfsShell,
    file: Option<Box<dyn VfsFile>>,
    delete_on_close: Option<String>,
}

/// Register `inner` with the engine under `name`. The shell and descriptor
/// are leaked deliberately: the engine keeps the pointers for the lifetime
/// of the process.
pub fn register(name: &str, inner: Box<dyn Vfs>) -> Result<(), VfsError> {
    let name = CString::new(name).map_err(|_| VfsError::CantOpen)?;
    let shell: &'static VfsShell = Box::leak(Box::new(VfsShell { name, inner }));

    let descriptor = Box::new(sqlite::sqlite3_vfs {
        iVersion: 2,
        szOsFile: std::mem::size_of::<FileShim>() as c_int,
        mxPathname: MAX_PATHNAME,
        pNext: ptr::null_mut(),
        zName: shell.name.as_ptr(),
        pAppData: shell as *const VfsShell as *mut c_void,
        xOpen: Some(x_open),
        xDelete: Some(x_delete),
        xAccess: Some(x_access),
        xFullPathname: Some(x_full_pathname),
        xDlOpen: None,
        xDlError: None,
        xDlSym: None,
        xDlClose: None,
        xRandomness: Some(x_randomness),
        xSleep: Some(x_sleep),
        xCurrentTime: Some(x_current_time),
        xGetLastError: Some(x_get_last_error),
        xCurrentTimeInt64: Some(x_current_time_int64),
        xSetSystemCall: None,
        xGetSystemCall: None,
        xNextSystemCall: None,
    });

    let rc = unsafe { sqlite::sqlite3_vfs_register(Box::into_raw(descriptor), 0) };
    if rc == sqlite::SQLITE_OK {
        Ok(())
    } else {
        Err(VfsError::CantOpen)
    }
}

/// Run backend code behind a panic guard; a panic becomes `on_panic`.
fn guarded<F: FnOnce() -> c_int>(on_panic: c_int, f: F) -> c_int {
    std::panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or(on_panic)
}

static IO_METHODS: sqlite::sqlite3_io_methods = sqlite::sqlite3_io_methods {
    iVersion: 1,
    xClose: Some(x_close),
    xRead: Some(x_read),
    xWrite: Some(x_write),
    xTruncate: Some(x_truncate),
    xSync: Some(x_sync),
    xFileSize: Some(x_file_size),
    xLock: Some(x_lock),
    xUnlock: Some(x_unlock),
    xCheckReservedLock: Some(x_check_reserved_lock),
    xFileControl: Some(x_file_control),
    xSectorSize: Some(x_sector_size),
    xDeviceCharacteristics: Some(x_device_characteristics),
    xShmMap: None,
    xShmLock: None,
    xShmBarrier: None,
    xShmUnmap: None,
    xFetch: None,
    xUnfetch: None,
};

unsafe extern "C" fn x_open(
    p_vfs: *mut sqlite::sqlite3_vfs,
    z_name: *const c_char,
    p_file: *mut sqlite::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    let shell = &*((*p_vfs).pAppData as *const VfsShell);
    let shim = p_file as *mut FileShim;

    // Raw-initialize the uninitialized block the engine handed us.
    ptr::addr_of_mut!((*shim).base.pMethods).write(ptr::null());
    ptr::addr_of_mut!((*shim).shell).write(shell as *const VfsShell);
    ptr::addr_of_mut!((*shim).file).write(None);
    ptr::addr_of_mut!((*shim).delete_on_close).write(None);
    let shim = &mut *shim;

    // Anonymous temp files arrive with no name; give them one.
    let name = if z_name.is_null() {
        None
    } else {
        match CStr::from_ptr(z_name).to_str() {
            Ok(s) => Some(s.to_string()),
            Err(_) => return sqlite::SQLITE_CANTOPEN,
        }
    };

    let out_flags = p_out_flags.as_mut();

    guarded(sqlite::SQLITE_CANTOPEN, move || {
        let name = name.unwrap_or_else(|| format!("temp_{:016x}", rand::random::<u64>()));
        let opts = OpenOptions::from_raw(flags);

        match shell.inner.open(&name, &opts) {
            Ok(file) => {
                shim.file = Some(file);
                if opts.delete_on_close {
                    shim.delete_on_close = Some(name);
                }
                shim.base.pMethods = &IO_METHODS;
                if let Some(out) = out_flags {
                    *out = flags;
                }
                sqlite::SQLITE_OK
            }
            Err(e) => e.code(),
        }
    })
}

unsafe extern "C" fn x_delete(
    p_vfs: *mut sqlite::sqlite3_vfs,
    z_name: *const c_char,
    _sync_dir: c_int,
) -> c_int {
    let shell = &*((*p_vfs).pAppData as *const VfsShell);
    let Ok(name) = CStr::from_ptr(z_name).to_str() else {
        return sqlite::SQLITE_IOERR_DELETE;
    };

    guarded(sqlite::SQLITE_IOERR_DELETE, || match shell.inner.delete(name) {
        Ok(()) => sqlite::SQLITE_OK,
        Err(e) => e.code(),
    })
}

unsafe extern "C" fn x_access(
    p_vfs: *mut sqlite::sqlite3_vfs,
    z_name: *const c_char,
    _flags: c_int,
    p_res_out: *mut c_int,
) -> c_int {
    let shell = &*((*p_vfs).pAppData as *const VfsShell);
    let Ok(name) = CStr::from_ptr(z_name).to_str() else {
        return sqlite::SQLITE_IOERR_ACCESS;
    };
    let res_out = &mut *p_res_out;

    guarded(sqlite::SQLITE_IOERR_ACCESS, || match shell.inner.access(name) {
        Ok(exists) => {
            *res_out = exists as c_int;
            sqlite::SQLITE_OK
        }
        Err(e) => e.code(),
    })
}

unsafe extern "C" fn x_full_pathname(
    p_vfs: *mut sqlite::sqlite3_vfs,
    z_name: *const c_char,
    n_out: c_int,
    z_out: *mut c_char,
) -> c_int {
    let shell = &*((*p_vfs).pAppData as *const VfsShell);
    let Ok(name) = CStr::from_ptr(z_name).to_str() else {
        return sqlite::SQLITE_CANTOPEN;
    };

    let resolved = match std::panic::catch_unwind(AssertUnwindSafe(|| shell.inner.full_pathname(name)))
    {
        Ok(resolved) => resolved,
        Err(_) => return sqlite::SQLITE_CANTOPEN,
    };

    let bytes = resolved.as_bytes();
    if bytes.len() + 1 > n_out as usize {
        return sqlite::SQLITE_CANTOPEN;
    }
    ptr::copy_nonoverlapping(bytes.as_ptr(), z_out as *mut u8, bytes.len());
    *z_out.add(bytes.len()) = 0;
    sqlite::SQLITE_OK
}

unsafe extern "C" fn x_randomness(
    _p_vfs: *mut sqlite::sqlite3_vfs,
    n_byte: c_int,
    z_out: *mut c_char,
) -> c_int {
    let out = std::slice::from_raw_parts_mut(z_out as *mut u8, n_byte.max(0) as usize);
    guarded(0, || {
        rand::thread_rng().fill_bytes(out);
        n_byte
    })
}

unsafe extern "C" fn x_sleep(_p_vfs: *mut sqlite::sqlite3_vfs, microseconds: c_int) -> c_int {
    std::thread::sleep(std::time::Duration::from_micros(microseconds.max(0) as u64));
    microseconds
}

unsafe extern "C" fn x_current_time(p_vfs: *mut sqlite::sqlite3_vfs, p_out: *mut f64) -> c_int {
    let mut millis: i64 = 0;
    let rc = x_current_time_int64(p_vfs, &mut millis);
    *p_out = millis as f64 / 86_400_000.0;
    rc
}

unsafe extern "C" fn x_current_time_int64(
    _p_vfs: *mut sqlite::sqlite3_vfs,
    p_out: *mut i64,
) -> c_int {
    let unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    *p_out = JULIAN_UNIX_EPOCH_MS + unix_ms;
    sqlite::SQLITE_OK
}

unsafe extern "C" fn x_get_last_error(
    _p_vfs: *mut sqlite::sqlite3_vfs,
    _n_byte: c_int,
    _z_out: *mut c_char,
) -> c_int {
    0
}

unsafe extern "C" fn x_close(p_file: *mut sqlite::sqlite3_file) -> c_int {
    let shim = &mut *(p_file as *mut FileShim);
    let shell = &*shim.shell;

    guarded(sqlite::SQLITE_IOERR_CLOSE, || {
        let mut rc = sqlite::SQLITE_OK;

        if let Some(mut file) = shim.file.take() {
            if let Err(e) = file.close() {
                rc = e.code();
            }
        }

        if let Some(name) = shim.delete_on_close.take() {
            let _ = shell.inner.delete(&name);
        }

        rc
    })
}

unsafe extern "C" fn x_read(
    p_file: *mut sqlite::sqlite3_file,
    buf: *mut c_void,
    amt: c_int,
    offset: i64,
) -> c_int {
    let shim = &mut *(p_file as *mut FileShim);
    let out = std::slice::from_raw_parts_mut(buf as *mut u8, amt.max(0) as usize);

    guarded(sqlite::SQLITE_IOERR_READ, || {
        let Some(file) = shim.file.as_mut() else {
            return sqlite::SQLITE_IOERR_READ;
        };
        match file.read_at(out, offset.max(0) as u64) {
            Ok(n) if n == out.len() => sqlite::SQLITE_OK,
            Ok(n) => {
                // The engine requires the unread tail zero-filled.
                out[n..].fill(0);
                sqlite::SQLITE_IOERR_SHORT_READ
            }
            Err(e) => e.code(),
        }
    })
}

unsafe extern "C" fn x_write(
    p_file: *mut sqlite::sqlite3_file,
    buf: *const c_void,
    amt: c_int,
    offset: i64,
) -> c_int {
    let shim = &mut *(p_file as *mut FileShim);
    let data = std::slice::from_raw_parts(buf as *const u8, amt.max(0) as usize);

    guarded(sqlite::SQLITE_IOERR_WRITE, || {
        let Some(file) = shim.file.as_mut() else {
            return sqlite::SQLITE_IOERR_WRITE;
        };
        match file.write_at(data, offset.max(0) as u64) {
            Ok(()) => sqlite::SQLITE_OK,
            Err(e) => e.code(),
        }
    })
}

unsafe extern "C" fn x_truncate(p_file: *mut sqlite::sqlite3_file, size: i64) -> c_int {
    let shim = &mut *(p_file as *mut FileShim);

    guarded(sqlite::SQLITE_IOERR_TRUNCATE, || {
        let Some(file) = shim.file.as_mut() else {
            return sqlite::SQLITE_IOERR_TRUNCATE;
        };
        match file.truncate(size.max(0) as u64) {
            Ok(()) => sqlite::SQLITE_OK,
            Err(e) => e.code(),
        }
    })
}

unsafe extern "C" fn x_sync(p_file: *mut sqlite::sqlite3_file, _flags: c_int) -> c_int {
    let shim = &mut *(p_file as *mut FileShim);

    guarded(sqlite::SQLITE_IOERR_FSYNC, || {
        let Some(file) = shim.file.as_mut() else {
            return sqlite::SQLITE_IOERR_FSYNC;
        };
        match file.sync() {
            Ok(()) => sqlite::SQLITE_OK,
            Err(e) => e.code(),
        }
    })
}

unsafe extern "C" fn x_file_size(p_file: *mut sqlite::sqlite3_file, p_size: *mut i64) -> c_int {
    let shim = &mut *(p_file as *mut FileShim);
    let size_out = &mut *p_size;

    guarded(sqlite::SQLITE_IOERR_FSTAT, || {
        let Some(file) = shim.file.as_ref() else {
            return sqlite::SQLITE_IOERR_FSTAT;
        };
        match file.size() {
            Ok(size) => {
                *size_out = size as i64;
                sqlite::SQLITE_OK
            }
            Err(e) => e.code(),
        }
    })
}

unsafe extern "C" fn x_lock(p_file: *mut sqlite::sqlite3_file, level: c_int) -> c_int {
    let shim = &mut *(p_file as *mut FileShim);

    guarded(sqlite::SQLITE_IOERR_LOCK, || {
        let Some(file) = shim.file.as_mut() else {
            return sqlite::SQLITE_IOERR_LOCK;
        };
        match file.lock(LockLevel::from_raw(level)) {
            Ok(()) => sqlite::SQLITE_OK,
            Err(e) => e.code(),
        }
    })
}

unsafe extern "C" fn x_unlock(p_file: *mut sqlite::sqlite3_file, level: c_int) -> c_int {
    let shim = &mut *(p_file as *mut FileShim);

    guarded(sqlite::SQLITE_IOERR_LOCK, || {
        let Some(file) = shim.file.as_mut() else {
            return sqlite::SQLITE_IOERR_LOCK;
        };
        match file.unlock(LockLevel::from_raw(level)) {
            Ok(()) => sqlite::SQLITE_OK,
            Err(e) => e.code(),
        }
    })
}

unsafe extern "C" fn x_check_reserved_lock(
    p_file: *mut sqlite::sqlite3_file,
    p_res_out: *mut c_int,
) -> c_int {
    let shim = &mut *(p_file as *mut FileShim);
    let res_out = &mut *p_res_out;

    guarded(sqlite::SQLITE_IOERR_LOCK, || {
        let Some(file) = shim.file.as_ref() else {
            return sqlite::SQLITE_IOERR_LOCK;
        };
        match file.check_reserved_lock() {
            Ok(reserved) => {
                *res_out = reserved as c_int;
                sqlite::SQLITE_OK
            }
            Err(e) => e.code(),
        }
    })
}

unsafe extern "C" fn x_file_control(
    _p_file: *mut sqlite::sqlite3_file,
    _op: c_int,
    _p_arg: *mut c_void,
) -> c_int {
    sqlite::SQLITE_NOTFOUND
}

unsafe extern "C" fn x_sector_size(p_file: *mut sqlite::sqlite3_file) -> c_int {
    let shim = &mut *(p_file as *mut FileShim);
    match shim.file.as_ref() {
        Some(file) => file.sector_size(),
        None => 4096,
    }
}

unsafe extern "C" fn x_device_characteristics(p_file: *mut sqlite::sqlite3_file) -> c_int {
    let shim = &mut *(p_file as *mut FileShim);
    match shim.file.as_ref() {
        Some(file) => file.device_characteristics(),
        None => 0,
    }
}
