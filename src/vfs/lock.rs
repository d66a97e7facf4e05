//! Emulation of the engine's five-level advisory lock hierarchy
//! (NONE → SHARED → RESERVED → PENDING → EXCLUSIVE).
//!
//! A [`LockState`] is the truth shared by every handle on the same file; a
//! [`FileLock`] is one handle's view, tracking which contributions it made
//! so unlock never releases another handle's claim. Exclusive acquisition
//! spin-waits briefly for readers to drain, then reports busy and lets the
//! engine retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{IoKind, VfsError};

/// How long an exclusive acquisition waits for readers before giving up.
const SPIN_WAIT: Duration = Duration::from_micros(25);

/// Lock levels in the engine's escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    None = 0,
    Shared = 1,
    Reserved = 2,
    Pending = 3,
    Exclusive = 4,
}

impl LockLevel {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => LockLevel::Shared,
            2 => LockLevel::Reserved,
            3 => LockLevel::Pending,
            4 => LockLevel::Exclusive,
            _ => LockLevel::None,
        }
    }
}

/// Lock state shared by all handles on one file.
#[derive(Debug, Default)]
pub struct LockState {
    shared: i32,
    pending: bool,
    reserved: bool,
}

impl LockState {
    /// True once no handle holds any claim; the owner may drop the entry.
    pub fn is_unused(&self) -> bool {
        self.shared == 0 && !self.pending && !self.reserved
    }
}

/// One handle's lock position on a file.
pub struct FileLock {
    state: Arc<Mutex<LockState>>,
    level: LockLevel,
    holds_shared: bool,
    owns_reserved: bool,
    owns_pending: bool,
}

impl FileLock {
    pub fn new(state: Arc<Mutex<LockState>>) -> Self {
        Self {
            state,
            level: LockLevel::None,
            holds_shared: false,
            owns_reserved: false,
            owns_pending: false,
        }
    }

    /// Fresh state not shared with any other handle.
    pub fn standalone() -> Self {
        Self::new(Arc::new(Mutex::new(LockState::default())))
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    pub fn shared_state(&self) -> &Arc<Mutex<LockState>> {
        &self.state
    }

    pub fn acquire(&mut self, level: LockLevel, read_only: bool) -> Result<(), VfsError> {
        if self.level >= level {
            return Ok(());
        }

        if read_only && level >= LockLevel::Reserved {
            return Err(VfsError::Io(IoKind::Lock));
        }

        let mut state = self.state.lock();

        match level {
            LockLevel::Shared => {
                if state.pending {
                    return Err(VfsError::Busy);
                }
                state.shared += 1;
                self.holds_shared = true;
            }

            LockLevel::Reserved => {
                if state.reserved && !self.owns_reserved {
                    return Err(VfsError::Busy);
                }
                state.reserved = true;
                self.owns_reserved = true;
            }

            LockLevel::Exclusive => {
                // Stage through PENDING so no new readers can join while we
                // wait for existing ones to drain.
                if self.level < LockLevel::Pending {
                    state.pending = true;
                    self.owns_pending = true;
                    self.level = LockLevel::Pending;
                }

                let start = Instant::now();
                loop {
                    let others = state.shared - i32::from(self.holds_shared);
                    if others <= 0 {
                        break;
                    }
                    if start.elapsed() > SPIN_WAIT {
                        return Err(VfsError::Busy);
                    }
                    drop(state);
                    std::thread::yield_now();
                    state = self.state.lock();
                }
            }

            LockLevel::Pending | LockLevel::None => {}
        }

        self.level = level;
        Ok(())
    }

    pub fn release(&mut self, level: LockLevel) -> Result<(), VfsError> {
        if self.level <= level {
            return Ok(());
        }

        let mut state = self.state.lock();

        if self.level >= LockLevel::Reserved && self.owns_reserved {
            state.reserved = false;
            self.owns_reserved = false;
        }
        if self.level >= LockLevel::Pending && self.owns_pending {
            state.pending = false;
            self.owns_pending = false;
        }
        if level < LockLevel::Shared && self.holds_shared {
            state.shared -= 1;
            self.holds_shared = false;
        }

        self.level = level;
        Ok(())
    }

    pub fn is_reserved(&self) -> bool {
        if self.level >= LockLevel::Reserved {
            return true;
        }
        self.state.lock().reserved
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.release(LockLevel::None);
    }
}
