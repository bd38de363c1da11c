//! Resource locks and the global executor-slot semaphore.
//!
//! The manager never blocks and never retries: a request either succeeds
//! immediately or fails with a typed [`LockError`]. Every check-then-set runs
//! inside one critical section of a single mutex. Callers should prefer the
//! scoped forms, whose guards release on every exit path.
//!
//! A lock covers its path and everything beneath it, so a lock on a directory
//! contends with locks on the files inside it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Default number of concurrently active executor invocations.
pub const DEFAULT_MAX_SLOTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockType {
    Read,
    Write,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockType::Read => "READ",
            LockType::Write => "WRITE",
        })
    }
}

/// A granted lock. Owned by the manager's table; released only by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lock {
    pub lock_id: String,
    pub resource_path: PathBuf,
    pub lock_type: LockType,
    pub holder: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("{requested} lock on {} conflicts with {held} lock held by {holder}", .resource.display())]
    Conflict {
        resource: PathBuf,
        requested: LockType,
        held: LockType,
        holder: String,
    },

    #[error("executor limit exceeded: all {max} slots in use")]
    ExecutorLimitExceeded { max: usize },

    #[error("unknown lock id {0}")]
    UnknownLock(String),

    #[error("holder {0} holds no executor slot")]
    UnknownHolder(String),
}

#[derive(Debug, Default)]
struct LockTable {
    locks: BTreeMap<String, Lock>,
    slots: HashMap<String, usize>,
    active_slots: usize,
    next_id: u64,
}

/// Lock table plus bounded slot counter.
#[derive(Debug)]
pub struct LockManager {
    state: Mutex<LockTable>,
    max_slots: usize,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SLOTS)
    }
}

impl LockManager {
    pub fn new(max_slots: usize) -> Self {
        Self {
            state: Mutex::new(LockTable::default()),
            max_slots,
        }
    }

    // A panic while holding the table cannot leave it half-updated: every
    // mutation is a single insert/remove.
    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grant a lock on `resource_path` or fail with `Conflict`.
    ///
    /// WRITE conflicts with any existing lock on an overlapping path (the
    /// same path, an ancestor or a descendant); READ only with such a WRITE.
    pub fn acquire_lock(
        &self,
        resource_path: &Path,
        holder: &str,
        lock_type: LockType,
    ) -> Result<Lock, LockError> {
        let mut table = self.table();
        let conflict = table.locks.values().find(|existing| {
            overlaps(&existing.resource_path, resource_path)
                && (lock_type == LockType::Write || existing.lock_type == LockType::Write)
        });
        if let Some(existing) = conflict {
            debug!(
                resource = %resource_path.display(),
                requested = %lock_type,
                held_by = %existing.holder,
                "lock conflict"
            );
            return Err(LockError::Conflict {
                resource: resource_path.to_path_buf(),
                requested: lock_type,
                held: existing.lock_type,
                holder: existing.holder.clone(),
            });
        }

        table.next_id += 1;
        let lock = Lock {
            lock_id: format!("lock-{}", table.next_id),
            resource_path: resource_path.to_path_buf(),
            lock_type,
            holder: holder.to_string(),
        };
        table.locks.insert(lock.lock_id.clone(), lock.clone());
        debug!(lock_id = %lock.lock_id, resource = %resource_path.display(), %lock_type, holder, "lock acquired");
        Ok(lock)
    }

    pub fn release_lock(&self, lock_id: &str) -> Result<(), LockError> {
        match self.table().locks.remove(lock_id) {
            Some(lock) => {
                debug!(lock_id, resource = %lock.resource_path.display(), "lock released");
                Ok(())
            }
            None => Err(LockError::UnknownLock(lock_id.to_string())),
        }
    }

    /// Take one executor slot for `holder` or fail with `ExecutorLimitExceeded`.
    pub fn acquire_global_semaphore(&self, holder: &str) -> Result<(), LockError> {
        let mut table = self.table();
        if table.active_slots >= self.max_slots {
            return Err(LockError::ExecutorLimitExceeded {
                max: self.max_slots,
            });
        }
        table.active_slots += 1;
        *table.slots.entry(holder.to_string()).or_insert(0) += 1;
        debug!(holder, active = table.active_slots, max = self.max_slots, "slot acquired");
        Ok(())
    }

    pub fn release_global_semaphore(&self, holder: &str) -> Result<(), LockError> {
        let mut table = self.table();
        let Some(count) = table.slots.get_mut(holder) else {
            return Err(LockError::UnknownHolder(holder.to_string()));
        };
        *count -= 1;
        if *count == 0 {
            table.slots.remove(holder);
        }
        table.active_slots -= 1;
        debug!(holder, active = table.active_slots, "slot released");
        Ok(())
    }

    /// [`acquire_lock`](Self::acquire_lock) returning a guard that releases on drop.
    ///
    /// Guards own a handle to the manager, so they can move to whichever
    /// thread outlives the work they protect.
    pub fn lock_scoped(
        self: &Arc<Self>,
        resource_path: &Path,
        holder: &str,
        lock_type: LockType,
    ) -> Result<LockGuard, LockError> {
        let lock = self.acquire_lock(resource_path, holder, lock_type)?;
        Ok(LockGuard {
            manager: Arc::clone(self),
            lock,
        })
    }

    /// [`acquire_global_semaphore`](Self::acquire_global_semaphore) returning a
    /// guard that releases on drop.
    pub fn slot_scoped(self: &Arc<Self>, holder: &str) -> Result<SlotGuard, LockError> {
        self.acquire_global_semaphore(holder)?;
        Ok(SlotGuard {
            manager: Arc::clone(self),
            holder: holder.to_string(),
        })
    }

    pub fn active_locks(&self) -> Vec<Lock> {
        self.table().locks.values().cloned().collect()
    }

    pub fn active_slots(&self) -> usize {
        self.table().active_slots
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Releases its lock when dropped.
#[derive(Debug)]
pub struct LockGuard {
    manager: Arc<LockManager>,
    lock: Lock,
}

impl LockGuard {
    pub fn lock(&self) -> &Lock {
        &self.lock
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.manager.release_lock(&self.lock.lock_id) {
            warn!(err = %err, "failed to release scoped lock");
        }
    }
}

/// Releases its executor slot when dropped.
#[derive(Debug)]
pub struct SlotGuard {
    manager: Arc<LockManager>,
    holder: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Err(err) = self.manager.release_global_semaphore(&self.holder) {
            warn!(err = %err, "failed to release scoped slot");
        }
    }
}
