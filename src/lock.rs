//! # Lock Manager
//!
//! A cooperative readers-writer lock over the whole database. The state is a
//! single signed count: `0` unlocked, `N > 0` that many readers, `-1` an
//! exclusive writer. Writers record their thread so protocol misuse
//! (releasing from the wrong thread, re-entrant acquisition) is caught as an
//! `IllegalState` error instead of corrupting the count.
//!
//! ## Fairness
//!
//! Readers have priority: a waiting-readers count is maintained and a writer
//! only becomes eligible once every current *and* waiting reader has
//! drained. The engine's workload is read-dominated with rare, long writes;
//! making readers wait behind a writer that is itself waiting would stall
//! every query for the duration of the writer's queue time.
//!
//! ## Cancellation
//!
//! Only write acquisition is cancellable: the caller may pass a probe that
//! is polled at a fixed interval while waiting, failing the acquisition with
//! `OperationCancelled` once it fires. Read acquisition never blocks long
//! enough to warrant it (writers are rare) and stays non-cancellable.
//!
//! ## Downgrade
//!
//! `downgrade_write(n)` converts the exclusive lock into `n` read locks in
//! one step, waking waiters. The database layer builds the write→read
//! handoff (and the flush-under-temporary-read-lock dance) on top of this
//! primitive; see `Database::release_write_lock`.
//!
//! This module is deliberately storage-agnostic: it manages the count, the
//! condition variable and the owner bookkeeping, nothing else.

use std::thread::{self, ThreadId};
use std::time::Duration;

use eyre::Result;
use parking_lot::{Condvar, Mutex};

use crate::config::CANCELLATION_CHECK_INTERVAL_MS;
use crate::error::StoreError;

/// Polled while waiting for the write lock; `true` aborts the wait.
pub type CancelProbe<'a> = &'a (dyn Fn() -> bool + Sync);

#[derive(Debug)]
struct LockState {
    /// 0 = unlocked, N > 0 = N readers, -1 = writer.
    lock_count: i64,
    /// Readers currently blocked on a writer. A waiting writer yields to
    /// these.
    waiting_readers: u32,
    write_owner: Option<ThreadId>,
}

pub struct LockManager {
    state: Mutex<LockState>,
    cond: Condvar,
    #[cfg(feature = "lock-debug")]
    debug: Mutex<hashbrown::HashMap<ThreadId, i64>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                lock_count: 0,
                waiting_readers: 0,
                write_owner: None,
            }),
            cond: Condvar::new(),
            #[cfg(feature = "lock-debug")]
            debug: Mutex::new(hashbrown::HashMap::new()),
        }
    }

    /// Block until no writer holds the lock, then take a read lock.
    pub fn acquire_read(&self) {
        let mut state = self.state.lock();
        if state.lock_count < 0 {
            state.waiting_readers += 1;
            while state.lock_count < 0 {
                self.cond.wait(&mut state);
            }
            state.waiting_readers -= 1;
        }
        state.lock_count += 1;
        drop(state);
        self.track(1);
    }

    /// Release one read lock, waking a waiting writer when the count drains.
    pub fn release_read(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.lock_count <= 0 {
            return Err(StoreError::IllegalState(
                "release of a read lock that is not held".into(),
            )
            .into());
        }
        state.lock_count -= 1;
        // Only writers ever wait while read locks exist, and one may become
        // eligible at any nonzero count when it surrendered read locks.
        self.cond.notify_all();
        drop(state);
        self.track(-1);
        Ok(())
    }

    /// Block until the lock can be made exclusive. The caller may already
    /// hold `giveup_read_locks` read locks, which are absorbed into the
    /// write lock on success and untouched on failure.
    ///
    /// `cancel` is polled every [`CANCELLATION_CHECK_INTERVAL_MS`]; a fired
    /// probe fails with `OperationCancelled`.
    pub fn acquire_write(&self, giveup_read_locks: u32, cancel: Option<CancelProbe>) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.write_owner == Some(me) {
            return Err(StoreError::IllegalState(
                "re-entrant write-lock acquisition".into(),
            )
            .into());
        }

        while state.lock_count < 0
            || state.lock_count > giveup_read_locks as i64
            || state.waiting_readers > 0
        {
            let timeout = Duration::from_millis(CANCELLATION_CHECK_INTERVAL_MS);
            self.cond.wait_for(&mut state, timeout);
            if let Some(probe) = cancel {
                if probe() {
                    return Err(StoreError::OperationCancelled.into());
                }
            }
        }

        state.lock_count = -1;
        state.write_owner = Some(me);
        drop(state);
        self.track(1 - giveup_read_locks as i64);
        Ok(())
    }

    /// Convert the exclusive lock into `establish_read_locks` read locks and
    /// wake waiters. Must be called by the owning thread.
    pub fn downgrade_write(&self, establish_read_locks: u32) -> Result<()> {
        let mut state = self.state.lock();
        self.check_owner(&state)?;
        state.lock_count = establish_read_locks as i64;
        state.write_owner = None;
        self.cond.notify_all();
        drop(state);
        self.track(establish_read_locks as i64 - 1);
        Ok(())
    }

    /// Error unless the current thread owns the write lock.
    pub fn check_write_owner(&self) -> Result<()> {
        let state = self.state.lock();
        self.check_owner(&state)
    }

    fn check_owner(&self, state: &LockState) -> Result<()> {
        if state.lock_count != -1 {
            return Err(
                StoreError::IllegalState("write lock is not held".into()).into(),
            );
        }
        if state.write_owner != Some(thread::current().id()) {
            return Err(StoreError::IllegalState(
                "write lock released by a thread that does not own it".into(),
            )
            .into());
        }
        Ok(())
    }

    /// Current lock count; negative means write-locked. Diagnostic only.
    pub fn lock_count(&self) -> i64 {
        self.state.lock().lock_count
    }

    #[cfg(feature = "lock-debug")]
    fn track(&self, delta: i64) {
        let mut debug = self.debug.lock();
        let entry = debug.entry(thread::current().id()).or_insert(0);
        *entry += delta;
        if *entry < 0 {
            tracing::warn!(
                thread = ?thread::current().id(),
                balance = *entry,
                "thread released more locks than it acquired"
            );
        }
    }

    #[cfg(not(feature = "lock-debug"))]
    #[inline]
    fn track(&self, _delta: i64) {}

    /// Outstanding lock balance of the calling thread. Diagnostic only.
    #[cfg(feature = "lock-debug")]
    pub fn thread_lock_balance(&self) -> i64 {
        self.debug
            .lock()
            .get(&thread::current().id())
            .copied()
            .unwrap_or(0)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
