//! # Database
//!
//! The top-level object wiring the storage layer, the type registry, the
//! lock manager and the deletion manager together. A `Database` is opened
//! against one backing file, shares a process-wide [`ChunkCache`] with other
//! open databases, and is driven entirely through record addresses, typed
//! accessors and scoped locks.
//!
//! ## Opening and self-healing
//!
//! `open` validates the header magic and the stored schema version against
//! the supported range. Anything structurally wrong - truncated file, bad
//! magic, unsupported version - is *not* an error: the index is a cache of
//! derived data, so the file is discarded and recreated empty at the current
//! version, with a warning in the log. Callers see a freshly cleared
//! database and reindex into it.
//!
//! ## Locking surface
//!
//! ```ignore
//! let read = db.acquire_read_lock();            // scoped, Drop releases
//! drop(read);
//!
//! let write = db.acquire_write_lock(None)?;     // exclusive
//! let addr = db.new_record(SYMBOL_TAG)?;
//! let reads = write.release(1, false)?;         // downgrade to 1 read lock
//! ```
//!
//! Releasing the write lock is where the engine's bookkeeping happens, in
//! this order: the memoization cache is invalidated (full release only), the
//! persisted write generation is bumped, the pending deletions are drained,
//! and the dirty-chunk ratio is checked against the shared cache capacity -
//! crossing it forces a flush, performed under a temporary extra read lock
//! so new readers proceed while the msync runs.

use std::any::{Any, TypeId};
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::delete::DeletionManager;
use crate::error::StoreError;
use crate::lock::{CancelProbe, LockManager};
use crate::node::handle::{NodeHandle, NodeType, TypedNode};
use crate::node::layout::TYPE_TAG_SIZE;
use crate::node::registry::TypeRegistry;
use crate::storage::{Address, ChunkCache, ChunkStats, ChunkStore, PoolStats};

type CacheKey = (TypeId, u64);
type AnyArc = Arc<dyn Any + Send + Sync>;

pub struct Database {
    store: ChunkStore,
    registry: TypeRegistry,
    lock: LockManager,
    deletions: DeletionManager,
    result_cache: Mutex<HashMap<CacheKey, AnyArc>>,
    cookies: Mutex<HashMap<u16, AnyArc>>,
    current_version: i32,
}

impl Database {
    /// Open the database at `path`, creating it when missing and silently
    /// rebuilding it when the file is corrupt or its version falls outside
    /// `supported_versions`. New and rebuilt files are stamped with
    /// `current_version`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        cache: Arc<ChunkCache>,
        registry: TypeRegistry,
        supported_versions: RangeInclusive<i32>,
        current_version: i32,
    ) -> Result<Self> {
        let path = path.as_ref();

        let store = if path.exists() {
            match ChunkStore::open(path, Arc::clone(&cache)) {
                Ok(store) => {
                    let version = store.version()?;
                    if supported_versions.contains(&version) {
                        store
                    } else {
                        warn!(
                            version,
                            ?supported_versions,
                            "index version unsupported, rebuilding"
                        );
                        Self::rebuild(path, &cache, current_version)?
                    }
                }
                Err(err) if StoreError::is_corruption(&err) => {
                    warn!(error = %err, "index corrupt, rebuilding");
                    Self::rebuild(path, &cache, current_version)?
                }
                Err(err) => return Err(err),
            }
        } else {
            ChunkStore::create(path, Arc::clone(&cache), current_version)?
        };

        Ok(Self {
            store,
            registry,
            lock: LockManager::new(),
            deletions: DeletionManager::new(),
            result_cache: Mutex::new(HashMap::new()),
            cookies: Mutex::new(HashMap::new()),
            current_version,
        })
    }

    fn rebuild(path: &Path, cache: &Arc<ChunkCache>, version: i32) -> Result<ChunkStore> {
        ChunkStore::create(path, Arc::clone(cache), version)
    }

    pub(crate) fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// Identity of this database for handle equality.
    pub fn id(&self) -> u32 {
        self.store.file_id()
    }

    pub fn version(&self) -> Result<i32> {
        self.store.version()
    }

    /// Monotonically increasing counter bumped on every write-lock release.
    /// Readable without a lock for cheap "did anything change" probes.
    pub fn write_generation(&self) -> Result<u64> {
        self.store.write_generation()
    }

    pub fn memory_stats(&self) -> Vec<(u16, PoolStats)> {
        self.store.memory_stats()
    }

    pub fn chunk_stats(&self) -> ChunkStats {
        self.store.chunk_stats()
    }

    /// Empty the database and reset it to `current_version`. Requires the
    /// write lock.
    pub fn clear(&self) -> Result<()> {
        self.lock.check_write_owner()?;
        self.deletions.clear();
        self.result_cache.lock().clear();
        self.cookies.lock().clear();
        self.store.clear(self.current_version)
    }

    // ------------------------------------------------------------------
    // locking
    // ------------------------------------------------------------------

    /// Block until no writer holds the lock, then return a scoped read
    /// lock.
    pub fn acquire_read_lock(&self) -> ReadLock<'_> {
        self.lock.acquire_read();
        ReadLock { db: self }
    }

    /// Acquire the exclusive write lock, optionally polling `cancel`.
    pub fn acquire_write_lock(&self, cancel: Option<CancelProbe>) -> Result<WriteLock<'_>> {
        self.acquire_write_lock_giving_up(Vec::new(), cancel)
            .map_err(|failure| failure.error)
    }

    /// Acquire the write lock while surrendering read locks this thread
    /// already holds. On success the surrendered locks are absorbed into
    /// the write lock; on failure (e.g. cancellation) they are handed back
    /// untouched.
    pub fn acquire_write_lock_giving_up<'db>(
        &'db self,
        surrendered: Vec<ReadLock<'db>>,
        cancel: Option<CancelProbe>,
    ) -> std::result::Result<WriteLock<'db>, WriteLockFailure<'db>> {
        if surrendered.iter().any(|g| !std::ptr::eq(g.db, self)) {
            return Err(WriteLockFailure {
                surrendered,
                error: StoreError::IllegalArgument(
                    "surrendered read locks belong to a different database".into(),
                )
                .into(),
            });
        }
        match self.lock.acquire_write(surrendered.len() as u32, cancel) {
            Ok(()) => {
                // The read-lock counts are now part of the exclusive lock;
                // the guards must not decrement on drop.
                for guard in surrendered {
                    std::mem::forget(guard);
                }
                self.store.set_exclusive(true);
                Ok(WriteLock {
                    db: self,
                    released: false,
                })
            }
            Err(error) => Err(WriteLockFailure { surrendered, error }),
        }
    }

    /// The write-lock release sequence. Called from [`WriteLock::release`]
    /// and from the guard's drop.
    fn release_write_lock(&self, establish_read_locks: u32, flush: bool) -> Result<()> {
        self.lock.check_write_owner()?;

        if establish_read_locks == 0 {
            // Cached results may be tied to this write generation; a full
            // release is the visibility boundary.
            self.result_cache.lock().clear();
        }

        self.store.bump_write_generation()?;
        let deleted = self.process_deletions_locked()?;
        if deleted > 0 {
            debug!(deleted, "processed deferred deletions");
        }

        let dirty = self.store.dirty_chunk_count();
        let must_flush = flush || dirty > self.store.cache().flush_threshold();

        self.store.set_exclusive(false);
        self.lock
            .downgrade_write(establish_read_locks + u32::from(must_flush))?;

        if must_flush {
            let result = self.store.flush();
            self.lock.release_read()?;
            result?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // records
    // ------------------------------------------------------------------

    /// Allocate a record of the registered type `tag` and stamp its type
    /// tag. Requires the write lock.
    pub fn new_record(&self, tag: u16) -> Result<Address> {
        if !self.registry.contains(tag) {
            return Err(StoreError::IllegalArgument(format!(
                "cannot create record of unregistered type {tag:#06x}"
            ))
            .into());
        }
        let factory = self.registry.factory(tag)?;
        let size = factory.record_size().max(TYPE_TAG_SIZE);
        let address = self.store.malloc(size, TypeRegistry::pool_for(tag))?;
        self.store.put_short(address, tag as i16)?;
        Ok(address)
    }

    /// Load the record at `address`; `None` for the null address. An
    /// unregistered stored tag is reported as corruption.
    pub fn get_node(&self, address: Address) -> Result<Option<NodeHandle>> {
        if address == 0 {
            return Ok(None);
        }
        let tag = self.store.get_short(address)? as u16;
        self.registry.factory(tag)?;
        Ok(Some(NodeHandle::new(self.id(), address, tag)))
    }

    /// Typed load: additionally fails with `TypeMismatch` when the stored
    /// tag is not accepted by `T`.
    pub fn get_node_as<T: NodeType>(&self, address: Address) -> Result<Option<TypedNode<T>>> {
        let Some(handle) = self.get_node(address)? else {
            return Ok(None);
        };
        if !T::accepts_tag(handle.tag()) {
            return Err(StoreError::TypeMismatch {
                expected: T::type_name(),
                found_tag: handle.tag(),
                address,
            }
            .into());
        }
        Ok(Some(TypedNode::new(handle)))
    }

    /// Read a root pointer slot from the header data area.
    pub fn root_ptr(&self, slot: u32) -> Result<Address> {
        self.store.root_ptr(slot)
    }

    /// Store a root pointer slot. Requires the write lock.
    pub fn put_root_ptr(&self, slot: u32, value: Address) -> Result<()> {
        self.store.put_root_ptr(slot, value)
    }

    // ------------------------------------------------------------------
    // deletion
    // ------------------------------------------------------------------

    /// Queue `address` for deferred destruction. Requires the write lock;
    /// scheduling the same record twice is tolerated.
    pub fn schedule_deletion(&self, address: Address) -> Result<()> {
        self.lock.check_write_owner()?;
        if address == 0 {
            return Err(
                StoreError::IllegalArgument("cannot schedule deletion of null".into()).into(),
            );
        }
        self.deletions.schedule(address);
        Ok(())
    }

    pub fn pending_deletions(&self) -> usize {
        self.deletions.len()
    }

    /// Drain the pending set now instead of waiting for the write-lock
    /// release. Requires the write lock. Returns the number of records
    /// destroyed.
    pub fn process_deletions(&self) -> Result<usize> {
        self.lock.check_write_owner()?;
        self.process_deletions_locked()
    }

    fn process_deletions_locked(&self) -> Result<usize> {
        let batch = self.deletions.drain();
        let mut destroyed = 0usize;
        for address in batch {
            let tag = self.store.get_short(address)? as u16;
            let factory = Arc::clone(self.registry.factory(tag)?);
            if factory.is_ready_for_deletion(self, address)? {
                factory.destruct(self, address)?;
                self.store.free(address, TypeRegistry::pool_for(tag))?;
                destroyed += 1;
            } else {
                // Dropped, not re-scheduled: callers re-submit if they still
                // care.
                debug!(address, tag, "pending deletion dropped: record not ready");
            }
        }
        Ok(destroyed)
    }

    /// Destroy the record at `address` immediately, regardless of readiness,
    /// unscheduling it if it was pending. Requires the write lock.
    pub fn delete(&self, address: Address) -> Result<()> {
        self.lock.check_write_owner()?;
        if address == 0 {
            return Err(StoreError::IllegalArgument("cannot delete null".into()).into());
        }
        self.deletions.unschedule(address);
        let tag = self.store.get_short(address)? as u16;
        let factory = Arc::clone(self.registry.factory(tag)?);
        factory.destruct(self, address)?;
        self.store.free(address, TypeRegistry::pool_for(tag))
    }

    // ------------------------------------------------------------------
    // memoization cache & cookies
    // ------------------------------------------------------------------

    /// Look up a memoized result. The cache is invalidated whenever the
    /// write lock is fully released, so entries never outlive the write
    /// generation they were computed under.
    pub fn cached_result<T: Any + Send + Sync>(&self, key: u64) -> Option<Arc<T>> {
        let cache = self.result_cache.lock();
        let value = cache.get(&(TypeId::of::<T>(), key))?;
        Arc::clone(value).downcast::<T>().ok()
    }

    /// Memoize a result under `key`.
    pub fn store_cached_result<T: Any + Send + Sync>(&self, key: u64, value: Arc<T>) {
        self.result_cache
            .lock()
            .insert((TypeId::of::<T>(), key), value);
    }

    /// Opaque per-type state attached by collaborators (field layouts,
    /// caches). Survives lock cycles; cleared only by [`Database::clear`].
    pub fn type_cookie(&self, tag: u16) -> Option<AnyArc> {
        self.cookies.lock().get(&tag).cloned()
    }

    pub fn set_type_cookie(&self, tag: u16, cookie: AnyArc) {
        self.cookies.lock().insert(tag, cookie);
    }
}

/// Scoped read lock; dropping it releases the lock.
pub struct ReadLock<'db> {
    db: &'db Database,
}

impl Drop for ReadLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.db.lock.release_read() {
            error!(error = %err, "read lock release failed");
        }
    }
}

/// Scoped write lock. Prefer [`WriteLock::release`], which runs the full
/// release sequence with explicit parameters; dropping the guard performs a
/// plain `release(0, false)` and logs any failure.
pub struct WriteLock<'db> {
    db: &'db Database,
    released: bool,
}

impl<'db> WriteLock<'db> {
    /// Release the write lock, converting it into `establish_read_locks`
    /// read locks (returned as guards). `flush` forces a flush even below
    /// the dirty threshold.
    pub fn release(mut self, establish_read_locks: u32, flush: bool) -> Result<Vec<ReadLock<'db>>> {
        self.released = true;
        let db = self.db;
        db.release_write_lock(establish_read_locks, flush)?;
        Ok((0..establish_read_locks).map(|_| ReadLock { db }).collect())
    }

    /// The database this lock belongs to.
    pub fn database(&self) -> &'db Database {
        self.db
    }
}

impl std::fmt::Debug for WriteLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteLock")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for WriteLock<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.db.release_write_lock(0, false) {
                error!(error = %err, "write lock release failed");
            }
        }
    }
}

/// A failed [`Database::acquire_write_lock_giving_up`]: the surrendered read
/// locks come back untouched together with the error.
pub struct WriteLockFailure<'db> {
    pub surrendered: Vec<ReadLock<'db>>,
    pub error: eyre::Report,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::registry::TypeFactory;
    use tempfile::tempdir;

    const WIDGET_TAG: u16 = 1;

    struct WidgetFactory;
    impl TypeFactory for WidgetFactory {
        fn type_name(&self) -> &'static str {
            "Widget"
        }
        fn record_size(&self) -> u64 {
            16
        }
    }

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry.register(WIDGET_TAG, Arc::new(WidgetFactory)).unwrap();
        registry
    }

    fn open_db(dir: &tempfile::TempDir) -> Database {
        Database::open(
            dir.path().join("test.db"),
            Arc::new(ChunkCache::new()),
            registry(),
            1..=1,
            1,
        )
        .unwrap()
    }

    #[test]
    fn create_and_load_record() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let write = db.acquire_write_lock(None).unwrap();
        let addr = db.new_record(WIDGET_TAG).unwrap();
        write.release(0, false).unwrap();

        let _read = db.acquire_read_lock();
        let node = db.get_node(addr).unwrap().unwrap();
        assert_eq!(node.address(), addr);
        assert_eq!(node.tag(), WIDGET_TAG);

        assert!(db.get_node(0).unwrap().is_none());
    }

    #[test]
    fn typed_load_checks_tag() {
        struct Widget;
        impl NodeType for Widget {
            const TYPE_TAG: u16 = WIDGET_TAG;
            fn type_name() -> &'static str {
                "Widget"
            }
        }
        #[derive(Debug)]
        struct Other;
        impl NodeType for Other {
            const TYPE_TAG: u16 = 2;
            fn type_name() -> &'static str {
                "Other"
            }
        }

        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let write = db.acquire_write_lock(None).unwrap();
        let addr = db.new_record(WIDGET_TAG).unwrap();
        write.release(0, false).unwrap();

        let _read = db.acquire_read_lock();
        let node = db.get_node_as::<Widget>(addr).unwrap().unwrap();
        assert_eq!(node.address(), addr);

        let err = db.get_node_as::<Other>(addr).unwrap_err();
        assert!(StoreError::is_type_mismatch(&err));
    }

    #[test]
    fn write_generation_bumps_on_release() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        assert_eq!(db.write_generation().unwrap(), 0);

        let write = db.acquire_write_lock(None).unwrap();
        write.release(0, false).unwrap();
        assert_eq!(db.write_generation().unwrap(), 1);

        let write = db.acquire_write_lock(None).unwrap();
        drop(write); // implicit release
        assert_eq!(db.write_generation().unwrap(), 2);
    }

    #[test]
    fn release_with_establish_returns_read_guards() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let write = db.acquire_write_lock(None).unwrap();
        let reads = write.release(2, false).unwrap();
        assert_eq!(reads.len(), 2);

        // Still read-locked: a writer would block, so try with giveup.
        drop(reads);
        let write = db.acquire_write_lock(None).unwrap();
        write.release(0, false).unwrap();
    }

    #[test]
    fn surrendered_read_locks_come_back_on_cancellation() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        // A competing reader keeps the writer waiting forever.
        let _other = db.acquire_read_lock();
        let mine = db.acquire_read_lock();

        let probe = || true;
        let failure = db
            .acquire_write_lock_giving_up(vec![mine], Some(&probe))
            .unwrap_err();
        assert!(StoreError::is_cancelled(&failure.error));
        assert_eq!(failure.surrendered.len(), 1);
        drop(failure);
    }

    #[test]
    fn result_cache_invalidated_on_full_release() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        db.store_cached_result::<u64>(42, Arc::new(7));
        assert_eq!(db.cached_result::<u64>(42).as_deref(), Some(&7));

        let write = db.acquire_write_lock(None).unwrap();
        let reads = write.release(1, false).unwrap();
        // Partial release keeps the cache.
        assert_eq!(db.cached_result::<u64>(42).as_deref(), Some(&7));
        drop(reads);

        let write = db.acquire_write_lock(None).unwrap();
        write.release(0, false).unwrap();
        assert!(db.cached_result::<u64>(42).is_none());
    }

    #[test]
    fn type_cookies_roundtrip() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        db.set_type_cookie(WIDGET_TAG, Arc::new("layout-v1"));
        let cookie = db.type_cookie(WIDGET_TAG).unwrap();
        assert_eq!(*cookie.downcast::<&str>().unwrap(), "layout-v1");
        assert!(db.type_cookie(99).is_none());
    }

    #[test]
    fn mutations_require_write_lock() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let err = db.new_record(WIDGET_TAG).unwrap_err();
        assert!(StoreError::is_illegal_state(&err));

        let err = db.schedule_deletion(0x1002).unwrap_err();
        assert!(StoreError::is_illegal_state(&err));
    }

    #[test]
    fn clear_resets_records_and_generation() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let write = db.acquire_write_lock(None).unwrap();
        let addr = db.new_record(WIDGET_TAG).unwrap();
        db.put_root_ptr(0, addr).unwrap();
        db.clear().unwrap();
        write.release(0, false).unwrap();

        assert_eq!(db.root_ptr(0).unwrap(), 0);
        assert_eq!(db.version().unwrap(), 1);
    }
}
