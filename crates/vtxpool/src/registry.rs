//! Handles onto the shared pool index and individual device records.

use shared_memory::ShmemError;
use tracing::info;

use crate::shm::{DeviceRecord, NamedLock, Namespace, PoolIndex, ShmHandle};
use crate::types::{DeviceType, Guid};
use crate::{PoolError, Result};

/// A process-local handle onto the pool index segment and its lock.
///
/// Every process opens its own handle; exclusion between them comes from
/// the named pool lock, which all index access goes through.
pub struct DevicePool {
    ns: Namespace,
    index: ShmHandle<PoolIndex>,
    lock: NamedLock,
}

impl DevicePool {
    /// Opens the pool of an initialized namespace.
    pub fn open(ns: &Namespace) -> Result<Self> {
        if !Self::exists(ns) {
            return Err(PoolError::PoolNotInitialized);
        }
        let index = ShmHandle::open(&ns.pool_shm())?;
        let lock = NamedLock::open(&ns.pool_lock())?;
        Ok(DevicePool {
            ns: ns.clone(),
            index,
            lock,
        })
    }

    /// Creates the pool segment with an empty index. Exactly one creator
    /// wins; racing creators get `AlreadyInitialized` and must open instead.
    pub(crate) fn create(ns: &Namespace) -> Result<Self> {
        let index = match ShmHandle::create_exclusive(&ns.pool_shm(), PoolIndex::new()) {
            Ok(index) => index,
            Err(PoolError::Shm {
                source: ShmemError::LinkExists,
                ..
            }) => return Err(PoolError::AlreadyInitialized),
            Err(e) => return Err(e),
        };
        let lock = NamedLock::open(&ns.pool_lock())?;
        Ok(DevicePool {
            ns: ns.clone(),
            index,
            lock,
        })
    }

    pub fn exists(ns: &Namespace) -> bool {
        ShmHandle::<PoolIndex>::exists(&ns.pool_shm())
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// Runs `f` with the index under the pool lock, blocking until the
    /// lock frees.
    pub fn with_index<R>(&self, f: impl FnOnce(&PoolIndex) -> Result<R>) -> Result<R> {
        let _guard = self.lock.lock()?;
        f(self.index.get())
    }

    /// Runs `f` with mutable access to the index under the pool lock.
    pub fn with_index_mut<R>(
        &self,
        f: impl FnOnce(&mut PoolIndex) -> Result<R>,
    ) -> Result<R> {
        let _guard = self.lock.lock()?;
        let index = unsafe { &mut *self.index.ptr() };
        f(index)
    }

    /// Removes the pool segment and lock file.
    pub(crate) fn destroy(ns: &Namespace) -> Result<()> {
        ShmHandle::<PoolIndex>::unlink(&ns.pool_shm())?;
        NamedLock::unlink(&ns.pool_lock())?;
        info!(namespace = ns.prefix(), "removed pool index");
        Ok(())
    }
}

/// A process-local handle onto one engine's shared record.
pub struct DeviceContext {
    device_type: DeviceType,
    guid: Guid,
    record: ShmHandle<DeviceRecord>,
    lock: NamedLock,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device_type", &self.device_type)
            .field("guid", &self.guid)
            .finish_non_exhaustive()
    }
}

impl DeviceContext {
    /// Opens the record of a registered engine.
    pub fn open(ns: &Namespace, device_type: DeviceType, guid: Guid) -> Result<Self> {
        let shm_name = ns.record_shm(device_type, guid);
        if !ShmHandle::<DeviceRecord>::exists(&shm_name) {
            return Err(PoolError::NotFound { device_type, guid });
        }
        let record = ShmHandle::open(&shm_name)?;
        let lock = NamedLock::open(&ns.record_lock(device_type, guid))?;
        Ok(DeviceContext {
            device_type,
            guid,
            record,
            lock,
        })
    }

    /// Creates the record segment for a newly registered engine.
    pub(crate) fn create(
        ns: &Namespace,
        device_type: DeviceType,
        guid: Guid,
        record: DeviceRecord,
    ) -> Result<Self> {
        let shm = ShmHandle::create(&ns.record_shm(device_type, guid), record)?;
        let lock = NamedLock::open(&ns.record_lock(device_type, guid))?;
        Ok(DeviceContext {
            device_type,
            guid,
            record: shm,
            lock,
        })
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// Runs `f` with the record under its lock, blocking until the lock
    /// frees. Only the allocation rate-limit locks time out; a held pool
    /// or record lock means a peer is mid-update and is always waited for.
    pub fn with_record<R>(&self, f: impl FnOnce(&DeviceRecord) -> R) -> Result<R> {
        let _guard = self.lock.lock()?;
        Ok(f(self.record.get()))
    }

    /// Runs `f` with mutable access to the record under its lock. The
    /// closure may fail without leaving the lock held.
    pub fn with_record_mut<R>(
        &self,
        f: impl FnOnce(&mut DeviceRecord) -> Result<R>,
    ) -> Result<R> {
        let _guard = self.lock.lock()?;
        let record = unsafe { &mut *self.record.ptr() };
        f(record)
    }

    /// Copies the record out under its lock.
    pub fn snapshot(&self) -> Result<DeviceRecord> {
        self.with_record(|rec| *rec)
    }

    /// Rewrites the load fields and instance table from a fresh query.
    /// For periodic updaters that keep records warm between allocations.
    pub fn update_load(&self, query: &crate::session::LoadQuery) -> Result<()> {
        self.with_record_mut(|rec| {
            rec.apply_load(query);
            Ok(())
        })
    }

    /// Removes an engine's record segment and lock file.
    pub(crate) fn destroy(ns: &Namespace, device_type: DeviceType, guid: Guid) -> Result<()> {
        ShmHandle::<DeviceRecord>::unlink(&ns.record_shm(device_type, guid))?;
        NamedLock::unlink(&ns.record_lock(device_type, guid))?;
        Ok(())
    }
}
