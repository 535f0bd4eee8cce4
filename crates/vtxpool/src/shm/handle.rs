//! Mapped shared memory segments.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::path::PathBuf;

use shared_memory::{Mode, Shmem, ShmemConf, ShmemError};
use tracing::info;

use super::lock::SHM_DIR;
use crate::{PoolError, Result};

/// A typed mapping of one named segment under `/dev/shm`.
///
/// `T` must be a `#[repr(C)]` plain-old-data type: it is shared byte-for-byte
/// with other processes. All mutation must happen under the segment's named
/// lock; the handle itself does no synchronization.
pub struct ShmHandle<T> {
    shmem: RefCell<Shmem>,
    ptr: *mut T,
    name: String,
    _marker: PhantomData<T>,
}

impl<T> ShmHandle<T> {
    /// Opens an existing segment.
    pub fn open(name: &str) -> Result<Self> {
        let shmem = ShmemConf::new()
            .size(std::mem::size_of::<T>())
            .os_id(name)
            .open()
            .map_err(|source| PoolError::Shm {
                name: name.to_string(),
                source,
            })?;

        Ok(Self::from_shmem(shmem, name))
    }

    /// Creates the segment and writes `init` into it, failing with
    /// `ShmemError::LinkExists` if the segment already exists. This is the
    /// entry point for pool creation: losing a creation race must surface
    /// as an error, never silently reset a live segment.
    pub fn create_exclusive(name: &str, init: T) -> Result<Self> {
        let shmem = Self::create_segment(name)?;
        Ok(Self::finish_create(shmem, name, init))
    }

    /// Creates the segment and writes `init` into it. If another process
    /// created it first, the existing segment is opened and reset to `init`;
    /// callers serialize record creation under the pool lock.
    pub fn create(name: &str, init: T) -> Result<Self> {
        let shmem = match Self::create_segment(name) {
            Ok(shmem) => shmem,
            Err(PoolError::Shm {
                source: ShmemError::LinkExists,
                ..
            }) => ShmemConf::new()
                .size(std::mem::size_of::<T>())
                .os_id(name)
                .open()
                .map_err(|source| PoolError::Shm {
                    name: name.to_string(),
                    source,
                })?,
            Err(e) => return Err(e),
        };

        Ok(Self::finish_create(shmem, name, init))
    }

    fn create_segment(name: &str) -> Result<Shmem> {
        let old_umask = unsafe { libc::umask(0) };

        let created = ShmemConf::new()
            .size(std::mem::size_of::<T>())
            .os_id(name)
            .mode(
                Mode::S_IRUSR
                    | Mode::S_IWUSR
                    | Mode::S_IRGRP
                    | Mode::S_IWGRP
                    | Mode::S_IROTH
                    | Mode::S_IWOTH,
            )
            .create();

        unsafe {
            libc::umask(old_umask);
        }

        created.map_err(|source| PoolError::Shm {
            name: name.to_string(),
            source,
        })
    }

    fn finish_create(shmem: Shmem, name: &str, init: T) -> Self {
        let handle = Self::from_shmem(shmem, name);
        unsafe {
            handle.ptr.write(init);
        }
        // The segment outlives this process; removal is explicit.
        handle.shmem.borrow_mut().set_owner(false);

        info!(name = %name, size = std::mem::size_of::<T>(), "created shared memory segment");

        handle
    }

    fn from_shmem(shmem: Shmem, name: &str) -> Self {
        let ptr = shmem.as_ptr() as *mut T;
        ShmHandle {
            shmem: RefCell::new(shmem),
            ptr,
            name: name.to_string(),
            _marker: PhantomData,
        }
    }

    pub fn get(&self) -> &T {
        unsafe { &*self.ptr }
    }

    /// Raw pointer for writes. Caller must hold the segment's named lock.
    pub fn ptr(&self) -> *mut T {
        self.ptr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(name: &str) -> PathBuf {
        PathBuf::from(SHM_DIR).join(name)
    }

    pub fn exists(name: &str) -> bool {
        Self::path(name).exists()
    }

    /// Removes the backing file so no further opens succeed. Existing
    /// mappings stay valid until dropped.
    pub fn unlink(name: &str) -> Result<()> {
        match std::fs::remove_file(Self::path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PoolError::Io {
                what: "remove shared memory segment",
                source,
            }),
        }
    }
}

// Mutation is serialized by the named locks, reads are of POD data.
unsafe impl<T: Send> Send for ShmHandle<T> {}
unsafe impl<T: Sync> Sync for ShmHandle<T> {}
