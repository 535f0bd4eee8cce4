//! Cross-process resource pool for NVMe-attached video transcoder cards.
//!
//! The pool lives entirely in POSIX shared memory under `/dev/shm`, guarded
//! by named advisory file locks, so any number of unrelated processes can
//! register cards, query load and carve out transcoding capacity without a
//! central daemon.

pub mod alloc;
pub mod enumerate;
pub mod logging;
pub mod monitor;
pub mod probe;
pub mod registrar;
pub mod registry;
pub mod session;
pub mod shm;
pub mod types;

use thiserror::Error;

use crate::session::SessionError;
use crate::types::DeviceType;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("shared memory `{name}` unavailable: {source}")]
    Shm {
        name: String,
        source: shared_memory::ShmemError,
    },

    #[error("lock file `{name}` unavailable: {source}")]
    Lock {
        name: String,
        source: std::io::Error,
    },

    #[error("timed out waiting for lock `{name}`")]
    LockTimeout { name: String },

    #[error("device pool is not initialized")]
    PoolNotInitialized,

    #[error("device pool already initialized")]
    AlreadyInitialized,

    #[error("no compatible device appeared within {waited_secs}s")]
    Timeout { waited_secs: u64 },

    #[error("device at `{path}` has incompatible firmware")]
    DeviceIncompatible { path: String },

    #[error("device at `{path}` has active sessions and cannot be removed")]
    DeviceBusy { path: String },

    #[error("no {device_type} with guid {guid} in the pool")]
    NotFound { device_type: DeviceType, guid: i32 },

    #[error("no registered device at `{path}`")]
    UnknownDevice { path: String },

    #[error("no suitable {device_type} available")]
    NoDeviceAvailable { device_type: DeviceType },

    #[error(
        "pixel rate {requested} on top of current {current} exceeds capacity {capacity}"
    )]
    CapacityExceeded {
        requested: u64,
        current: u64,
        capacity: u64,
    },

    #[error("device session failed: {0}")]
    Session(#[from] SessionError),

    #[error("{what}: {source}")]
    Io {
        what: &'static str,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PoolError>;
