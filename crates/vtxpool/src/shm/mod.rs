//! Shared-memory layer: segment naming, mapped handles, named advisory
//! locks and the POD layouts that live in the segments.

pub mod handle;
pub mod index;
pub mod lock;
pub mod record;

pub use handle::ShmHandle;
pub use index::PoolIndex;
pub use lock::{LockGuard, NamedLock};
pub use record::DeviceRecord;

use crate::types::{DeviceType, Guid};

pub const DEFAULT_NAMESPACE: &str = "vtx";

/// Prefix for every shared memory segment and lock file belonging to one
/// pool. Distinct namespaces never touch each other's state, which keeps
/// test runs hermetic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(String);

impl Default for Namespace {
    fn default() -> Self {
        Namespace(DEFAULT_NAMESPACE.to_string())
    }
}

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Namespace(prefix.into())
    }

    pub fn prefix(&self) -> &str {
        &self.0
    }

    pub fn pool_shm(&self) -> String {
        format!("{}_shm_pool", self.0)
    }

    pub fn pool_lock(&self) -> String {
        format!("{}_lck_pool", self.0)
    }

    pub fn record_shm(&self, device_type: DeviceType, guid: Guid) -> String {
        format!("{}_shm_{}{}", self.0, device_type.tag(), guid)
    }

    pub fn record_lock(&self, device_type: DeviceType, guid: Guid) -> String {
        format!("{}_lck_{}{}", self.0, device_type.tag(), guid)
    }

    /// Rate-limiting lock held while automatic allocation scans the pool.
    pub fn retry_lock(&self, device_type: DeviceType) -> String {
        match device_type {
            DeviceType::Decoder => format!("{}_retry_lck_dec", self.0),
            DeviceType::Encoder => format!("{}_retry_lck_enc", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_deterministic_per_namespace() {
        let ns = Namespace::new("vtx");
        assert_eq!(ns.pool_shm(), "vtx_shm_pool");
        assert_eq!(ns.pool_lock(), "vtx_lck_pool");
        assert_eq!(ns.record_shm(DeviceType::Decoder, 3), "vtx_shm_d3");
        assert_eq!(ns.record_lock(DeviceType::Encoder, 0), "vtx_lck_e0");
        assert_eq!(ns.retry_lock(DeviceType::Decoder), "vtx_retry_lck_dec");
        assert_eq!(ns.retry_lock(DeviceType::Encoder), "vtx_retry_lck_enc");
    }

    #[test]
    fn distinct_namespaces_never_collide() {
        let a = Namespace::new("pool_a");
        let b = Namespace::new("pool_b");
        assert_ne!(a.record_shm(DeviceType::Decoder, 0), b.record_shm(DeviceType::Decoder, 0));
        assert_ne!(a.pool_lock(), b.pool_lock());
    }
}
