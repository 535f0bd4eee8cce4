//! Pool lifecycle: initialization, refresh and card registration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::enumerate::{self, AdmittedDevice, EnumerateOptions};
use crate::probe;
use crate::registry::{DeviceContext, DevicePool};
use crate::session::DeviceSession;
use crate::shm::{NamedLock, Namespace, PoolIndex};
use crate::types::{DeviceType, Guid};
use crate::{PoolError, Result};

/// How often `init` re-scans while waiting for the first card to appear.
const INIT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// What a refresh pass changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    /// Paths that disappeared but still hold active sessions; retried on
    /// the next refresh.
    pub deferred: Vec<PathBuf>,
}

impl RefreshSummary {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.deferred.is_empty()
    }
}

/// Registers and unregisters cards in one pool namespace.
pub struct Registrar<'a> {
    ns: Namespace,
    session: &'a dyn DeviceSession,
    enumerate: EnumerateOptions,
}

impl<'a> Registrar<'a> {
    pub fn new(
        ns: Namespace,
        session: &'a dyn DeviceSession,
        enumerate: EnumerateOptions,
    ) -> Self {
        Registrar {
            ns,
            session,
            enumerate,
        }
    }

    /// Creates the pool and registers every admitted card.
    ///
    /// Re-scans every few seconds until at least one compatible card shows
    /// up. A zero `timeout` waits forever; otherwise giving up yields
    /// [`PoolError::Timeout`] once the budget is spent.
    pub fn init(&self, match_firmware: bool, timeout: Duration) -> Result<()> {
        if DevicePool::exists(&self.ns) {
            return Err(PoolError::AlreadyInitialized);
        }

        let start = Instant::now();
        let admitted = loop {
            let admitted = enumerate::scan(self.session, &self.enumerate, match_firmware)?;
            if !admitted.is_empty() {
                break admitted;
            }
            let elapsed = start.elapsed();
            let sleep = if timeout.is_zero() {
                INIT_POLL_INTERVAL
            } else {
                if elapsed >= timeout {
                    return Err(PoolError::Timeout {
                        waited_secs: elapsed.as_secs(),
                    });
                }
                INIT_POLL_INTERVAL.min(timeout - elapsed)
            };
            info!(
                waited_secs = elapsed.as_secs(),
                "no compatible transcoder found yet, retrying"
            );
            std::thread::sleep(sleep);
        };

        let pool = DevicePool::create(&self.ns)?;
        let registered = pool.with_index_mut(|index| {
            let mut registered = 0usize;
            for dev in &admitted {
                match self.register_locked(index, dev) {
                    Ok(_) => registered += 1,
                    Err(e) => warn!(
                        device = %dev.discovered.device_path.display(),
                        error = %e,
                        "failed to register device"
                    ),
                }
            }
            Ok(registered)
        })?;

        info!(
            namespace = self.ns.prefix(),
            devices = registered,
            "device pool initialized"
        );
        Ok(())
    }

    /// Reconciles the pool against a fresh scan: registers new cards,
    /// unregisters vanished ones. Removal of a card that still has active
    /// sessions is deferred to a later refresh.
    pub fn refresh(&self, match_firmware: bool) -> Result<RefreshSummary> {
        let pool = DevicePool::open(&self.ns)?;
        // Probing happens before the pool lock is taken; only the
        // reconciliation itself needs exclusion.
        let admitted = enumerate::scan(self.session, &self.enumerate, match_firmware)?;

        pool.with_index_mut(|index| {
            let registered = registered_paths_locked(&self.ns, index)?;
            let seen: HashSet<&Path> = admitted
                .iter()
                .map(|d| d.discovered.device_path.as_path())
                .collect();

            let mut summary = RefreshSummary::default();
            for (_, path) in &registered {
                if seen.contains(path.as_path()) {
                    continue;
                }
                match self.remove_locked(index, path) {
                    Ok(()) => summary.removed.push(path.clone()),
                    Err(e) => {
                        warn!(
                            device = %path.display(),
                            error = %e,
                            "failed to unregister vanished device, will retry"
                        );
                        summary.deferred.push(path.clone());
                    }
                }
            }

            let known: HashSet<&Path> =
                registered.iter().map(|(_, p)| p.as_path()).collect();
            for dev in &admitted {
                let path = dev.discovered.device_path.as_path();
                if known.contains(path) {
                    continue;
                }
                match self.register_locked(index, dev) {
                    Ok(_) => summary.added.push(path.to_path_buf()),
                    Err(e) => warn!(
                        device = %path.display(),
                        error = %e,
                        "failed to register new device"
                    ),
                }
            }
            Ok(summary)
        })
    }

    /// Probes one card and registers it. Registering an already known path
    /// refreshes its capability data in place.
    pub fn add_device(&self, device_path: &Path, match_firmware: bool) -> Result<Guid> {
        let block_path = enumerate::block_path_for(device_path);
        let capability = probe::probe(self.session, device_path, &block_path)?;
        if !capability.is_transcoder {
            return Err(PoolError::DeviceIncompatible {
                path: device_path.display().to_string(),
            });
        }
        let compat_warning = probe::admit(&capability, device_path, match_firmware)?;
        let admitted = AdmittedDevice {
            discovered: enumerate::DiscoveredDevice {
                device_path: device_path.to_path_buf(),
                block_path,
            },
            capability,
            compat_warning,
        };

        let pool = DevicePool::open(&self.ns)?;
        pool.with_index_mut(|index| self.register_locked(index, &admitted))
    }

    /// Unregisters the card at `device_path`. Fails with
    /// [`PoolError::DeviceBusy`] while any of its engines still has active
    /// sessions.
    pub fn remove_device(&self, device_path: &Path) -> Result<()> {
        let pool = DevicePool::open(&self.ns)?;
        pool.with_index_mut(|index| self.remove_locked(index, device_path))
    }

    /// Tears down every record and the pool index itself, regardless of
    /// active sessions. For decommissioning a host, not routine cleanup.
    pub fn remove_all(&self) -> Result<()> {
        let pool = DevicePool::open(&self.ns)?;
        pool.with_index_mut(|index| {
            for guid in index.guids(DeviceType::Decoder).to_vec() {
                DeviceContext::destroy(&self.ns, DeviceType::Decoder, guid)?;
                DeviceContext::destroy(&self.ns, DeviceType::Encoder, guid)?;
                index.remove_pair(guid);
            }
            Ok(())
        })?;
        drop(pool);

        DevicePool::destroy(&self.ns)?;
        NamedLock::unlink(&self.ns.retry_lock(DeviceType::Decoder))?;
        NamedLock::unlink(&self.ns.retry_lock(DeviceType::Encoder))?;
        info!(namespace = self.ns.prefix(), "removed all pool state");
        Ok(())
    }

    /// Registers one admitted card under the held pool lock, or updates
    /// its records in place when the path is already registered.
    fn register_locked(&self, index: &mut PoolIndex, dev: &AdmittedDevice) -> Result<Guid> {
        let device_path = dev.discovered.device_path.display().to_string();
        let block_path = dev.discovered.block_path.display().to_string();

        let decoder_modules: Vec<_> = dev
            .capability
            .modules
            .iter()
            .filter(|m| m.device_type == DeviceType::Decoder)
            .collect();
        let encoder_modules: Vec<_> = dev
            .capability
            .modules
            .iter()
            .filter(|m| m.device_type == DeviceType::Encoder)
            .collect();
        if decoder_modules.is_empty() || encoder_modules.is_empty() {
            return Err(PoolError::DeviceIncompatible {
                path: device_path.clone(),
            });
        }

        let existing =
            find_guid_by_path_locked(&self.ns, index, &device_path, Some(decoder_modules[0].hw_id))?;
        let (guid, fresh) = match existing {
            Some(guid) => (guid, false),
            None => {
                let guid = index
                    .next_free_guid()
                    .ok_or(PoolError::InvalidParameter("device pool is full"))?;
                (guid, true)
            }
        };

        for (device_type, modules) in [
            (DeviceType::Decoder, &decoder_modules),
            (DeviceType::Encoder, &encoder_modules),
        ] {
            let mut record = crate::shm::DeviceRecord::new(device_type, guid);
            record.set_device_path(&device_path);
            record.set_block_path(&block_path);
            record.set_fw(&dev.capability.fw_rev, dev.compat_warning);
            for module in modules.iter() {
                record.apply_module(module);
            }

            if fresh {
                DeviceContext::create(&self.ns, device_type, guid, record)?;
            } else {
                let ctx = DeviceContext::open(&self.ns, device_type, guid)?;
                ctx.with_record_mut(|rec| {
                    // Capability data is rewritten, load state is kept.
                    record.current_load = rec.current_load;
                    record.model_load = rec.model_load;
                    record.active_instances = rec.active_instances;
                    record.xcode_load_pixel = rec.xcode_load_pixel;
                    record.instances = rec.instances;
                    *rec = record;
                    Ok(())
                })?;
            }
        }

        if fresh {
            index.append_pair(guid);
            info!(guid, device = %device_path, "registered transcoder");
        } else {
            info!(guid, device = %device_path, "updated registered transcoder");
        }
        Ok(guid)
    }

    fn remove_locked(&self, index: &mut PoolIndex, device_path: &Path) -> Result<()> {
        let path_str = device_path.display().to_string();
        let guid = find_guid_by_path_locked(&self.ns, index, &path_str, None)?.ok_or_else(|| {
            PoolError::UnknownDevice {
                path: path_str.clone(),
            }
        })?;

        if self.live_instance_count(device_path) > 0 {
            return Err(PoolError::DeviceBusy { path: path_str });
        }

        DeviceContext::destroy(&self.ns, DeviceType::Decoder, guid)?;
        DeviceContext::destroy(&self.ns, DeviceType::Encoder, guid)?;
        index.remove_pair(guid);
        info!(guid, device = %path_str, "unregistered transcoder");
        Ok(())
    }

    /// Queries the card for live sessions. A card that cannot be opened or
    /// queried has none worth protecting.
    pub fn live_instance_count(&self, device_path: &Path) -> u32 {
        let block_path = enumerate::block_path_for(device_path);
        let Ok(handle) = self.session.open(device_path, &block_path) else {
            return 0;
        };
        [DeviceType::Decoder, DeviceType::Encoder]
            .iter()
            .map(|ty| {
                handle
                    .load_query(*ty)
                    .map(|q| q.active_instances)
                    .unwrap_or(0)
            })
            .sum()
    }
}

/// All registered (guid, device path) pairs. Caller holds the pool lock.
fn registered_paths_locked(
    ns: &Namespace,
    index: &PoolIndex,
) -> Result<Vec<(Guid, PathBuf)>> {
    let mut out = Vec::new();
    for &guid in index.guids(DeviceType::Decoder) {
        let ctx = DeviceContext::open(ns, DeviceType::Decoder, guid)?;
        let path = ctx.with_record(|rec| rec.device_path().to_string())?;
        out.push((guid, PathBuf::from(path)));
    }
    Ok(out)
}

/// Scans decoder records for a registered card. Registration matches on
/// device path plus hardware id, so a replacement card in the same slot
/// gets its own guid; removal (`hw_id: None`) goes by path alone.
fn find_guid_by_path_locked(
    ns: &Namespace,
    index: &PoolIndex,
    device_path: &str,
    hw_id: Option<i32>,
) -> Result<Option<Guid>> {
    for &guid in index.guids(DeviceType::Decoder) {
        let ctx = DeviceContext::open(ns, DeviceType::Decoder, guid)?;
        let matched = ctx.with_record(|rec| {
            rec.device_path_matches(device_path) && hw_id.map_or(true, |id| rec.hw_id == id)
        })?;
        if matched {
            return Ok(Some(guid));
        }
    }
    Ok(None)
}
