//! Device discovery: scans the device directory for transcoder candidates.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::probe;
use crate::session::{DeviceCapability, DeviceSession};
use crate::types::MAX_DEVICES;
use crate::{PoolError, Result};

/// Where and what to scan.
#[derive(Debug, Clone)]
pub struct EnumerateOptions {
    pub dev_dir: PathBuf,
    /// Device name prefix; candidates are `<prefix><number>`.
    pub prefix: String,
    pub max_devices: usize,
}

impl Default for EnumerateOptions {
    fn default() -> Self {
        EnumerateOptions {
            dev_dir: PathBuf::from("/dev"),
            prefix: "nvme".to_string(),
            max_devices: MAX_DEVICES,
        }
    }
}

/// A candidate card found by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub device_path: PathBuf,
    pub block_path: PathBuf,
}

/// A probed, admitted card ready for registration.
pub struct AdmittedDevice {
    pub discovered: DiscoveredDevice,
    pub capability: DeviceCapability,
    pub compat_warning: bool,
}

/// Derives the block namespace path from a controller path
/// (`/dev/nvme0` -> `/dev/nvme0n1`).
pub fn block_path_for(device_path: &Path) -> PathBuf {
    let mut s = device_path.as_os_str().to_os_string();
    s.push("n1");
    PathBuf::from(s)
}

/// Lists device nodes named `<prefix><number>` in ascending numeric order.
/// Enumeration order is presentation only; identity comes from guids.
pub fn enumerate(opts: &EnumerateOptions) -> Result<Vec<DiscoveredDevice>> {
    let entries = std::fs::read_dir(&opts.dev_dir).map_err(|source| PoolError::Io {
        what: "read device directory",
        source,
    })?;

    let mut numbered: Vec<(u32, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| PoolError::Io {
            what: "read device directory entry",
            source,
        })?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name.strip_prefix(opts.prefix.as_str()) else {
            continue;
        };
        // Only bare controller nodes: the suffix must be a plain number, so
        // namespaces like nvme0n1 are skipped.
        let Ok(ordinal) = suffix.parse::<u32>() else {
            continue;
        };
        numbered.push((ordinal, opts.dev_dir.join(name)));
    }
    numbered.sort_by_key(|(ordinal, _)| *ordinal);

    if numbered.len() > opts.max_devices {
        warn!(
            found = numbered.len(),
            max = opts.max_devices,
            "more devices than the pool can hold, ignoring the rest"
        );
        numbered.truncate(opts.max_devices);
    }

    Ok(numbered
        .into_iter()
        .map(|(_, device_path)| {
            let block_path = block_path_for(&device_path);
            DiscoveredDevice {
                device_path,
                block_path,
            }
        })
        .collect())
}

/// Enumerates, probes and filters down to admitted transcoder cards.
///
/// Per-device probe failures and rejections are logged and skipped; a card
/// that cannot be probed must not block the rest of the pool.
pub fn scan(
    session: &dyn DeviceSession,
    opts: &EnumerateOptions,
    match_firmware: bool,
) -> Result<Vec<AdmittedDevice>> {
    let mut admitted = Vec::new();
    for discovered in enumerate(opts)? {
        let capability =
            match probe::probe(session, &discovered.device_path, &discovered.block_path) {
                Ok(cap) => cap,
                Err(e) => {
                    debug!(
                        device = %discovered.device_path.display(),
                        error = %e,
                        "probe failed, skipping device"
                    );
                    continue;
                }
            };
        if !capability.is_transcoder {
            debug!(
                device = %discovered.device_path.display(),
                "not a transcoder, skipping"
            );
            continue;
        }
        let compat_warning =
            match probe::admit(&capability, &discovered.device_path, match_firmware) {
                Ok(flag) => flag,
                Err(e) => {
                    warn!(
                        device = %discovered.device_path.display(),
                        error = %e,
                        "device rejected"
                    );
                    continue;
                }
            };
        admitted.push(AdmittedDevice {
            discovered,
            capability,
            compat_warning,
        });
    }
    Ok(admitted)
}
