//! Card probing and firmware compatibility policy.

use std::path::Path;

use tracing::{debug, warn};

use crate::session::{DeviceCapability, DeviceSession, FirmwareRev};
use crate::types::FwCompat;
use crate::{PoolError, Result};

/// Release revision the pool was qualified against.
pub const FW_RELEASE_CURRENT: &[u8; 3] = b"259";

/// API flavors this software speaks.
pub const FW_API_FLAVORS_SUPPORTED: &[&[u8; 2]] = &[b"1E"];

/// Minimum firmware API version.
pub const FW_API_VERSION_MIN: u32 = 9;

/// Classifies a firmware revision.
///
/// Wrong API flavor or an API version below the minimum makes the card
/// unusable. A release revision older than the current one is accepted with
/// a warning since the API contract still holds.
pub fn fw_compat(rev: &FirmwareRev) -> FwCompat {
    let flavor_ok = FW_API_FLAVORS_SUPPORTED
        .iter()
        .any(|f| rev.api_flavor() == &f[..]);
    let version_ok = rev
        .api_version()
        .map(|v| v >= FW_API_VERSION_MIN)
        .unwrap_or(false);
    if !flavor_ok || !version_ok {
        return FwCompat::Incompatible;
    }
    if rev.release() < &FW_RELEASE_CURRENT[..] {
        return FwCompat::CoreCompatible;
    }
    FwCompat::FullyCompatible
}

/// Opens a card and queries its capability report.
pub fn probe(
    session: &dyn DeviceSession,
    device_path: &Path,
    block_path: &Path,
) -> Result<DeviceCapability> {
    let handle = session.open(device_path, block_path)?;
    let cap = handle.capability_query()?;
    debug!(
        device = %device_path.display(),
        is_transcoder = cap.is_transcoder,
        fw_rev = %cap.fw_rev.as_display(),
        modules = cap.modules.len(),
        "probed device"
    );
    Ok(cap)
}

/// Decides whether a probed card joins the pool.
///
/// Returns the compat-warning flag to store in its records, or an error for
/// incompatible firmware. `match_firmware` disables the check entirely.
pub fn admit(
    cap: &DeviceCapability,
    device_path: &Path,
    match_firmware: bool,
) -> Result<bool> {
    if !match_firmware {
        return Ok(false);
    }
    match fw_compat(&cap.fw_rev) {
        FwCompat::FullyCompatible => Ok(false),
        FwCompat::CoreCompatible => {
            warn!(
                device = %device_path.display(),
                fw_rev = %cap.fw_rev.as_display(),
                "firmware release predates {}, continuing with core compatibility",
                String::from_utf8_lossy(FW_RELEASE_CURRENT)
            );
            Ok(true)
        }
        FwCompat::Incompatible => Err(PoolError::DeviceIncompatible {
            path: device_path.display().to_string(),
        }),
    }
}
