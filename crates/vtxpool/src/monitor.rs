//! Read-only pool views for monitoring tools.

use serde::Serialize;

use crate::registry::{DeviceContext, DevicePool};
use crate::shm::{DeviceRecord, Namespace};
use crate::types::{Codec, DeviceType, Guid};
use crate::{PoolError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: i32,
    pub codec: Option<Codec>,
    pub width: i32,
    pub height: i32,
    pub fps: i32,
}

/// Point-in-time copy of one engine's record, shaped for output.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub guid: Guid,
    pub device_type: DeviceType,
    pub device_path: String,
    pub block_path: String,
    pub hw_id: i32,
    pub fw_rev: String,
    pub fw_compat_warning: bool,
    pub codecs: Vec<Codec>,
    pub max_1080p_fps: i32,
    pub max_instances: u32,
    pub current_load: u32,
    pub model_load: u32,
    pub active_instances: u32,
    pub xcode_load_pixel: u64,
    pub instances: Vec<InstanceSnapshot>,
}

impl DeviceSnapshot {
    fn from_record(rec: &DeviceRecord, device_type: DeviceType) -> Self {
        let codecs = Codec::ALL
            .iter()
            .copied()
            .filter(|c| rec.supports(*c))
            .collect();
        let instances = rec
            .instances
            .iter()
            .filter(|slot| slot.active != 0)
            .map(|slot| InstanceSnapshot {
                id: slot.id,
                codec: Codec::from_index(slot.codec as usize),
                width: slot.width,
                height: slot.height,
                fps: slot.fps,
            })
            .collect();
        DeviceSnapshot {
            guid: rec.guid,
            device_type,
            device_path: rec.device_path().to_string(),
            block_path: rec.block_path().to_string(),
            hw_id: rec.hw_id,
            fw_rev: rec.fw_rev().as_display(),
            fw_compat_warning: rec.fw_compat_warning != 0,
            codecs,
            max_1080p_fps: rec.max_1080p_fps,
            max_instances: rec.max_instances,
            current_load: rec.current_load,
            model_load: rec.model_load,
            active_instances: rec.active_instances,
            xcode_load_pixel: rec.xcode_load_pixel,
            instances,
        }
    }
}

/// Snapshot of every engine in the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub decoders: Vec<DeviceSnapshot>,
    pub encoders: Vec<DeviceSnapshot>,
}

/// Snapshots every engine of one type, in index order.
pub fn list_devices(ns: &Namespace, device_type: DeviceType) -> Result<Vec<DeviceSnapshot>> {
    let pool = DevicePool::open(ns)?;
    pool.with_index(|index| {
        let mut out = Vec::new();
        for &guid in index.guids(device_type) {
            let ctx = DeviceContext::open(ns, device_type, guid)?;
            out.push(ctx.with_record(|rec| DeviceSnapshot::from_record(rec, device_type))?);
        }
        Ok(out)
    })
}

pub fn list_all(ns: &Namespace) -> Result<PoolSnapshot> {
    Ok(PoolSnapshot {
        decoders: list_devices(ns, DeviceType::Decoder)?,
        encoders: list_devices(ns, DeviceType::Encoder)?,
    })
}

/// Looks an engine up by the block device path stored in its record.
pub fn guid_by_block_path(
    ns: &Namespace,
    device_type: DeviceType,
    block_path: &str,
) -> Result<Guid> {
    let pool = DevicePool::open(ns)?;
    pool.with_index(|index| {
        for &guid in index.guids(device_type) {
            let ctx = DeviceContext::open(ns, device_type, guid)?;
            if ctx.with_record(|rec| rec.block_path_matches(block_path))? {
                return Ok(guid);
            }
        }
        Err(PoolError::UnknownDevice {
            path: block_path.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{FirmwareRev, ModuleCapability};

    #[test]
    fn snapshot_reflects_record_fields() {
        let mut rec = DeviceRecord::new(DeviceType::Encoder, 4);
        rec.set_device_path("/dev/nvme4");
        rec.set_block_path("/dev/nvme4n1");
        rec.set_fw(&FirmwareRev::from_str_padded("259r1E09"), true);
        rec.apply_module(&ModuleCapability {
            hw_id: 1,
            device_type: DeviceType::Encoder,
            codec: Codec::H265,
            max_1080p_fps: 240,
            max_instances: 32,
            max_res: (8192, 8192),
            min_res: (64, 64),
        });
        rec.xcode_load_pixel = 12345;

        let snap = DeviceSnapshot::from_record(&rec, DeviceType::Encoder);
        assert_eq!(snap.guid, 4);
        assert_eq!(snap.device_path, "/dev/nvme4");
        assert_eq!(snap.block_path, "/dev/nvme4n1");
        assert!(snap.fw_compat_warning);
        assert_eq!(snap.codecs, vec![Codec::H265]);
        assert_eq!(snap.xcode_load_pixel, 12345);
        assert!(snap.instances.is_empty());

        // Snapshots are the CLI's JSON surface.
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"device_type\":\"encoder\""));
    }
}
