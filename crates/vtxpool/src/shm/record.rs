//! Per-engine shared record layout.

use crate::session::{FirmwareRev, InstanceState, LoadQuery, ModuleCapability};
use crate::types::{Codec, DeviceType, Guid, CODEC_COUNT, MAX_INSTANCES, MAX_PATH_LEN};

/// Per-codec capability of one engine.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoCap {
    pub supported: u32,
    pub max_res_width: i32,
    pub max_res_height: i32,
    pub min_res_width: i32,
    pub min_res_height: i32,
}

/// One live transcoding instance, mirrored from the last load query.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InstanceSlot {
    pub id: i32,
    pub active: u32,
    pub codec: u32,
    pub width: i32,
    pub height: i32,
    pub fps: i32,
}

impl Default for InstanceSlot {
    fn default() -> Self {
        InstanceSlot {
            id: -1,
            active: 0,
            codec: 0,
            width: 0,
            height: 0,
            fps: 0,
        }
    }
}

/// Shared state of one engine (one decoder or encoder of one card).
///
/// Lives in its own `/dev/shm` segment, mutated only under the engine's
/// named lock. Plain old data so every process sees the same bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DeviceRecord {
    device_path: [u8; MAX_PATH_LEN],
    block_path: [u8; MAX_PATH_LEN],
    pub hw_id: i32,
    pub guid: Guid,
    pub device_type: u32,
    pub fw_rev: [u8; 8],
    /// Nonzero when the firmware was accepted as core-compatible only.
    pub fw_compat_warning: u32,
    pub max_1080p_fps: i32,
    pub max_instances: u32,
    pub current_load: u32,
    pub model_load: u32,
    pub active_instances: u32,
    /// Accumulated admitted pixel rate (width x height x fps), encoders only.
    pub xcode_load_pixel: u64,
    pub caps: [VideoCap; CODEC_COUNT],
    pub instances: [InstanceSlot; MAX_INSTANCES],
}

fn write_path(buf: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let copy_len = std::cmp::min(bytes.len(), buf.len() - 1);
    buf.fill(0);
    buf[..copy_len].copy_from_slice(&bytes[..copy_len]);
}

fn read_path(buf: &[u8]) -> &str {
    let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..nul]).unwrap_or("")
}

impl DeviceRecord {
    pub fn new(device_type: DeviceType, guid: Guid) -> Self {
        DeviceRecord {
            device_path: [0; MAX_PATH_LEN],
            block_path: [0; MAX_PATH_LEN],
            hw_id: -1,
            guid,
            device_type: device_type.as_u32(),
            fw_rev: [0; 8],
            fw_compat_warning: 0,
            max_1080p_fps: 0,
            max_instances: 0,
            current_load: 0,
            model_load: 0,
            active_instances: 0,
            xcode_load_pixel: 0,
            caps: [VideoCap::default(); CODEC_COUNT],
            instances: [InstanceSlot::default(); MAX_INSTANCES],
        }
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        DeviceType::from_u32(self.device_type)
    }

    pub fn set_device_path(&mut self, path: &str) {
        write_path(&mut self.device_path, path);
    }

    pub fn device_path(&self) -> &str {
        read_path(&self.device_path)
    }

    pub fn set_block_path(&mut self, path: &str) {
        write_path(&mut self.block_path, path);
    }

    pub fn block_path(&self) -> &str {
        read_path(&self.block_path)
    }

    pub fn device_path_matches(&self, path: &str) -> bool {
        self.device_path() == path
    }

    pub fn block_path_matches(&self, path: &str) -> bool {
        self.block_path() == path
    }

    pub fn fw_rev(&self) -> FirmwareRev {
        FirmwareRev(self.fw_rev)
    }

    pub fn set_fw(&mut self, rev: &FirmwareRev, compat_warning: bool) {
        self.fw_rev = rev.0;
        self.fw_compat_warning = u32::from(compat_warning);
    }

    pub fn supports(&self, codec: Codec) -> bool {
        self.caps[codec.index()].supported != 0
    }

    /// Folds one capability module into the record. A card reports one
    /// module per (engine, codec) pair; modules of the same engine share
    /// `hw_id` and instance limits.
    pub fn apply_module(&mut self, module: &ModuleCapability) {
        self.hw_id = module.hw_id;
        self.max_1080p_fps = module.max_1080p_fps;
        self.max_instances = module.max_instances;
        self.caps[module.codec.index()] = VideoCap {
            supported: 1,
            max_res_width: module.max_res.0,
            max_res_height: module.max_res.1,
            min_res_width: module.min_res.0,
            min_res_height: module.min_res.1,
        };
    }

    /// Replaces the load fields and the whole instance table with the
    /// result of a fresh query. Partial merges would let stale instances
    /// linger, so the table is always rewritten wholesale.
    pub fn apply_load(&mut self, query: &LoadQuery) {
        self.current_load = query.current_load;
        self.model_load = query.fw_model_load;
        self.active_instances = query.active_instances;
        self.instances = [InstanceSlot::default(); MAX_INSTANCES];
        for (slot, status) in self.instances.iter_mut().zip(query.instances.iter()) {
            *slot = InstanceSlot {
                id: status.id,
                active: u32::from(status.state == InstanceState::Active),
                codec: status.codec.index() as u32,
                width: status.width,
                height: status.height,
                fps: status.fps,
            };
        }
    }
}
