//! Device session seam.
//!
//! The pool never talks NVMe itself; it goes through [`DeviceSession`] to
//! open a card and run capability and load queries against it. Production
//! integrations implement the trait over their transport, tests and the CLI
//! use the in-memory [`sim::SimSession`].

pub mod sim;

use std::path::Path;

use thiserror::Error;

use crate::types::{Codec, DeviceType};

#[derive(Error, Debug)]
#[error("{0}")]
pub struct SessionError(pub String);

/// Eight-byte firmware revision as reported by the card.
///
/// Layout: three release bytes, one separator byte, two API flavor bytes,
/// two API version bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareRev(pub [u8; 8]);

impl FirmwareRev {
    pub fn from_str_padded(s: &str) -> Self {
        let mut raw = [0u8; 8];
        let bytes = s.as_bytes();
        let n = bytes.len().min(8);
        raw[..n].copy_from_slice(&bytes[..n]);
        FirmwareRev(raw)
    }

    pub fn release(&self) -> &[u8] {
        &self.0[..3]
    }

    pub fn api_flavor(&self) -> &[u8] {
        &self.0[4..6]
    }

    pub fn api_version(&self) -> Option<u32> {
        std::str::from_utf8(&self.0[6..8])
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn as_display(&self) -> String {
        String::from_utf8_lossy(&self.0)
            .trim_end_matches('\0')
            .to_string()
    }
}

/// One hardware engine advertised by a card, for one codec.
#[derive(Debug, Clone)]
pub struct ModuleCapability {
    /// Engine ordinal on the card. Modules for the same physical engine
    /// share it across codecs.
    pub hw_id: i32,
    pub device_type: DeviceType,
    pub codec: Codec,
    /// Throughput reference in 1080p frames per second.
    pub max_1080p_fps: i32,
    pub max_instances: u32,
    pub max_res: (i32, i32),
    pub min_res: (i32, i32),
}

/// Full capability report of one card.
#[derive(Debug, Clone)]
pub struct DeviceCapability {
    pub is_transcoder: bool,
    pub fw_rev: FirmwareRev,
    pub modules: Vec<ModuleCapability>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Idle,
    Active,
}

/// Live transcoding instance as reported by a load query.
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub id: i32,
    pub state: InstanceState,
    pub codec: Codec,
    pub width: i32,
    pub height: i32,
    pub fps: i32,
}

/// Load report for one engine of a card.
#[derive(Debug, Clone, Default)]
pub struct LoadQuery {
    /// Measured utilization, percent.
    pub current_load: u32,
    /// Firmware's own load model, percent. Only meaningful for encoders.
    pub fw_model_load: u32,
    pub active_instances: u32,
    pub instances: Vec<InstanceStatus>,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        InstanceStatus {
            id: -1,
            state: InstanceState::Idle,
            codec: Codec::H264,
            width: 0,
            height: 0,
            fps: 0,
        }
    }
}

/// An open session against one card.
pub trait SessionHandle {
    fn capability_query(&self) -> Result<DeviceCapability, SessionError>;

    fn load_query(&self, device_type: DeviceType) -> Result<LoadQuery, SessionError>;
}

/// Factory for card sessions, keyed by device paths.
pub trait DeviceSession: Send + Sync {
    fn open(
        &self,
        device_path: &Path,
        block_path: &Path,
    ) -> Result<Box<dyn SessionHandle>, SessionError>;
}
