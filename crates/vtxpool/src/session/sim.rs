//! In-memory card simulator.
//!
//! Backs the CLI demo mode and the test suite. A fixture describes a set of
//! cards; the simulator answers capability and load queries from that state
//! and lets tests mutate it between calls to model load changes, new
//! sessions and hot-unplug.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::{
    DeviceCapability, DeviceSession, FirmwareRev, InstanceState, InstanceStatus, LoadQuery,
    ModuleCapability, SessionError, SessionHandle,
};
use crate::types::{Codec, DeviceType};

fn default_fw_rev() -> String {
    "259r1E09".to_string()
}

fn default_codecs() -> Vec<Codec> {
    vec![Codec::H264, Codec::H265]
}

fn default_max_1080p_fps() -> i32 {
    240
}

fn default_max_instances() -> u32 {
    32
}

fn default_is_transcoder() -> bool {
    true
}

/// One simulated transcoding instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimInstance {
    pub id: i32,
    pub device_type: DeviceType,
    pub codec: Codec,
    pub width: i32,
    pub height: i32,
    pub fps: i32,
}

/// One simulated card. Serialized form doubles as the CLI fixture format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimDevice {
    pub device_path: PathBuf,
    #[serde(default = "default_is_transcoder")]
    pub is_transcoder: bool,
    #[serde(default = "default_fw_rev")]
    pub fw_rev: String,
    #[serde(default = "default_codecs")]
    pub codecs: Vec<Codec>,
    #[serde(default = "default_max_1080p_fps")]
    pub max_1080p_fps: i32,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    /// Base hardware id; the decoder engine reports it, the encoder
    /// engine reports it plus one.
    #[serde(default)]
    pub hw_id_base: i32,
    #[serde(default)]
    pub decoder_load: u32,
    #[serde(default)]
    pub encoder_load: u32,
    #[serde(default)]
    pub encoder_model_load: u32,
    #[serde(default)]
    pub instances: Vec<SimInstance>,
}

impl SimDevice {
    pub fn new(device_path: impl Into<PathBuf>) -> Self {
        SimDevice {
            device_path: device_path.into(),
            is_transcoder: true,
            fw_rev: default_fw_rev(),
            codecs: default_codecs(),
            max_1080p_fps: default_max_1080p_fps(),
            max_instances: default_max_instances(),
            hw_id_base: 0,
            decoder_load: 0,
            encoder_load: 0,
            encoder_model_load: 0,
            instances: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    devices: HashMap<PathBuf, SimDevice>,
}

/// Simulated session factory. Cheap to clone, all clones share state.
#[derive(Debug, Clone, Default)]
pub struct SimSession {
    state: Arc<Mutex<SimState>>,
}

impl SimSession {
    pub fn new(devices: Vec<SimDevice>) -> Self {
        let mut map = HashMap::new();
        for dev in devices {
            map.insert(dev.device_path.clone(), dev);
        }
        SimSession {
            state: Arc::new(Mutex::new(SimState { devices: map })),
        }
    }

    /// Loads a JSON fixture: an array of [`SimDevice`] objects.
    pub fn from_json_file(path: &Path) -> Result<Self, SessionError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| SessionError(format!("read fixture {}: {e}", path.display())))?;
        let devices: Vec<SimDevice> = serde_json::from_str(&data)
            .map_err(|e| SessionError(format!("parse fixture {}: {e}", path.display())))?;
        Ok(Self::new(devices))
    }

    pub fn insert_device(&self, dev: SimDevice) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.devices.insert(dev.device_path.clone(), dev);
    }

    /// Simulates hot-unplug: subsequent opens against the path fail.
    pub fn remove_device(&self, path: &Path) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.devices.remove(path);
    }

    pub fn device_paths(&self) -> Vec<PathBuf> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.devices.keys().cloned().collect()
    }

    pub fn set_load(&self, path: &Path, device_type: DeviceType, load: u32) {
        self.with_device(path, |dev| match device_type {
            DeviceType::Decoder => dev.decoder_load = load,
            DeviceType::Encoder => dev.encoder_load = load,
        });
    }

    pub fn set_encoder_model_load(&self, path: &Path, load: u32) {
        self.with_device(path, |dev| dev.encoder_model_load = load);
    }

    /// Models swapping the card in a slot for one with different engines.
    pub fn set_hw_id_base(&self, path: &Path, base: i32) {
        self.with_device(path, |dev| dev.hw_id_base = base);
    }

    pub fn push_instance(&self, path: &Path, inst: SimInstance) {
        self.with_device(path, |dev| dev.instances.push(inst));
    }

    pub fn clear_instances(&self, path: &Path) {
        self.with_device(path, |dev| dev.instances.clear());
    }

    fn with_device(&self, path: &Path, f: impl FnOnce(&mut SimDevice)) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(dev) = state.devices.get_mut(path) {
            f(dev);
        }
    }
}

impl DeviceSession for SimSession {
    fn open(
        &self,
        device_path: &Path,
        _block_path: &Path,
    ) -> Result<Box<dyn SessionHandle>, SessionError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.devices.contains_key(device_path) {
            return Err(SessionError(format!(
                "no such device: {}",
                device_path.display()
            )));
        }
        Ok(Box::new(SimHandle {
            state: Arc::clone(&self.state),
            device_path: device_path.to_path_buf(),
        }))
    }
}

struct SimHandle {
    state: Arc<Mutex<SimState>>,
    device_path: PathBuf,
}

impl SimHandle {
    fn snapshot(&self) -> Result<SimDevice, SessionError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .devices
            .get(&self.device_path)
            .cloned()
            .ok_or_else(|| {
                SessionError(format!("device gone: {}", self.device_path.display()))
            })
    }
}

impl SessionHandle for SimHandle {
    fn capability_query(&self) -> Result<DeviceCapability, SessionError> {
        let dev = self.snapshot()?;
        let mut modules = Vec::new();
        // One decoder engine and one encoder engine per card, each able to
        // run every codec the fixture lists.
        for device_type in [DeviceType::Decoder, DeviceType::Encoder] {
            let hw_id = dev.hw_id_base + device_type.as_u32() as i32;
            for codec in &dev.codecs {
                modules.push(ModuleCapability {
                    hw_id,
                    device_type,
                    codec: *codec,
                    max_1080p_fps: dev.max_1080p_fps,
                    max_instances: dev.max_instances,
                    max_res: (8192, 8192),
                    min_res: (64, 64),
                });
            }
        }
        Ok(DeviceCapability {
            is_transcoder: dev.is_transcoder,
            fw_rev: FirmwareRev::from_str_padded(&dev.fw_rev),
            modules,
        })
    }

    fn load_query(&self, device_type: DeviceType) -> Result<LoadQuery, SessionError> {
        let dev = self.snapshot()?;
        let instances: Vec<InstanceStatus> = dev
            .instances
            .iter()
            .filter(|i| i.device_type == device_type)
            .map(|i| InstanceStatus {
                id: i.id,
                state: InstanceState::Active,
                codec: i.codec,
                width: i.width,
                height: i.height,
                fps: i.fps,
            })
            .collect();
        let (current_load, fw_model_load) = match device_type {
            DeviceType::Decoder => (dev.decoder_load, 0),
            DeviceType::Encoder => (dev.encoder_load, dev.encoder_model_load),
        };
        Ok(LoadQuery {
            current_load,
            fw_model_load,
            active_instances: instances.len() as u32,
            instances,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_fails_after_removal() {
        let sim = SimSession::new(vec![SimDevice::new("/tmp/simdev0")]);
        assert!(sim.open(Path::new("/tmp/simdev0"), Path::new("/tmp/simdev0n1")).is_ok());

        sim.remove_device(Path::new("/tmp/simdev0"));
        assert!(sim.open(Path::new("/tmp/simdev0"), Path::new("/tmp/simdev0n1")).is_err());
    }

    #[test]
    fn load_query_splits_instances_by_engine() {
        let sim = SimSession::new(vec![SimDevice::new("/tmp/simdev1")]);
        sim.push_instance(
            Path::new("/tmp/simdev1"),
            SimInstance {
                id: 0,
                device_type: DeviceType::Encoder,
                codec: Codec::H264,
                width: 1920,
                height: 1080,
                fps: 30,
            },
        );

        let handle = sim
            .open(Path::new("/tmp/simdev1"), Path::new("/tmp/simdev1n1"))
            .unwrap();
        let enc = handle.load_query(DeviceType::Encoder).unwrap();
        let dec = handle.load_query(DeviceType::Decoder).unwrap();
        assert_eq!(enc.active_instances, 1);
        assert_eq!(dec.active_instances, 0);
    }

    #[test]
    fn fixture_round_trip() {
        let dev = SimDevice::new("/tmp/simdev2");
        let json = serde_json::to_string(&vec![dev]).unwrap();
        let parsed: Vec<SimDevice> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0].device_path, PathBuf::from("/tmp/simdev2"));
        assert_eq!(parsed[0].fw_rev, "259r1E09");
    }
}
