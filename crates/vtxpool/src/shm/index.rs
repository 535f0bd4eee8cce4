//! Pool index layout: the registry of guids currently in the pool.

use crate::types::{DeviceType, Guid, MAX_DEVICES};

/// Shared index of registered engines, one guid list per engine type.
///
/// Cards carry exactly one decoder and one encoder, so registration and
/// removal always touch both lists together and the counts stay in
/// lock-step. Guids are dense: the smallest unused value is handed out, and
/// values freed by removal are reused.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PoolIndex {
    decoder_cnt: u32,
    encoder_cnt: u32,
    decoders: [Guid; MAX_DEVICES],
    encoders: [Guid; MAX_DEVICES],
}

impl Default for PoolIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolIndex {
    pub fn new() -> Self {
        PoolIndex {
            decoder_cnt: 0,
            encoder_cnt: 0,
            decoders: [-1; MAX_DEVICES],
            encoders: [-1; MAX_DEVICES],
        }
    }

    pub fn count(&self, device_type: DeviceType) -> usize {
        match device_type {
            DeviceType::Decoder => self.decoder_cnt as usize,
            DeviceType::Encoder => self.encoder_cnt as usize,
        }
    }

    pub fn guids(&self, device_type: DeviceType) -> &[Guid] {
        match device_type {
            DeviceType::Decoder => &self.decoders[..self.decoder_cnt as usize],
            DeviceType::Encoder => &self.encoders[..self.encoder_cnt as usize],
        }
    }

    pub fn contains(&self, device_type: DeviceType, guid: Guid) -> bool {
        self.guids(device_type).contains(&guid)
    }

    /// Smallest non-negative guid not currently registered.
    pub fn next_free_guid(&self) -> Option<Guid> {
        if self.decoder_cnt as usize >= MAX_DEVICES {
            return None;
        }
        (0..MAX_DEVICES as Guid).find(|g| !self.contains(DeviceType::Decoder, *g))
    }

    /// Registers `guid` for both engine types. Returns false when the pool
    /// is full or the guid is already present.
    pub fn append_pair(&mut self, guid: Guid) -> bool {
        if self.decoder_cnt as usize >= MAX_DEVICES
            || self.contains(DeviceType::Decoder, guid)
        {
            return false;
        }
        self.decoders[self.decoder_cnt as usize] = guid;
        self.encoders[self.encoder_cnt as usize] = guid;
        self.decoder_cnt += 1;
        self.encoder_cnt += 1;
        true
    }

    /// Unregisters `guid` from both engine types, compacting the lists.
    pub fn remove_pair(&mut self, guid: Guid) -> bool {
        if !self.contains(DeviceType::Decoder, guid) {
            return false;
        }
        Self::remove_from(&mut self.decoders, &mut self.decoder_cnt, guid);
        Self::remove_from(&mut self.encoders, &mut self.encoder_cnt, guid);
        true
    }

    fn remove_from(list: &mut [Guid; MAX_DEVICES], cnt: &mut u32, guid: Guid) {
        let n = *cnt as usize;
        if let Some(pos) = list[..n].iter().position(|&g| g == guid) {
            list.copy_within(pos + 1..n, pos);
            list[n - 1] = -1;
            *cnt -= 1;
        }
    }

    /// Moves `guid` to the end of one type's list so repeated automatic
    /// allocation spreads across equally loaded engines.
    pub fn move_to_tail(&mut self, device_type: DeviceType, guid: Guid) {
        let (list, cnt) = match device_type {
            DeviceType::Decoder => (&mut self.decoders, self.decoder_cnt as usize),
            DeviceType::Encoder => (&mut self.encoders, self.encoder_cnt as usize),
        };
        if let Some(pos) = list[..cnt].iter().position(|&g| g == guid) {
            list.copy_within(pos + 1..cnt, pos);
            list[cnt - 1] = guid;
        }
    }
}
