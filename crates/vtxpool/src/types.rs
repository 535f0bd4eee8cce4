//! Core identifiers and enums shared across the pool.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Pool-wide ordinal of a registered device engine. Dense, reused after
/// removal, never tied to an enumeration index.
pub type Guid = i32;

pub const INVALID_GUID: Guid = -1;

/// Upper bound of cards tracked per pool.
pub const MAX_DEVICES: usize = 64;

/// Upper bound of concurrent transcoding instances per hardware engine.
pub const MAX_INSTANCES: usize = 32;

/// Fixed capacity of the path fields inside shared records, including the
/// trailing NUL.
pub const MAX_PATH_LEN: usize = 32;

/// The two engine flavors each card exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Decoder,
    Encoder,
}

impl DeviceType {
    /// Single-character tag used in shared memory and lock file names.
    pub fn tag(self) -> char {
        match self {
            DeviceType::Decoder => 'd',
            DeviceType::Encoder => 'e',
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            DeviceType::Decoder => 0,
            DeviceType::Encoder => 1,
        }
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(DeviceType::Decoder),
            1 => Some(DeviceType::Encoder),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Decoder => write!(f, "decoder"),
            DeviceType::Encoder => write!(f, "encoder"),
        }
    }
}

/// Codecs the hardware engines may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
    Vp9,
    Jpeg,
    Av1,
}

pub const CODEC_COUNT: usize = 5;

impl Codec {
    pub const ALL: [Codec; CODEC_COUNT] =
        [Codec::H264, Codec::H265, Codec::Vp9, Codec::Jpeg, Codec::Av1];

    pub fn index(self) -> usize {
        match self {
            Codec::H264 => 0,
            Codec::H265 => 1,
            Codec::Vp9 => 2,
            Codec::Jpeg => 3,
            Codec::Av1 => 4,
        }
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        Self::ALL.get(idx).copied()
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
            Codec::Vp9 => "vp9",
            Codec::Jpeg => "jpeg",
            Codec::Av1 => "av1",
        };
        write!(f, "{name}")
    }
}

/// Strategy used by automatic allocation to pick among live devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocRule {
    /// Pick the engine with the lowest reported load. Encoders compare the
    /// firmware model load, decoders the measured load.
    LeastLoad,
    /// Pick the engine with the fewest active instances.
    LeastInstances,
}

/// Outcome of the firmware compatibility check performed at probe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwCompat {
    /// Wrong API flavor or API version below the minimum. The device is
    /// skipped entirely.
    Incompatible,
    /// API level is fine but the release revision predates the current one;
    /// usable, flagged with a warning.
    CoreCompatible,
    FullyCompatible,
}
