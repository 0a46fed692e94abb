//! BitField type for handling iRacing bitfield variables

use serde::{Deserialize, Serialize};

use super::irsdk_flags::{pace_flags, session_flags};

/// BitField type for handling iRacing bitfield variables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BitField(pub u32);

impl BitField {
    /// Create a new BitField from a u32 value.
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Check if a specific bit is set.
    pub fn is_set(&self, bit: u32) -> bool {
        (self.0 & (1 << bit)) != 0
    }

    /// Check if a specific flag is set using a bitmask.
    pub fn has_flag(&self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }

    /// Return a copy with the given mask set.
    pub fn with_flag(self, flag: u32) -> Self {
        Self(self.0 | flag)
    }

    /// Get the raw u32 value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Convenience: any full course caution bit (caution or caution waving)
pub fn caution_active(flags: BitField) -> bool {
    flags.has_flag(session_flags::CAUTION | session_flags::CAUTION_WAVING)
}

/// Convenience: the provider reports a slow zone in effect
pub fn slow_zone_active(flags: BitField) -> bool {
    flags.has_flag(session_flags::SLOW_ZONE)
}

/// Convenience: the checkered flag is out
pub fn checkered(flags: BitField) -> bool {
    flags.has_flag(session_flags::CHECKERED)
}

/// Convenience: the car has already been granted a wave around
pub fn waved_around(flags: BitField) -> bool {
    flags.has_flag(pace_flags::WAVED_AROUND)
}
