//! Constants for interpreting IRSDK bitfields
//!
//! SessionFlags and CarIdxPaceFlags values from the iRacing SDK, plus the
//! slow zone bit that telemetry providers raise on their own.

// Global session flags
pub mod session_flags {
    pub const CHECKERED: u32 = 0x0000_0001; // irsdk_checkered
    pub const WHITE: u32 = 0x0000_0002; // irsdk_white
    pub const GREEN: u32 = 0x0000_0004; // irsdk_green
    pub const YELLOW: u32 = 0x0000_0008; // irsdk_yellow
    pub const RED: u32 = 0x0000_0010; // irsdk_red
    pub const ONE_LAP_TO_GREEN: u32 = 0x0000_0200; // irsdk_oneLapToGreen
    pub const GREEN_HELD: u32 = 0x0000_0400; // irsdk_greenHeld
    pub const CAUTION: u32 = 0x0000_4000; // irsdk_caution
    pub const CAUTION_WAVING: u32 = 0x0000_8000; // irsdk_cautionWaving

    // Not an SDK flag. Providers set it while a slow zone is being run.
    pub const SLOW_ZONE: u32 = 0x8000_0000;
}

// Per-car pace flags (CarIdxPaceFlags)
pub mod pace_flags {
    pub const END_OF_LINE: u32 = 0x0001; // irsdk_PaceFlagsEndOfLine
    pub const FREE_PASS: u32 = 0x0002; // irsdk_PaceFlagsFreePass
    pub const WAVED_AROUND: u32 = 0x0004; // irsdk_PaceFlagsWavedAround
}
