//! Core types for telemetry data representation.
//!
//! - [`TelemetrySnapshot`] is one consistent read of session and per-car state
//! - [`CarTelemetry`] is the per-car slice of a snapshot
//! - [`BitField`] handles iRacing's session and pace flag bitfields
//!
//! Snapshots are plain values: they are cloned into timelines, compared across
//! ticks and never mutated once read.

mod bitfield;
pub mod irsdk_flags;
mod snapshot;

pub use bitfield::{BitField, caution_active, checkered, slow_zone_active, waved_around};
pub use snapshot::{CarId, CarTelemetry, SessionState, TelemetrySnapshot};
