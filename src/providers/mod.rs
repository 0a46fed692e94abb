//! Telemetry providers
//!
//! - [`ReplayTelemetry`] plays back a recorded timeline at playback speed
//! - [`ChannelTelemetry`] bridges to a live simulator process over channels

pub mod channel;
pub mod replay;

pub use channel::{ChannelTelemetry, ChatRequest, TelemetryFeed};
pub use replay::{ReplayTelemetry, SentChat};
