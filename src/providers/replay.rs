//! Replay provider for recorded session timelines

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::telemetry::TelemetryView;
use crate::types::TelemetrySnapshot;
use crate::{RaceControlError, Result};

/// One chat send recorded by [`ReplayTelemetry`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentChat {
    pub text: String,
    pub broadcast: bool,
}

/// Replay provider that serves a recorded timeline of snapshots
///
/// Frames are served at playback speed against the tokio clock: a read
/// returns the latest frame whose session time (relative to the first frame)
/// has been reached. Once the timeline is exhausted the last frame repeats.
/// Every chat send is recorded for later inspection.
pub struct ReplayTelemetry {
    /// Frames ordered by session time
    frames: Vec<TelemetrySnapshot>,

    /// Playback clock origin
    origin: Instant,

    /// Playback speed multiplier (1.0 = normal)
    speed: f64,

    /// Recorded chat sends
    sent: Mutex<Vec<SentChat>>,

    /// Prefixes of sends that should fail, consumed one per failure
    failures: Mutex<VecDeque<String>>,
}

impl ReplayTelemetry {
    /// Create a replay from recorded frames
    pub fn new(mut frames: Vec<TelemetrySnapshot>) -> Result<Self> {
        if frames.is_empty() {
            return Err(RaceControlError::telemetry_unavailable("Replay timeline has no frames"));
        }
        frames.sort_by(|a, b| a.session_time_elapsed.total_cmp(&b.session_time_elapsed));

        info!(
            frames = frames.len(),
            duration =
                frames[frames.len() - 1].session_time_elapsed - frames[0].session_time_elapsed,
            "Replay timeline loaded"
        );

        Ok(Self {
            frames,
            origin: Instant::now(),
            speed: 1.0,
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
        })
    }

    /// Parse a YAML list of snapshots
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let frames: Vec<TelemetrySnapshot> = serde_yaml_ng::from_str(yaml)?;
        Self::new(frames)
    }

    /// Load a YAML timeline from disk
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| RaceControlError::file_error(path.to_path_buf(), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Set playback speed
    pub fn set_speed(&mut self, speed: f64) {
        self.speed = speed.clamp(0.1, 100.0);
        debug!("Playback speed set to {}x", self.speed);
    }

    /// Make the next send whose text starts with `prefix` fail
    pub fn fail_next_send(&self, prefix: impl Into<String>) {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).push_back(prefix.into());
    }

    /// All chat sends so far, in order
    pub fn sent_messages(&self) -> Vec<SentChat> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of successful sends whose text starts with `prefix`
    pub fn count_sent(&self, prefix: &str) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|chat| chat.text.starts_with(prefix))
            .count()
    }

    /// Current playback position in session seconds past the first frame
    pub fn position(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * self.speed
    }

    fn frame_at(&self, position: f64) -> &TelemetrySnapshot {
        let base = self.frames[0].session_time_elapsed;
        let reached =
            self.frames.partition_point(|frame| frame.session_time_elapsed - base <= position);
        &self.frames[reached.saturating_sub(1)]
    }
}

#[async_trait::async_trait]
impl TelemetryView for ReplayTelemetry {
    async fn snapshot(&self) -> Result<TelemetrySnapshot> {
        let position = self.position();
        let frame = self.frame_at(position);
        trace!(position, session_time = frame.session_time_elapsed, "Replay frame");
        Ok(frame.clone())
    }

    async fn send_chat(&self, text: &str, broadcast: bool) -> Result<()> {
        {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            let matched = failures.iter().position(|prefix| text.starts_with(prefix.as_str()));
            if let Some(index) = matched {
                failures.remove(index);
                return Err(RaceControlError::chat_failed(text, "injected replay failure"));
            }
        }

        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentChat { text: text.to_string(), broadcast });
        Ok(())
    }
}
