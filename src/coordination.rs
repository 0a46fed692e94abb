//! Shared coordination primitives for concurrently running events
//!
//! One [`CoordinationContext`] exists per supervisor run. Every event task
//! holds it by `Arc` and uses it for:
//!
//! - **Cancellation**: one-shot, cooperative, checked at every suspension point
//! - **Busy flag**: at most one caution-class procedure controls the field
//! - **Chat lock**: outbound chat sends never interleave
//! - **Outbound queues**: audio cues, broadcast titles and driver messages
//!
//! ```rust
//! use racecontrol::coordination::CoordinationContext;
//!
//! let (ctx, _queues) = CoordinationContext::new();
//! assert!(ctx.try_claim_busy("caution"));
//! assert!(!ctx.try_claim_busy("slow zone"));
//! assert!(!ctx.release_busy("slow zone"));
//! assert!(ctx.release_busy("caution"));
//! assert!(!ctx.is_busy());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::chat;
use crate::telemetry::TelemetryView;

/// How often a task waiting for the chat lock re-checks it
const CHAT_LOCK_POLL: Duration = Duration::from_millis(50);

/// Attempts made for critical admin commands
const DEFAULT_COMMAND_ATTEMPTS: u32 = 3;

/// Delay between attempts of a failed admin command
const COMMAND_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Why a suspension point woke up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Wake {
    /// The wait (or send) completed
    Elapsed,
    /// Cancellation was requested; the caller must stop
    Cancelled,
}

impl Wake {
    pub fn is_cancelled(self) -> bool {
        matches!(self, Wake::Cancelled)
    }
}

/// Return `SequenceOutcome::Cancelled` from the enclosing sequence when a
/// suspension point observed cancellation.
macro_rules! checkpoint {
    ($wake:expr) => {
        if $wake.is_cancelled() {
            return Ok($crate::events::SequenceOutcome::Cancelled);
        }
    };
}
pub(crate) use checkpoint;

/// Audio cue tokens for the audio consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCue {
    Caution,
    TrackClear,
    PitsClosing,
    SlowZone,
    GetReady,
    Green,
    Penalty,
}

impl AudioCue {
    pub fn token(self) -> &'static str {
        match self {
            AudioCue::Caution => "caution",
            AudioCue::TrackClear => "track_clear",
            AudioCue::PitsClosing => "pits_closing",
            AudioCue::SlowZone => "slow_zone",
            AudioCue::GetReady => "get_ready",
            AudioCue::Green => "green",
            AudioCue::Penalty => "penalty",
        }
    }
}

impl fmt::Display for AudioCue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Title and text for broadcast overlays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub title: String,
    pub text: String,
}

/// Receiving ends of the outbound queues, one consumer each
pub struct OutboundQueues {
    pub audio: mpsc::UnboundedReceiver<AudioCue>,
    pub broadcast: mpsc::UnboundedReceiver<BroadcastMessage>,
    pub driver: mpsc::UnboundedReceiver<String>,
}

/// Shared state for one supervisor run
pub struct CoordinationContext {
    cancel: CancellationToken,
    busy: AtomicBool,
    busy_holder: StdMutex<Option<String>>,
    chat: Mutex<()>,
    command_attempts: u32,
    audio_tx: mpsc::UnboundedSender<AudioCue>,
    broadcast_tx: mpsc::UnboundedSender<BroadcastMessage>,
    driver_tx: mpsc::UnboundedSender<String>,
}

impl CoordinationContext {
    /// Create a context and the receivers for its outbound queues
    pub fn new() -> (Arc<Self>, OutboundQueues) {
        let (audio_tx, audio) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast) = mpsc::unbounded_channel();
        let (driver_tx, driver) = mpsc::unbounded_channel();

        let ctx = Arc::new(Self {
            cancel: CancellationToken::new(),
            busy: AtomicBool::new(false),
            busy_holder: StdMutex::new(None),
            chat: Mutex::new(()),
            command_attempts: DEFAULT_COMMAND_ATTEMPTS,
            audio_tx,
            broadcast_tx,
            driver_tx,
        });
        (ctx, OutboundQueues { audio, broadcast, driver })
    }

    /// Request cancellation of every task sharing this context
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!("Race control cancellation requested");
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that fires when cancellation is requested
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether a caution-class procedure is in control of the field
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Name of the procedure holding the busy flag
    pub fn busy_holder(&self) -> Option<String> {
        self.busy_holder.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Atomically take the busy flag. Returns false if another procedure holds it.
    pub fn try_claim_busy(&self, holder: &str) -> bool {
        let claimed =
            self.busy.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok();
        if claimed {
            *self.busy_holder.lock().unwrap_or_else(|e| e.into_inner()) = Some(holder.to_string());
            debug!(holder, "Busy flag claimed");
        }
        claimed
    }

    /// Release the busy flag at the end of a completed procedure.
    /// Only the current holder releases it; returns whether it did.
    pub fn release_busy(&self, holder: &str) -> bool {
        let mut current = self.busy_holder.lock().unwrap_or_else(|e| e.into_inner());
        if current.as_deref() != Some(holder) {
            warn!(holder, current = ?*current, "Busy flag release by a non-holder ignored");
            return false;
        }
        current.take();
        self.busy.store(false, Ordering::SeqCst);
        debug!(holder, "Busy flag released");
        true
    }

    /// Operator action: clear a busy flag left behind by a failed procedure.
    /// Returns whether the flag was set.
    pub fn force_clear_busy(&self) -> bool {
        let holder = self.busy_holder.lock().unwrap_or_else(|e| e.into_inner()).take();
        let was_set = self.busy.swap(false, Ordering::SeqCst);
        if was_set {
            warn!(holder = ?holder, "Busy flag force cleared by operator");
        }
        was_set
    }

    /// Sleep for `duration` unless cancellation arrives first
    pub async fn sleep(&self, duration: Duration) -> Wake {
        if self.cancel.is_cancelled() {
            return Wake::Cancelled;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Wake::Cancelled,
            _ = tokio::time::sleep(duration) => {
                if self.cancel.is_cancelled() { Wake::Cancelled } else { Wake::Elapsed }
            }
        }
    }

    /// Send chat text through the chat lock.
    ///
    /// The lock is taken with a polling loop so a cancelled task never stays
    /// parked behind another sender. A failed send is logged and the caller
    /// carries on.
    pub async fn send_chat(&self, view: &dyn TelemetryView, text: &str, broadcast: bool) -> Wake {
        match self.send_chat_checked(view, text, broadcast).await {
            Some(_) => Wake::Elapsed,
            None => Wake::Cancelled,
        }
    }

    /// Send an admin command, retrying failed sends.
    pub async fn send_command(&self, view: &dyn TelemetryView, command: &str) -> Wake {
        for attempt in 1..=self.command_attempts {
            match self.send_chat_checked(view, command, false).await {
                None => return Wake::Cancelled,
                Some(true) => return Wake::Elapsed,
                Some(false) if attempt < self.command_attempts => {
                    if self.sleep(COMMAND_RETRY_DELAY).await.is_cancelled() {
                        return Wake::Cancelled;
                    }
                }
                Some(false) => {
                    error!(command, attempts = self.command_attempts, "Giving up on command");
                }
            }
        }
        Wake::Elapsed
    }

    /// Message one driver in chat and mirror it to the driver queue
    pub async fn send_direct(
        &self,
        view: &dyn TelemetryView,
        car_number: &str,
        text: &str,
    ) -> Wake {
        self.enqueue_driver(format!("#{}: {}", car_number, text));
        self.send_chat(view, &chat::direct(car_number, text), false).await
    }

    /// Returns `None` when cancelled, otherwise whether the send succeeded
    async fn send_chat_checked(
        &self,
        view: &dyn TelemetryView,
        text: &str,
        broadcast: bool,
    ) -> Option<bool> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Ok(_guard) = self.chat.try_lock() {
                trace!(text, broadcast, "Sending chat");
                return match view.send_chat(text, broadcast).await {
                    Ok(()) => Some(true),
                    Err(e) => {
                        error!(text, "Chat send failed: {}", e);
                        Some(false)
                    }
                };
            }
            if self.sleep(CHAT_LOCK_POLL).await.is_cancelled() {
                return None;
            }
        }
    }

    pub fn enqueue_audio(&self, cue: AudioCue) {
        if self.audio_tx.send(cue).is_err() {
            debug!(%cue, "Audio queue has no consumer");
        }
    }

    pub fn enqueue_broadcast(&self, title: impl Into<String>, text: impl Into<String>) {
        let message = BroadcastMessage { title: title.into(), text: text.into() };
        if self.broadcast_tx.send(message).is_err() {
            debug!("Broadcast queue has no consumer");
        }
    }

    pub fn enqueue_driver(&self, text: impl Into<String>) {
        if self.driver_tx.send(text.into()).is_err() {
            debug!("Driver queue has no consumer");
        }
    }
}
