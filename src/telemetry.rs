//! Telemetry contract consumed by race control

use tracing::warn;

use crate::Result;
use crate::types::TelemetrySnapshot;

/// Trait for telemetry and actuation sources
///
/// Implementations sit between race control and the simulator: they produce
/// consistent snapshots of session state and deliver chat text. Reading the
/// simulator and typing into its chat window are entirely their concern.
#[async_trait::async_trait]
pub trait TelemetryView: Send + Sync + 'static {
    /// Read the current session state
    ///
    /// Returns:
    /// - `Ok(snapshot)` - Snapshot for the latest tick
    /// - `Err(e)` - Telemetry could not be read
    async fn snapshot(&self) -> Result<TelemetrySnapshot>;

    /// Send chat text to the session
    ///
    /// `broadcast` is true for text meant for the whole field. Admin commands
    /// and driver-directed messages are sent with `broadcast` false. Delivery
    /// has real-world latency and may fail; callers log and decide on retry.
    async fn send_chat(&self, text: &str, broadcast: bool) -> Result<()>;

    /// Hold the telemetry buffer so several reads come from the same tick
    async fn freeze(&self) -> Result<()> {
        Ok(())
    }

    /// Release a buffer held by [`freeze`](Self::freeze)
    async fn unfreeze(&self) -> Result<()> {
        Ok(())
    }
}

/// Take one consistent snapshot: freeze, read, unfreeze.
///
/// Unfreeze is attempted even when the read fails, so a provider is never
/// left frozen by a failed tick.
pub async fn capture(view: &dyn TelemetryView) -> Result<TelemetrySnapshot> {
    view.freeze().await?;
    let snapshot = view.snapshot().await;
    if let Err(e) = view.unfreeze().await {
        warn!("Failed to unfreeze telemetry: {}", e);
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RaceControlError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingView {
        freezes: AtomicU32,
        unfreezes: AtomicU32,
        fail_reads: bool,
    }

    #[async_trait::async_trait]
    impl TelemetryView for CountingView {
        async fn snapshot(&self) -> Result<TelemetrySnapshot> {
            if self.fail_reads {
                return Err(RaceControlError::telemetry_unavailable("no frame"));
            }
            Ok(TelemetrySnapshot::default())
        }

        async fn send_chat(&self, _text: &str, _broadcast: bool) -> Result<()> {
            Ok(())
        }

        async fn freeze(&self) -> Result<()> {
            self.freezes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn unfreeze(&self) -> Result<()> {
            self.unfreezes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn capture_brackets_read_with_freeze() {
        let view = CountingView::default();
        capture(&view).await.expect("snapshot");
        assert_eq!(view.freezes.load(Ordering::SeqCst), 1);
        assert_eq!(view.unfreezes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn capture_unfreezes_after_failed_read() {
        let view = CountingView { fail_reads: true, ..Default::default() };
        assert!(capture(&view).await.is_err());
        assert_eq!(view.unfreezes.load(Ordering::SeqCst), 1);
    }
}
