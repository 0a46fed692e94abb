//! Channel provider bridging to a live simulator process

use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};

use crate::telemetry::TelemetryView;
use crate::types::TelemetrySnapshot;
use crate::{RaceControlError, Result};

/// A chat send requested by race control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub text: String,
    pub broadcast: bool,
}

/// The simulator side of a [`ChannelTelemetry`]
///
/// Whoever owns the simulator connection publishes snapshots into `snapshots`
/// and types every request received on `chat` into the session.
pub struct TelemetryFeed {
    pub snapshots: watch::Sender<Option<Arc<TelemetrySnapshot>>>,
    pub chat: mpsc::Receiver<ChatRequest>,
}

/// Live provider fed by watch and mpsc channels
pub struct ChannelTelemetry {
    /// Latest published snapshot
    snapshots: watch::Receiver<Option<Arc<TelemetrySnapshot>>>,

    /// Outbound chat requests
    chat: mpsc::Sender<ChatRequest>,

    /// How long a read waits for the first snapshot
    first_frame_timeout: Duration,
}

impl ChannelTelemetry {
    /// Create a provider and the feed that drives it
    pub fn new(chat_capacity: usize) -> (Self, TelemetryFeed) {
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let (chat_tx, chat_rx) = mpsc::channel(chat_capacity.max(1));

        let provider = Self {
            snapshots: snapshot_rx,
            chat: chat_tx,
            first_frame_timeout: Duration::from_secs(5),
        };
        (provider, TelemetryFeed { snapshots: snapshot_tx, chat: chat_rx })
    }

    /// Change how long reads wait for the first snapshot
    pub fn with_first_frame_timeout(mut self, timeout: Duration) -> Self {
        self.first_frame_timeout = timeout;
        self
    }

    /// Snapshot updates as a stream
    pub fn updates(&self) -> impl Stream<Item = Arc<TelemetrySnapshot>> + 'static {
        WatchStream::new(self.snapshots.clone()).filter_map(|opt| async move { opt })
    }
}

#[async_trait::async_trait]
impl TelemetryView for ChannelTelemetry {
    async fn snapshot(&self) -> Result<TelemetrySnapshot> {
        if let Some(snapshot) = self.snapshots.borrow().as_ref() {
            return Ok(snapshot.as_ref().clone());
        }

        debug!("No snapshot published yet, waiting for first frame");
        let mut rx = self.snapshots.clone();
        let waited = tokio::time::timeout(self.first_frame_timeout, rx.wait_for(|s| s.is_some()))
            .await
            .map_err(|_| {
                RaceControlError::telemetry_unavailable("Timed out waiting for first snapshot")
            })?;

        match waited {
            Ok(guard) => guard
                .as_ref()
                .map(|snapshot| snapshot.as_ref().clone())
                .ok_or_else(|| RaceControlError::telemetry_unavailable("Snapshot feed is empty")),
            Err(e) => Err(RaceControlError::telemetry_unavailable_with_source(
                "Snapshot feed closed",
                Box::new(e),
            )),
        }
    }

    async fn send_chat(&self, text: &str, broadcast: bool) -> Result<()> {
        let request = ChatRequest { text: text.to_string(), broadcast };
        self.chat.send(request).await.map_err(|_| {
            warn!("Chat receiver dropped");
            RaceControlError::chat_failed(text, "chat feed closed")
        })
    }
}
