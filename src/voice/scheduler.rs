//! Gapless playback scheduling for inbound agent audio
//!
//! Chunks arrive in bursts and in arbitrary sizes. Each one is placed
//! directly after the previous one on the output device's clock, so the
//! agent's speech plays back without gaps or overlaps. An interruption
//! cancels everything in flight at once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::codec::{self, WireChunk};
use super::playback::{OutputDevice, PlaybackHandle, PlaybackNotice, ScheduledBuffer};

/// Owns the playback cursor and the set of in-flight handles
///
/// All mutation goes through `&mut self`, so the cursor and the handle set
/// always change together.
pub struct PlaybackScheduler {
    device: Arc<dyn OutputDevice>,
    cursor: Duration,
    active: HashSet<PlaybackHandle>,
    next_handle: u64,
    notice_tx: mpsc::UnboundedSender<PlaybackNotice>,
    notice_rx: mpsc::UnboundedReceiver<PlaybackNotice>,
}

impl PlaybackScheduler {
    /// Create a scheduler driving `device`
    #[must_use]
    pub fn new(device: Arc<dyn OutputDevice>) -> Self {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        Self {
            device,
            cursor: Duration::ZERO,
            active: HashSet::new(),
            next_handle: 0,
            notice_tx,
            notice_rx,
        }
    }

    /// Earliest start time for the next buffer
    #[must_use]
    pub const fn cursor(&self) -> Duration {
        self.cursor
    }

    /// Number of buffers pending or playing
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Whether a handle is still in flight
    #[must_use]
    pub fn is_active(&self, handle: PlaybackHandle) -> bool {
        self.active.contains(&handle)
    }

    /// Decode a chunk and schedule it right after everything already queued
    ///
    /// Malformed chunks are logged and dropped without touching the cursor.
    /// A device refusal drops only this chunk.
    pub fn enqueue(&mut self, chunk: &WireChunk) -> Option<PlaybackHandle> {
        let frame = match codec::decode(chunk) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, mime = %chunk.mime_type, "dropping malformed audio chunk");
                return None;
            }
        };

        let start_at = self.cursor.max(self.device.now());
        let duration = frame.duration();

        self.next_handle += 1;
        let handle = PlaybackHandle(self.next_handle);

        let buffer = ScheduledBuffer {
            handle,
            frame,
            start_at,
            notify: self.notice_tx.clone(),
        };

        if let Err(e) = self.device.play(buffer) {
            tracing::warn!(%handle, error = %e, "output device rejected buffer");
            return None;
        }

        self.active.insert(handle);
        self.cursor = start_at + duration;

        tracing::trace!(
            %handle,
            start_ms = start_at.as_millis(),
            duration_ms = duration.as_millis(),
            "scheduled playback"
        );

        Some(handle)
    }

    /// Stop everything in flight and reset the cursor to zero
    ///
    /// The next chunk then starts at the device's current time because
    /// scheduling always takes the later of the cursor and now.
    pub fn interrupt(&mut self) {
        let stopped = self.active.len();
        for handle in self.active.drain() {
            self.device.stop(handle);
        }
        self.cursor = Duration::ZERO;

        tracing::debug!(stopped, "playback interrupted");
    }

    /// Apply a device notice
    pub fn handle_notice(&mut self, notice: &PlaybackNotice) {
        match notice {
            PlaybackNotice::Finished(handle) => {
                self.active.remove(handle);
            }
            PlaybackNotice::Failed { handle, detail } => {
                if self.active.remove(handle) {
                    tracing::warn!(%handle, detail, "playback failed");
                }
            }
        }
    }

    /// Wait for the next device notice
    ///
    /// Never returns `None` while the scheduler exists, since it holds a
    /// sender itself.
    pub async fn next_notice(&mut self) -> Option<PlaybackNotice> {
        self.notice_rx.recv().await
    }

    /// Apply every notice that has already arrived
    pub fn drain_notices(&mut self) {
        while let Ok(notice) = self.notice_rx.try_recv() {
            self.handle_notice(&notice);
        }
    }
}

impl std::fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("cursor", &self.cursor)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}
