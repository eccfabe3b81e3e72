use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{spawn_stage, CancelHandle, ChannelStream, DEFAULT_STAGE_BUFFER};
use crate::types::StreamChunk;

/// Upper bound for the per-chunk replay delay.
pub const MAX_CHUNK_DELAY: Duration = Duration::from_millis(100);

/// Delays applied while replaying. Values above [`MAX_CHUNK_DELAY`] are
/// clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayPacing {
    pub initial_delay_ms: u64,
    pub chunk_delay_ms: u64,
}

impl Default for ReplayPacing {
    fn default() -> Self {
        Self {
            initial_delay_ms: 0,
            chunk_delay_ms: 8,
        }
    }
}

impl ReplayPacing {
    pub fn new(chunk_delay: Duration) -> Self {
        Self {
            initial_delay_ms: 0,
            chunk_delay_ms: chunk_delay.as_millis() as u64,
        }
    }

    /// No delays at all.
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            chunk_delay_ms: 0,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms).min(MAX_CHUNK_DELAY)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms).min(MAX_CHUNK_DELAY)
    }
}

/// Reconstructs a paced stream from recorded chunks.
#[derive(Debug, Clone, Default)]
pub struct StreamReplayer {
    pacing: ReplayPacing,
}

impl StreamReplayer {
    pub fn new(pacing: ReplayPacing) -> Self {
        Self { pacing }
    }

    pub fn pacing(&self) -> ReplayPacing {
        self.pacing
    }

    /// Emit `chunks` in order, each after the configured delay. Embedded
    /// generation timestamps are replaced with the time of emission.
    pub fn replay(&self, chunks: Vec<StreamChunk>, cancel: &CancelHandle) -> ChannelStream<StreamChunk> {
        let initial = self.pacing.initial_delay();
        let delay = self.pacing.chunk_delay();
        spawn_stage(cancel, DEFAULT_STAGE_BUFFER, move |out| async move {
            let total = chunks.len();
            if !out.pause(initial).await {
                return;
            }
            for (i, mut chunk) in chunks.into_iter().enumerate() {
                if !out.pause(delay).await {
                    debug!(emitted = i, total, "replay stopped");
                    return;
                }
                chunk.restamp(Utc::now());
                if !out.emit(Ok(chunk)).await {
                    debug!(emitted = i, total, "replay stopped");
                    return;
                }
            }
            debug!(total, "replay complete");
        })
    }
}
