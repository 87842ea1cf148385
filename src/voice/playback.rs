//! Gapless scheduling of inbound assistant audio.
//!
//! Chunks arrive with jitter; each one is placed on the output timeline at
//! `max(next_start_time, now)` and the cursor advances by the chunk's
//! duration, so consecutive chunks play back-to-back in arrival order and
//! nothing is ever scheduled in the past. An interruption stops everything
//! and resets the cursor to the `0.0` sentinel.

use async_trait::async_trait;

use super::audio::AudioBuffer;
use super::error::{Result, VoiceError};

/// Identifier of one scheduled buffer on an [`AudioOutput`].
pub type SourceId = u64;

/// Cursor value meaning "nothing scheduled yet".
pub const UNSCHEDULED: f64 = 0.0;

/// Output device timeline that can start buffers at precise times.
pub trait AudioOutput: Send {
    /// Current playback position of the device, in seconds.
    fn current_time(&self) -> f64;

    /// Start `buffer` at `start_at` seconds on the device timeline.
    fn start(&mut self, buffer: AudioBuffer, start_at: f64) -> Result<SourceId>;

    /// Stop a buffer whether it is playing or still pending.
    fn stop(&mut self, id: SourceId);

    /// Release the device. Later calls must be harmless.
    ///
    /// May block until the device is released; the session manager calls it
    /// on the blocking pool.
    fn close(&mut self);
}

/// Opens an [`AudioOutput`] for a new session.
#[async_trait]
pub trait AudioOutputFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn AudioOutput>>;
}

/// A buffer placed on the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start: f64,
    pub end: f64,
}

/// Scheduled buffers plus the `next_start_time` cursor.
pub struct PlaybackQueue {
    output: Box<dyn AudioOutput>,
    sources: Vec<ScheduledSource>,
    next_start_time: f64,
    closed: bool,
}

impl PlaybackQueue {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output,
            sources: Vec::new(),
            next_start_time: UNSCHEDULED,
            closed: false,
        }
    }

    /// Schedule `buffer` directly after whatever is already queued.
    pub fn enqueue(&mut self, buffer: AudioBuffer) -> Result<ScheduledSource> {
        if self.closed {
            return Err(VoiceError::audio_output("playback pipeline closed"));
        }

        let now = self.output.current_time();
        self.prune_finished(now);

        let start = self.next_start_time.max(now);
        let duration = buffer.duration();
        let id = self.output.start(buffer, start)?;
        let source = ScheduledSource {
            id,
            start,
            end: start + duration,
        };
        self.next_start_time = source.end;
        self.sources.push(source);
        Ok(source)
    }

    /// Stop every playing and pending buffer and reset the cursor.
    ///
    /// Returns how many buffers were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.sources.len();
        for source in self.sources.drain(..) {
            self.output.stop(source.id);
        }
        self.next_start_time = UNSCHEDULED;
        stopped
    }

    /// Flush playback and release the output device. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.interrupt();
        self.output.close();
        self.closed = true;
    }

    /// Buffers that have not finished yet.
    pub fn active_sources(&mut self) -> &[ScheduledSource] {
        if !self.closed {
            let now = self.output.current_time();
            self.prune_finished(now);
        }
        &self.sources
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn prune_finished(&mut self, now: f64) {
        self.sources.retain(|s| s.end > now);
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.close();
    }
}
