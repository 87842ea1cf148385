//! Microphone capture seam.
//!
//! The audio subsystem calls a [`CaptureSink`] with fixed-size blocks of mono
//! float samples on its own cadence. The sink must not block: it encodes the
//! block and hands it to the outbound queue fire-and-forget.

use async_trait::async_trait;

use super::error::Result;

/// Receives one captured block of mono `f32` samples at 16kHz.
pub type CaptureSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// An acquired microphone.
pub trait InputStream: Send {
    /// Begin delivering blocks to `sink`.
    fn start(&mut self, sink: CaptureSink) -> Result<()>;

    /// Stop capture and release the device. Later calls must be harmless.
    ///
    /// May block until the device is released; the session manager calls it
    /// on the blocking pool.
    fn close(&mut self);
}

/// Grants exclusive access to a microphone.
#[async_trait]
pub trait AudioInput: Send + Sync {
    /// Acquire the device. Fails with [`VoiceError::Microphone`](super::VoiceError::Microphone)
    /// when permission is denied or no input device exists.
    async fn open(&self) -> Result<Box<dyn InputStream>>;
}

/// Regroups arbitrarily sized device callbacks into fixed-size blocks.
#[derive(Debug)]
pub struct BlockChunker {
    block_frames: usize,
    pending: Vec<f32>,
}

impl BlockChunker {
    pub fn new(block_frames: usize) -> Self {
        let block_frames = block_frames.max(1);
        Self {
            block_frames,
            pending: Vec::with_capacity(block_frames),
        }
    }

    /// Append samples and call `emit` once per completed block.
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(&[f32])) {
        let mut rest = samples;
        while !rest.is_empty() {
            let want = self.block_frames - self.pending.len();
            let take = want.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.block_frames {
                emit(&self.pending);
                self.pending.clear();
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
