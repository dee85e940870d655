//! Cuts a PCM byte stream into fixed-size encoder frames

use crate::audio::{FrameDuration, PcmFormat, RingBuffer};
use crate::error::AudioError;

/// Accumulates PCM in a ring buffer sized for the longest frame duration and
/// hands out complete frames. The frame size may change between calls; bytes
/// already buffered are simply cut at the new size.
pub struct PcmFramer {
    buffer: RingBuffer,
}

impl PcmFramer {
    pub fn new(format: &PcmFormat) -> Self {
        Self {
            buffer: RingBuffer::new(FrameDuration::longest().frame_bytes(format)),
        }
    }

    /// Bytes waiting for a frame to fill up
    pub fn pending(&self) -> usize {
        self.buffer.remaining_read()
    }

    /// Feed `pcm` and return every frame of `frame_bytes` that became complete.
    pub fn push(&mut self, pcm: &[u8], frame_bytes: usize) -> Result<Vec<Vec<u8>>, AudioError> {
        debug_assert!(frame_bytes > 0 && frame_bytes <= self.buffer.capacity());

        let mut frames = Vec::new();
        let mut rest = pcm;
        loop {
            self.drain_complete(frame_bytes, &mut frames)?;
            if rest.is_empty() {
                break;
            }
            let taken = self.buffer.put_partial(rest);
            rest = &rest[taken..];
        }
        Ok(frames)
    }

    /// Return all complete frames plus the partial tail padded with silence.
    pub fn finish(&mut self, frame_bytes: usize) -> Result<Vec<Vec<u8>>, AudioError> {
        let mut frames = Vec::new();
        self.drain_complete(frame_bytes, &mut frames)?;

        let tail = self.buffer.remaining_read();
        if tail > 0 {
            let silence = vec![0u8; frame_bytes - tail];
            self.buffer.put(&silence)?;
            self.drain_complete(frame_bytes, &mut frames)?;
        }

        debug_assert!(self.buffer.is_empty());
        Ok(frames)
    }

    fn drain_complete(&mut self, frame_bytes: usize, out: &mut Vec<Vec<u8>>) -> Result<(), AudioError> {
        while self.buffer.remaining_read() >= frame_bytes {
            out.push(self.buffer.get(frame_bytes)?);
        }
        Ok(())
    }
}
