//! Encoder contract and the Opus implementation
//!
//! The fan-out controller only sees [`Encoder`]; anything that turns PCM into
//! bounded-size frames can sit behind it.

#[cfg(feature = "opus")]
pub mod encoder;
pub mod framer;

use bytes::Bytes;

use crate::audio::{FrameDuration, PcmFormat};
use crate::error::{CodecError, Result};

#[cfg(feature = "opus")]
pub use encoder::OpusEncoder;
pub use framer::PcmFramer;

/// Turns PCM into encoded frames.
pub trait Encoder: Send {
    /// PCM layout `submit` expects
    fn input_format(&self) -> PcmFormat;

    fn frame_duration(&self) -> FrameDuration;

    fn set_frame_duration(&mut self, duration: FrameDuration);

    fn max_encoded_frame_size(&self) -> usize;

    /// Bound every produced frame to `size` bytes.
    fn set_max_encoded_frame_size(&mut self, size: usize) -> std::result::Result<(), CodecError>;

    /// Buffer `pcm` and encode every frame that is now complete.
    fn submit(&mut self, pcm: &[u8]) -> Result<Vec<Bytes>>;

    /// Encode whatever is buffered, padding the last frame with silence.
    fn finish(&mut self) -> Result<Vec<Bytes>>;

    /// Raw size of one frame at the current duration
    fn frame_bytes(&self) -> usize {
        self.frame_duration().frame_bytes(&self.input_format())
    }
}
