//! PCM handling: buffering and format description

pub mod buffer;
pub mod format;

pub use buffer::RingBuffer;
pub use format::{FormatConverter, FrameDuration, PcmFormat, SampleFormat, SUPPORTED_SAMPLE_RATES};
