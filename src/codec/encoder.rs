//! Opus encoder wrapper
//!
//! Takes 16-bit little-endian PCM as raw bytes, frames it, and produces one
//! Opus packet per frame, each bounded by the receivers' encoded frame limit.

use bytes::Bytes;
use opus::{Application, Channels};

use super::{Encoder, PcmFramer};
use crate::audio::{FrameDuration, PcmFormat};
use crate::config::{OpusApplication, OpusBandwidth, OpusConfig, OpusSignal};
use crate::error::{CodecError, Result};

/// Opus encoder behind the [`Encoder`] contract
pub struct OpusEncoder {
    encoder: opus::Encoder,
    config: OpusConfig,
    format: PcmFormat,
    frame_duration: FrameDuration,
    max_encoded_frame_size: usize,
    framer: PcmFramer,
    /// Reused sample buffer for one frame
    samples: Vec<i16>,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl OpusEncoder {
    /// Create an encoder for `format` with the given configuration
    pub fn new(format: PcmFormat, config: OpusConfig) -> Result<Self> {
        format.validate_encoder_input()?;

        let channels = match format.channels {
            1 => Channels::Mono,
            _ => Channels::Stereo,
        };

        let application = match config.application {
            OpusApplication::Voip => Application::Voip,
            OpusApplication::Audio => Application::Audio,
            OpusApplication::LowDelay => Application::LowDelay,
        };

        let mut encoder = opus::Encoder::new(format.sample_rate, channels, application)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;
        Self::configure_encoder(&mut encoder, &config, &format)?;

        if config.max_encoded_frame_size == 0 {
            return Err(CodecError::InvalidMaxEncodedSize(0).into());
        }

        tracing::debug!(
            "Opus encoder created: {}, {:?}, {} bps, frame {}",
            format,
            config.application,
            config.bitrate,
            config.initial_frame_duration
        );

        Ok(Self {
            encoder,
            format,
            frame_duration: config.initial_frame_duration,
            max_encoded_frame_size: config.max_encoded_frame_size,
            framer: PcmFramer::new(&format),
            samples: Vec::with_capacity(FrameDuration::longest().frame_bytes(&format) / 2),
            config,
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Encoder tuned for music at the given format
    pub fn music(format: PcmFormat) -> Result<Self> {
        Self::new(format, OpusConfig::music())
    }

    /// Encoder tuned for speech at the given format
    pub fn voice(format: PcmFormat) -> Result<Self> {
        Self::new(format, OpusConfig::voice())
    }

    fn configure_encoder(
        encoder: &mut opus::Encoder,
        config: &OpusConfig,
        format: &PcmFormat,
    ) -> std::result::Result<(), CodecError> {
        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_vbr(config.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        // Complexity (0-10)
        encoder
            .set_complexity(i32::from(config.complexity))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set complexity: {}", e)))?;

        let signal = match config.signal {
            OpusSignal::Auto => opus::Signal::Auto,
            OpusSignal::Voice => opus::Signal::Voice,
            OpusSignal::Music => opus::Signal::Music,
        };
        encoder
            .set_signal(signal)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set signal type: {}", e)))?;

        let bandwidth = match config
            .max_bandwidth
            .unwrap_or_else(|| OpusBandwidth::for_sample_rate(format.sample_rate))
        {
            OpusBandwidth::Narrowband => opus::Bandwidth::Narrowband,
            OpusBandwidth::Mediumband => opus::Bandwidth::Mediumband,
            OpusBandwidth::Wideband => opus::Bandwidth::Wideband,
            OpusBandwidth::Superwideband => opus::Bandwidth::Superwideband,
            OpusBandwidth::Fullband => opus::Bandwidth::Fullband,
        };
        encoder
            .set_max_bandwidth(bandwidth)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bandwidth: {}", e)))?;

        Ok(())
    }

    /// Encode one complete raw frame
    fn encode_frame(&mut self, frame: &[u8]) -> std::result::Result<Bytes, CodecError> {
        self.samples.clear();
        self.samples.extend(
            frame
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
        );

        let mut out = vec![0u8; self.max_encoded_frame_size];
        let size = self
            .encoder
            .encode(&self.samples, &mut out)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;
        out.truncate(size);

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;
        Ok(Bytes::from(out))
    }

    fn encode_all(&mut self, frames: Vec<Vec<u8>>) -> Result<Vec<Bytes>> {
        let mut packets = Vec::with_capacity(frames.len());
        for frame in frames {
            packets.push(self.encode_frame(&frame)?);
        }
        Ok(packets)
    }

    pub fn config(&self) -> &OpusConfig {
        &self.config
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

impl Encoder for OpusEncoder {
    fn input_format(&self) -> PcmFormat {
        self.format
    }

    fn frame_duration(&self) -> FrameDuration {
        self.frame_duration
    }

    fn set_frame_duration(&mut self, duration: FrameDuration) {
        if duration != self.frame_duration {
            tracing::debug!("Opus frame duration {} -> {}", self.frame_duration, duration);
            self.frame_duration = duration;
        }
    }

    fn max_encoded_frame_size(&self) -> usize {
        self.max_encoded_frame_size
    }

    fn set_max_encoded_frame_size(&mut self, size: usize) -> std::result::Result<(), CodecError> {
        if size == 0 {
            return Err(CodecError::InvalidMaxEncodedSize(size));
        }
        self.max_encoded_frame_size = size;
        Ok(())
    }

    fn submit(&mut self, pcm: &[u8]) -> Result<Vec<Bytes>> {
        let frame_bytes = self.frame_bytes();
        let frames = self.framer.push(pcm, frame_bytes)?;
        self.encode_all(frames)
    }

    fn finish(&mut self) -> Result<Vec<Bytes>> {
        let frame_bytes = self.frame_bytes();
        let frames = self.framer.finish(frame_bytes)?;
        self.encode_all(frames)
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}
