//! PCM format description and frame duration arithmetic

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AudioError, CodecError};

/// Sample rates the encoder accepts
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Sample encoding of a PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// 16-bit signed, little-endian
    I16Le,
    /// 16-bit signed, big-endian
    I16Be,
    /// 32-bit float, little-endian
    F32Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::I16Le | SampleFormat::I16Be => 2,
            SampleFormat::F32Le => 4,
        }
    }
}

/// Interleaved PCM stream format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl PcmFormat {
    /// 16-bit signed little-endian PCM, the only layout the encoder takes
    pub const fn s16le(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format: SampleFormat::I16Le,
        }
    }

    /// Size in bytes of one sample for every channel
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.sample_format.bytes_per_sample()
    }

    /// Check that the encoder can take this format as input.
    pub fn validate_encoder_input(&self) -> Result<(), AudioError> {
        if self.sample_format != SampleFormat::I16Le {
            return Err(AudioError::UnsupportedFormat(format!(
                "{:?} samples, expected 16-bit signed little-endian",
                self.sample_format
            )));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} channels, must be one or two",
                self.channels
            )));
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(AudioError::UnsupportedFormat(format!(
                "sample rate {} Hz, must be one of {:?}",
                self.sample_rate, SUPPORTED_SAMPLE_RATES
            )));
        }
        Ok(())
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::s16le(48000, 2)
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {:?}",
            self.sample_rate, self.channels, self.sample_format
        )
    }
}

/// Encoder frame durations, in ascending order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FrameDuration {
    #[serde(rename = "2.5ms")]
    Ms2_5,
    #[serde(rename = "5ms")]
    Ms5,
    #[serde(rename = "10ms")]
    Ms10,
    #[serde(rename = "20ms")]
    Ms20,
    #[serde(rename = "40ms")]
    Ms40,
    #[serde(rename = "60ms")]
    Ms60,
}

impl FrameDuration {
    pub const ALL: [FrameDuration; 6] = [
        FrameDuration::Ms2_5,
        FrameDuration::Ms5,
        FrameDuration::Ms10,
        FrameDuration::Ms20,
        FrameDuration::Ms40,
        FrameDuration::Ms60,
    ];

    pub fn shortest() -> Self {
        FrameDuration::Ms2_5
    }

    pub fn longest() -> Self {
        FrameDuration::Ms60
    }

    pub fn as_micros(self) -> u64 {
        match self {
            FrameDuration::Ms2_5 => 2_500,
            FrameDuration::Ms5 => 5_000,
            FrameDuration::Ms10 => 10_000,
            FrameDuration::Ms20 => 20_000,
            FrameDuration::Ms40 => 40_000,
            FrameDuration::Ms60 => 60_000,
        }
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_micros(self.as_micros())
    }

    pub fn as_millis_f32(self) -> f32 {
        self.as_micros() as f32 / 1000.0
    }

    /// Samples per channel in one frame at `sample_rate`
    pub fn samples_per_channel(self, sample_rate: u32) -> usize {
        (sample_rate as u64 * self.as_micros() / 1_000_000) as usize
    }

    /// Size of one raw frame in bytes for `format`
    pub fn frame_bytes(self, format: &PcmFormat) -> usize {
        self.samples_per_channel(format.sample_rate) * format.bytes_per_frame()
    }
}

impl TryFrom<Duration> for FrameDuration {
    type Error = CodecError;

    fn try_from(value: Duration) -> Result<Self, Self::Error> {
        FrameDuration::ALL
            .into_iter()
            .find(|d| d.as_duration() == value)
            .ok_or(CodecError::UnsupportedFrameDuration(value))
    }
}

impl fmt::Display for FrameDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.as_millis_f32())
    }
}

/// Converts PCM between formats before it reaches the encoder.
///
/// Resampling and sample-type conversion live outside this crate; callers
/// whose source format differs from the encoder input plug one in here.
pub trait FormatConverter: Send {
    fn convert(&mut self, input: &[u8], from: PcmFormat, to: PcmFormat) -> Result<Vec<u8>, AudioError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes_48k_stereo() {
        let format = PcmFormat::s16le(48000, 2);
        let sizes: Vec<usize> = FrameDuration::ALL
            .iter()
            .map(|d| d.frame_bytes(&format))
            .collect();
        assert_eq!(sizes, vec![480, 960, 1920, 3840, 7680, 11520]);
    }

    #[test]
    fn test_frame_samples_8k_mono() {
        assert_eq!(FrameDuration::Ms2_5.samples_per_channel(8000), 20);
        assert_eq!(FrameDuration::Ms20.frame_bytes(&PcmFormat::s16le(8000, 1)), 320);
    }

    #[test]
    fn test_frame_duration_from_duration() {
        assert_eq!(
            FrameDuration::try_from(Duration::from_micros(2500)).unwrap(),
            FrameDuration::Ms2_5
        );
        assert!(FrameDuration::try_from(Duration::from_millis(30)).is_err());
    }

    #[test]
    fn test_encoder_input_validation() {
        assert!(PcmFormat::s16le(48000, 2).validate_encoder_input().is_ok());
        assert!(PcmFormat::s16le(44100, 2).validate_encoder_input().is_err());
        assert!(PcmFormat::s16le(48000, 3).validate_encoder_input().is_err());

        let float = PcmFormat {
            sample_format: SampleFormat::F32Le,
            ..PcmFormat::default()
        };
        assert!(matches!(
            float.validate_encoder_input(),
            Err(AudioError::UnsupportedFormat(_))
        ));
    }
}
