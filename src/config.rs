//! Transmitter configuration
//!
//! Loaded from TOML. Every section falls back to defaults, so an empty file
//! (or no file at all) gives a working transmitter.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::audio::{FrameDuration, PcmFormat};
use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmitterConfig {
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub encoder: OpusConfig,
    /// Format of the PCM handed to the fan-out controller
    pub source_format: PcmFormat,
}

/// UDP discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub port: u16,
    pub timeout_ms: u64,
    /// Minimum socket receive buffer
    pub receive_buffer_bytes: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            timeout_ms: 2000,
            receive_buffer_bytes: MAX_DATAGRAM_SIZE,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// TCP receiver session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// How long a connected receiver has to send its handshake
    pub handshake_timeout_ms: u64,
    /// Frames queued per receiver before frames get dropped for it
    pub outbound_queue_frames: usize,
    /// Largest framed message accepted from a receiver
    pub max_message_size: usize,
    /// How long `close` lets queued frames drain
    pub close_drain_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_AUDIO_PORT,
            connect_timeout_ms: 5000,
            handshake_timeout_ms: 5000,
            outbound_queue_frames: 64,
            max_message_size: MAX_MESSAGE_SIZE,
            close_drain_timeout_ms: 1000,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn close_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.close_drain_timeout_ms)
    }
}

/// Leaky bucket modelling the receivers' playback buffers, in milliseconds
/// of audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity_ms: u64,
    pub drain_rate_ms_per_second: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity_ms: 1200,
            drain_rate_ms_per_second: 1000,
        }
    }
}

/// Opus application mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpusApplication {
    Voip,
    Audio,
    LowDelay,
}

/// Opus signal type hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpusSignal {
    Auto,
    Voice,
    Music,
}

/// Opus coded bandwidth
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpusBandwidth {
    Narrowband,
    Mediumband,
    Wideband,
    Superwideband,
    Fullband,
}

impl OpusBandwidth {
    /// Widest bandwidth the given input sample rate can carry
    pub fn for_sample_rate(sample_rate: u32) -> Self {
        match sample_rate {
            0..=8000 => Self::Narrowband,
            8001..=12000 => Self::Mediumband,
            12001..=16000 => Self::Wideband,
            16001..=24000 => Self::Superwideband,
            _ => Self::Fullband,
        }
    }
}

/// Opus encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusConfig {
    pub application: OpusApplication,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    pub vbr: bool,
    /// Encoder complexity (0-10)
    pub complexity: u8,
    pub signal: OpusSignal,
    /// Bandwidth cap; derived from the input sample rate when unset
    pub max_bandwidth: Option<OpusBandwidth>,
    /// Frame duration used until the first receiver joins
    pub initial_frame_duration: FrameDuration,
    /// Output bound used until the first receiver joins
    pub max_encoded_frame_size: usize,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self::music()
    }
}

impl OpusConfig {
    /// Settings for music playback
    pub fn music() -> Self {
        Self {
            application: OpusApplication::Audio,
            bitrate: DEFAULT_BITRATE,
            vbr: true,
            complexity: 10,
            signal: OpusSignal::Music,
            max_bandwidth: None,
            initial_frame_duration: FrameDuration::Ms20,
            max_encoded_frame_size: DEFAULT_MAX_ENCODED_FRAME_SIZE,
        }
    }

    /// Settings for speech
    pub fn voice() -> Self {
        Self {
            application: OpusApplication::Voip,
            bitrate: 32_000,
            signal: OpusSignal::Voice,
            ..Self::music()
        }
    }
}

impl TransmitterConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load `config.toml` from the platform config directory, or defaults if
    /// there is none.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "audio-network", "lan-audio-transmitter")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.drain_rate_ms_per_second == 0 {
            return Err(Error::Config("rate_limit.drain_rate_ms_per_second must be positive".into()));
        }
        if self.rate_limit.capacity_ms < FrameDuration::longest().as_micros() / 1000 {
            return Err(Error::Config(format!(
                "rate_limit.capacity_ms must hold at least one {} frame",
                FrameDuration::longest()
            )));
        }
        if !(500..=512_000).contains(&self.encoder.bitrate) {
            return Err(Error::Config(format!(
                "encoder.bitrate must be 500-512000, got {}",
                self.encoder.bitrate
            )));
        }
        if self.encoder.complexity > 10 {
            return Err(Error::Config(format!(
                "encoder.complexity must be 0-10, got {}",
                self.encoder.complexity
            )));
        }
        if self.session.handshake_timeout_ms == 0 {
            return Err(Error::Config("session.handshake_timeout_ms must be positive".into()));
        }
        if self.encoder.max_encoded_frame_size == 0 {
            return Err(Error::Config("encoder.max_encoded_frame_size must be positive".into()));
        }
        if self.session.outbound_queue_frames == 0 {
            return Err(Error::Config("session.outbound_queue_frames must be positive".into()));
        }
        Ok(())
    }
}
