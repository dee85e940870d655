//! # LAN Audio Transmitter
//!
//! Streams Opus-encoded audio from one transmitter to any number of network
//! receivers discovered on the local segment.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              TRANSMITTER                                     │
//! │                                                                              │
//! │   ┌────────────────────┐        UDP broadcast :58765                         │
//! │   │ Discovery          │ ─────── request ──────────────────────────────►     │
//! │   │ (network::discovery)│ ◄────── responses (magic word checked) ───────     │
//! │   └─────────┬──────────┘                                                     │
//! │             │ DiscoveredReceiver                                             │
//! │             ▼                                                                │
//! │   ┌─────────────────────────────────────────────────────────────────────┐   │
//! │   │                 Fan-Out Controller (output::AudioFanOut)             │   │
//! │   │                                                                      │   │
//! │   │   raw PCM ──► RingBuffer ──► Encoder ──► LeakyBucket ──┐             │   │
//! │   │                (audio)       (codec)     (network)     │             │   │
//! │   │                                                        ▼             │   │
//! │   │        ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │   │
//! │   │        │ queue + task │  │ queue + task │  │ queue + task │  ...     │   │
//! │   │        └──────┬───────┘  └──────┬───────┘  └──────┬───────┘          │   │
//! │   └───────────────┼─────────────────┼─────────────────┼──────────────────┘   │
//! │                   ▼                 ▼                 ▼                      │
//! │        ┌──────────────┐  ┌──────────────┐  ┌──────────────┐                 │
//! │        │ReceiverSession│ │ReceiverSession│ │ReceiverSession│ (network::session)│
//! │        │ varint framed │ │ varint framed │ │ varint framed │                 │
//! │        └──────┬───────┘  └──────┬───────┘  └──────┬───────┘                 │
//! └───────────────┼─────────────────┼─────────────────┼──────────────────────────┘
//!                 │ TCP :58764      │                 │
//!                 ▼                 ▼                 ▼
//!            Receiver A        Receiver B        Receiver C
//! ```
//!
//! Each receiver announces its decoded and encoded frame buffer sizes in a
//! handshake. The controller picks the longest encoder frame that every
//! receiver can hold and paces delivery to the receivers' playback rate.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod output;
pub mod protocol;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Fixed word at the start of every discovery message
    pub const MAGIC_WORD: u32 = 0x2C5D_A044;

    /// Default UDP port for receiver discovery
    pub const DEFAULT_DISCOVERY_PORT: u16 = 58765;

    /// Default TCP port of the receivers' audio socket
    pub const DEFAULT_AUDIO_PORT: u16 = 58764;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 92_000;

    /// Encoder output bound used before any receiver has joined
    pub const DEFAULT_MAX_ENCODED_FRAME_SIZE: usize = 4096;

    /// Largest discovery datagram we read
    pub const MAX_DATAGRAM_SIZE: usize = 1024;

    /// Largest framed message accepted from a receiver
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    /// Protocol version this transmitter speaks
    pub const PROTOCOL_VERSION: u32 = 1;
}
