//! Error types for the audio transmitter

use std::time::Duration;

use thiserror::Error;

/// Main error type for the transmitter
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// PCM handling errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Buffer overflow: {requested} bytes requested, {available} writable")]
    Overflow { requested: usize, available: usize },

    #[error("Buffer underflow: {requested} bytes requested, {available} readable")]
    Underflow { requested: usize, available: usize },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Unsupported frame duration: {0:?}")]
    UnsupportedFrameDuration(Duration),

    #[error("Invalid maximum encoded frame size: {0}")]
    InvalidMaxEncodedSize(usize),
}

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Varint does not fit into 32 bits")]
    VarintOverflow,

    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Malformed message: {0}")]
    Malformed(#[from] prost::DecodeError),

    #[error("Magic word mismatch: {0:#010x}")]
    MagicWordMismatch(u32),

    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Handshake timed out: {0}")]
    HandshakeTimeout(String),

    #[error("Frame too large: {size} bytes (receiver accepts at most {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Leaky bucket errors
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Amount {amount} exceeds bucket capacity {capacity}, it can never be admitted")]
    ExceedsCapacity { amount: u64, capacity: u64 },
}

/// Fan-out controller errors
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Receiver buffer too small: {offered} bytes offered, at least {required} required")]
    ReceiverBufferTooSmall { offered: u32, required: u32 },

    #[error("Cannot accommodate all receivers: smallest decoded frame buffer is {smallest_buffer} bytes")]
    CannotAccommodateReceivers { smallest_buffer: u32 },

    #[error("Output is closed")]
    Closed,

    #[error("Unknown receiver: {0}")]
    UnknownReceiver(uuid::Uuid),
}

/// Result type alias for the transmitter
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True if the error ended a receiver session because the peer went away
    /// or the stream broke, as opposed to a local usage error.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Protocol(ProtocolError::UnexpectedEof) => true,
            Error::Network(NetworkError::SendFailed(_)) => true,
            _ => false,
        }
    }
}
