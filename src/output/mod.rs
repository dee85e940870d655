//! Fan-out of one encoded stream to many receivers

pub mod controller;
pub mod delivery;
pub mod negotiation;

pub use controller::AudioFanOut;
pub use delivery::{ReceiverId, ReceiverInfo};
pub use negotiation::{check_receiver, min_frame_bytes, negotiate, EncoderSettings};
