//! Wire protocol: protobuf messages and varint framing

pub mod framing;
pub mod messages;
pub mod wire;

pub use framing::{read_delimited, write_delimited};
pub use messages::{
    AnnouncementKind, BroadcastAnnouncement, ReceiverAnnouncement, ReceiverCapabilities,
    ReceiverErrorReport, ReceiverHello, ReceiverMessage, TransmitterMessage,
};

#[cfg(test)]
pub(crate) use messages::sample_announcement;
