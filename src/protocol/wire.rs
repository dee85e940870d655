//! Protobuf schema shared with the receiver firmware
//!
//! Field numbers must match the receivers' generated code exactly; the
//! required fields are proto2 `required` on their side.

/// UDP discovery datagram
#[derive(Clone, PartialEq, prost::Message)]
pub struct BroadcastMessage {
    #[prost(uint32, required, tag = "1")]
    pub magic_word: u32,
    #[prost(oneof = "broadcast_message::Message", tags = "2, 3")]
    pub message: Option<broadcast_message::Message>,
}

pub mod broadcast_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        #[prost(bool, tag = "2")]
        DiscoveryRequest(bool),
        #[prost(message, tag = "3")]
        DiscoveryResponse(super::DiscoveryResponse),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DiscoveryResponse {
    #[prost(uint32, required, tag = "1")]
    pub protocol_version: u32,
    #[prost(uint64, required, tag = "2")]
    pub mac_address: u64,
    #[prost(string, required, tag = "3")]
    pub device_name: String,
    #[prost(bool, required, tag = "4")]
    pub currently_streaming: bool,
    #[prost(string, required, tag = "5")]
    pub opus_version: String,
}

/// Transmitter to receiver, over TCP
#[derive(Clone, PartialEq, prost::Message)]
pub struct ToReceiver {
    #[prost(oneof = "to_receiver::Message", tags = "1")]
    pub message: Option<to_receiver::Message>,
}

pub mod to_receiver {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        AudioData(super::AudioData),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AudioData {
    #[prost(bytes = "bytes", required, tag = "1")]
    pub opus_encoded_frame: bytes::Bytes,
}

/// Receiver to transmitter, over TCP
#[derive(Clone, PartialEq, prost::Message)]
pub struct ToTransmitter {
    #[prost(oneof = "to_transmitter::Message", tags = "1, 2")]
    pub message: Option<to_transmitter::Message>,
}

pub mod to_transmitter {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        ReceiverInformation(super::ReceiverInformation),
        #[prost(message, tag = "2")]
        Error(super::ReceiverError),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReceiverInformation {
    #[prost(message, required, tag = "1")]
    pub discovery_data: DiscoveryResponse,
    #[prost(uint32, required, tag = "2")]
    pub max_encoded_frame_size: u32,
    #[prost(uint32, required, tag = "3")]
    pub max_decoded_frame_size: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReceiverError {
    #[prost(bool, required, tag = "1")]
    pub audio_underflow: bool,
    #[prost(bool, required, tag = "2")]
    pub audio_decode_error: bool,
}
