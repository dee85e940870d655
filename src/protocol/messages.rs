//! Domain message types
//!
//! The wire structs in [`super::wire`] model every field as optional oneofs;
//! these types are what the rest of the crate matches on.

use std::fmt;

use bytes::Bytes;
use prost::Message as _;

use super::wire::{self, broadcast_message, to_receiver, to_transmitter};
use crate::constants::MAGIC_WORD;
use crate::error::ProtocolError;

/// Identity a receiver reports in discovery responses and its handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverAnnouncement {
    pub device_name: String,
    pub mac_address: u64,
    pub currently_streaming: bool,
    pub codec_version: String,
    pub protocol_version: u32,
}

impl ReceiverAnnouncement {
    /// MAC address in the usual colon-separated form, least significant byte first
    /// as the firmware packs it.
    pub fn mac_address_string(&self) -> String {
        let bytes = self.mac_address.to_le_bytes();
        bytes[..6]
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl From<wire::DiscoveryResponse> for ReceiverAnnouncement {
    fn from(value: wire::DiscoveryResponse) -> Self {
        Self {
            device_name: value.device_name,
            mac_address: value.mac_address,
            currently_streaming: value.currently_streaming,
            codec_version: value.opus_version,
            protocol_version: value.protocol_version,
        }
    }
}

impl From<ReceiverAnnouncement> for wire::DiscoveryResponse {
    fn from(value: ReceiverAnnouncement) -> Self {
        Self {
            protocol_version: value.protocol_version,
            mac_address: value.mac_address,
            device_name: value.device_name,
            currently_streaming: value.currently_streaming,
            opus_version: value.codec_version,
        }
    }
}

impl fmt::Display for ReceiverAnnouncement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.device_name, self.mac_address_string())
    }
}

/// Kind of a discovery datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnouncementKind {
    Request,
    Response(ReceiverAnnouncement),
}

/// A decoded discovery datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastAnnouncement {
    pub magic_word: u32,
    pub kind: AnnouncementKind,
}

impl BroadcastAnnouncement {
    pub fn request() -> Self {
        Self {
            magic_word: MAGIC_WORD,
            kind: AnnouncementKind::Request,
        }
    }

    pub fn response(announcement: ReceiverAnnouncement) -> Self {
        Self {
            magic_word: MAGIC_WORD,
            kind: AnnouncementKind::Response(announcement),
        }
    }

    /// Serialize as a single unframed datagram
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let message = match &self.kind {
            AnnouncementKind::Request => broadcast_message::Message::DiscoveryRequest(true),
            AnnouncementKind::Response(announcement) => {
                broadcast_message::Message::DiscoveryResponse(announcement.clone().into())
            }
        };
        wire::BroadcastMessage {
            magic_word: self.magic_word,
            message: Some(message),
        }
        .encode_to_vec()
    }

    /// Parse a datagram without checking the magic word.
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        let message = wire::BroadcastMessage::decode(datagram)?;
        let kind = match message.message {
            Some(broadcast_message::Message::DiscoveryRequest(_)) => AnnouncementKind::Request,
            Some(broadcast_message::Message::DiscoveryResponse(response)) => {
                AnnouncementKind::Response(response.into())
            }
            None => {
                return Err(ProtocolError::ProtocolMismatch(
                    "broadcast message carries neither request nor response".into(),
                ))
            }
        };
        Ok(Self {
            magic_word: message.magic_word,
            kind,
        })
    }

    /// Parse a datagram and reject it unless it carries our magic word.
    pub fn decode_checked(datagram: &[u8]) -> Result<Self, ProtocolError> {
        let announcement = Self::decode(datagram)?;
        if announcement.magic_word != MAGIC_WORD {
            return Err(ProtocolError::MagicWordMismatch(announcement.magic_word));
        }
        Ok(announcement)
    }
}

/// Buffer sizes a receiver reports in its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverCapabilities {
    /// Largest raw PCM frame the receiver can decode into, in bytes
    pub max_decoded_frame_size: u32,
    /// Largest encoded frame the receiver accepts, in bytes
    pub max_encoded_frame_size: u32,
}

/// The receiver's handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverHello {
    pub capabilities: ReceiverCapabilities,
    pub announcement: ReceiverAnnouncement,
}

/// Problem report a receiver may send during streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiverErrorReport {
    pub audio_underflow: bool,
    pub audio_decode_error: bool,
}

/// Anything a receiver sends to the transmitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverMessage {
    Hello(ReceiverHello),
    Error(ReceiverErrorReport),
}

impl ReceiverMessage {
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let message = wire::ToTransmitter::decode(body)?;
        match message.message {
            Some(to_transmitter::Message::ReceiverInformation(info)) => {
                Ok(ReceiverMessage::Hello(ReceiverHello {
                    capabilities: ReceiverCapabilities {
                        max_decoded_frame_size: info.max_decoded_frame_size,
                        max_encoded_frame_size: info.max_encoded_frame_size,
                    },
                    announcement: info.discovery_data.into(),
                }))
            }
            Some(to_transmitter::Message::Error(error)) => {
                Ok(ReceiverMessage::Error(ReceiverErrorReport {
                    audio_underflow: error.audio_underflow,
                    audio_decode_error: error.audio_decode_error,
                }))
            }
            None => Err(ProtocolError::ProtocolMismatch(
                "receiver message carries no known variant".into(),
            )),
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let message = match self {
            ReceiverMessage::Hello(hello) => {
                to_transmitter::Message::ReceiverInformation(wire::ReceiverInformation {
                    discovery_data: hello.announcement.clone().into(),
                    max_encoded_frame_size: hello.capabilities.max_encoded_frame_size,
                    max_decoded_frame_size: hello.capabilities.max_decoded_frame_size,
                })
            }
            ReceiverMessage::Error(report) => to_transmitter::Message::Error(wire::ReceiverError {
                audio_underflow: report.audio_underflow,
                audio_decode_error: report.audio_decode_error,
            }),
        };
        wire::ToTransmitter {
            message: Some(message),
        }
        .encode_to_vec()
    }
}

/// Anything the transmitter sends to a receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmitterMessage {
    AudioData(Bytes),
}

impl TransmitterMessage {
    pub fn encode(&self) -> Bytes {
        let message = match self {
            TransmitterMessage::AudioData(frame) => to_receiver::Message::AudioData(wire::AudioData {
                opus_encoded_frame: frame.clone(),
            }),
        };
        Bytes::from(
            wire::ToReceiver {
                message: Some(message),
            }
            .encode_to_vec(),
        )
    }

    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        match wire::ToReceiver::decode(body)?.message {
            Some(to_receiver::Message::AudioData(data)) => {
                Ok(TransmitterMessage::AudioData(data.opus_encoded_frame))
            }
            None => Err(ProtocolError::ProtocolMismatch(
                "transmitter message carries no known variant".into(),
            )),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_announcement() -> ReceiverAnnouncement {
    ReceiverAnnouncement {
        device_name: "Audio-Network Receiver".into(),
        mac_address: 0x0000_5634_1200_AB24,
        currently_streaming: false,
        codec_version: "libopus 1.3".into(),
        protocol_version: 1,
    }
}
