//! Picking one encoder setting every receiver can handle

use crate::audio::{FrameDuration, PcmFormat};
use crate::error::OutputError;
use crate::protocol::ReceiverCapabilities;

/// Encoder settings agreed with the current receivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub frame_duration: FrameDuration,
    pub max_encoded_frame_size: usize,
}

/// Smallest raw frame the encoder can produce for `format`
pub fn min_frame_bytes(format: &PcmFormat) -> usize {
    FrameDuration::shortest().frame_bytes(format)
}

/// Reject a receiver whose decode buffer cannot hold even the shortest frame.
pub fn check_receiver(format: &PcmFormat, capabilities: &ReceiverCapabilities) -> Result<(), OutputError> {
    let required = min_frame_bytes(format);
    if (capabilities.max_decoded_frame_size as usize) < required {
        return Err(OutputError::ReceiverBufferTooSmall {
            offered: capabilities.max_decoded_frame_size,
            required: required as u32,
        });
    }
    Ok(())
}

/// Settings for a receiver set: the longest frame whose raw size fits the
/// smallest decode buffer, and the smallest encoded size limit.
///
/// Returns `None` for an empty set, in which case the current settings stay.
pub fn negotiate<I>(format: &PcmFormat, receivers: I) -> Result<Option<EncoderSettings>, OutputError>
where
    I: IntoIterator<Item = ReceiverCapabilities>,
{
    let mut receivers = receivers.into_iter();
    let Some(first) = receivers.next() else {
        return Ok(None);
    };

    let (smallest_decoded, smallest_encoded) = receivers.fold(
        (first.max_decoded_frame_size, first.max_encoded_frame_size),
        |(decoded, encoded), caps| {
            (
                decoded.min(caps.max_decoded_frame_size),
                encoded.min(caps.max_encoded_frame_size),
            )
        },
    );

    let frame_duration = FrameDuration::ALL
        .into_iter()
        .rev()
        .find(|d| d.frame_bytes(format) <= smallest_decoded as usize)
        .ok_or(OutputError::CannotAccommodateReceivers {
            smallest_buffer: smallest_decoded,
        })?;

    Ok(Some(EncoderSettings {
        frame_duration,
        max_encoded_frame_size: smallest_encoded as usize,
    }))
}
