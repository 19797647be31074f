// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transport envelope and application message framing.
//!
//! Both layers follow the same discipline: a small header, the payload, then
//! zero padding up to a configured alignment. Padding is never interpreted.

use crate::cursor::BufWriter;
use crate::cursor::align_up;
use thiserror::Error;
use vtpm_session_protocol::APP_MESSAGE_HEADER_SIZE;
use vtpm_session_protocol::AppMessageHeader;
use vtpm_session_protocol::AppMessageType;
use vtpm_session_protocol::ENVELOPE_HEADER_SIZE;
use vtpm_session_protocol::ENVELOPE_VERSION;
use vtpm_session_protocol::EnvelopeHeader;
use vtpm_session_protocol::MessageType;
use zerocopy::FromBytes;
use zerocopy::little_endian::U32 as U32Le;

/// Structural problems with a received envelope or application message.
#[derive(Debug, Error)]
pub enum MalformedEnvelope {
    /// Nothing follows the header.
    #[error("{len} bytes is not longer than the {header_size} byte header")]
    TooShort {
        /// Received length.
        len: usize,
        /// Header length.
        header_size: usize,
    },
    /// The padded payload length is not a multiple of the alignment.
    #[error("padded payload length {len} is not a multiple of {alignment}")]
    Misaligned {
        /// Padded payload length.
        len: usize,
        /// Configured alignment.
        alignment: usize,
    },
    /// The declared length does not account for the received bytes.
    #[error("declared length {declared} does not match the {actual} byte buffer")]
    LengthMismatch {
        /// Length from the header.
        declared: usize,
        /// Received length.
        actual: usize,
    },
    /// A secured envelope too short to carry a session id.
    #[error("secured envelope does not carry a session id")]
    MissingSessionId,
}

/// Errors from encoding or decoding envelopes and application messages.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The output buffer cannot hold the encoded bytes.
    #[error("output buffer too small, {required} bytes required")]
    BufferTooSmall {
        /// Bytes needed to encode.
        required: usize,
    },
    /// The payload cannot be described by the 16-bit length field.
    #[error("payload of {0} bytes does not fit in an envelope")]
    PayloadTooLarge(usize),
    /// The received bytes are not a well-formed envelope.
    #[error("malformed envelope")]
    MalformedEnvelope(#[source] MalformedEnvelope),
    /// The envelope version is not [`ENVELOPE_VERSION`].
    #[error("unsupported envelope version {0:#x}")]
    UnsupportedVersion(u8),
    /// Unknown envelope discriminant.
    #[error("unsupported message type {0:?}")]
    UnsupportedMessageType(MessageType),
    /// Unknown application message discriminant.
    #[error("unsupported application message type {0:?}")]
    UnsupportedAppMessageType(AppMessageType),
}

impl From<MalformedEnvelope> for EnvelopeError {
    fn from(value: MalformedEnvelope) -> Self {
        Self::MalformedEnvelope(value)
    }
}

/// A decoded transport envelope borrowing from the received buffer.
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    /// Kind of payload.
    pub message_type: MessageType,
    /// Session id of a [`MessageType::SECURED`] envelope.
    pub session_id: Option<u32>,
    /// Payload without header or padding.
    pub payload: &'a [u8],
}

/// Returns the encoded size of an envelope carrying `payload_len` bytes.
pub fn envelope_size(payload_len: usize, alignment: usize) -> usize {
    ENVELOPE_HEADER_SIZE + align_up(payload_len, alignment)
}

/// Encodes `payload` as an envelope of type `message_type` into `out`,
/// returning the number of bytes written.
pub fn encode_envelope(
    message_type: MessageType,
    payload: &[u8],
    alignment: usize,
    out: &mut [u8],
) -> Result<usize, EnvelopeError> {
    let total_length = u16::try_from(ENVELOPE_HEADER_SIZE + payload.len())
        .map_err(|_| EnvelopeError::PayloadTooLarge(payload.len()))?;
    let required = envelope_size(payload.len(), alignment);
    if out.len() < required {
        return Err(EnvelopeError::BufferTooSmall { required });
    }

    let mut writer = BufWriter::new(out);
    writer.put_obj(&EnvelopeHeader {
        total_length: total_length.into(),
        version: ENVELOPE_VERSION,
        message_type,
    });
    writer.put(payload);
    writer.put_zeros(required - ENVELOPE_HEADER_SIZE - payload.len());
    Ok(writer.written())
}

/// Decodes an envelope that must span exactly `bytes`.
pub fn decode_envelope(bytes: &[u8], alignment: usize) -> Result<Envelope<'_>, EnvelopeError> {
    if bytes.len() <= ENVELOPE_HEADER_SIZE {
        return Err(MalformedEnvelope::TooShort {
            len: bytes.len(),
            header_size: ENVELOPE_HEADER_SIZE,
        }
        .into());
    }
    let (header, body) = EnvelopeHeader::read_from_prefix(bytes).map_err(|_| {
        MalformedEnvelope::TooShort {
            len: bytes.len(),
            header_size: ENVELOPE_HEADER_SIZE,
        }
    })?;

    if header.version != ENVELOPE_VERSION {
        return Err(EnvelopeError::UnsupportedVersion(header.version));
    }

    if body.len() % alignment != 0 {
        return Err(MalformedEnvelope::Misaligned {
            len: body.len(),
            alignment,
        }
        .into());
    }

    let declared = header.total_length.get() as usize;
    let payload_len = declared.saturating_sub(ENVELOPE_HEADER_SIZE);
    if declared <= ENVELOPE_HEADER_SIZE || align_up(payload_len, alignment) != body.len() {
        return Err(MalformedEnvelope::LengthMismatch {
            declared,
            actual: bytes.len(),
        }
        .into());
    }
    let payload = &body[..payload_len];

    let session_id = match header.message_type {
        MessageType::HANDSHAKE => None,
        MessageType::SECURED => {
            let (session_id, _) = U32Le::read_from_prefix(payload)
                .map_err(|_| MalformedEnvelope::MissingSessionId)?;
            Some(session_id.get())
        }
        message_type => return Err(EnvelopeError::UnsupportedMessageType(message_type)),
    };

    Ok(Envelope {
        message_type: header.message_type,
        session_id,
        payload,
    })
}

/// A decoded application message borrowing from the decrypted plaintext.
#[derive(Debug, Clone, Copy)]
pub struct AppMessage<'a> {
    /// Kind of message.
    pub message_type: AppMessageType,
    /// Message body. With an alignment above one this includes the trailing
    /// zero padding; the protocols carried here are self-delimiting.
    pub payload: &'a [u8],
}

/// Returns the encoded size of an application message carrying `payload_len`
/// bytes.
pub fn app_message_size(payload_len: usize, alignment: usize) -> usize {
    APP_MESSAGE_HEADER_SIZE + align_up(payload_len, alignment)
}

/// Prefixes `payload` with an application message header into `out`,
/// returning the number of bytes written.
pub fn encode_app_message(
    message_type: AppMessageType,
    payload: &[u8],
    alignment: usize,
    out: &mut [u8],
) -> Result<usize, EnvelopeError> {
    let required = app_message_size(payload.len(), alignment);
    if out.len() < required {
        return Err(EnvelopeError::BufferTooSmall { required });
    }

    let mut writer = BufWriter::new(out);
    writer.put_obj(&AppMessageHeader { message_type });
    writer.put(payload);
    writer.put_zeros(required - APP_MESSAGE_HEADER_SIZE - payload.len());
    Ok(writer.written())
}

/// Decodes an application message from decrypted plaintext.
pub fn decode_app_message(bytes: &[u8], alignment: usize) -> Result<AppMessage<'_>, EnvelopeError> {
    let too_short = || MalformedEnvelope::TooShort {
        len: bytes.len(),
        header_size: APP_MESSAGE_HEADER_SIZE,
    };
    if bytes.len() <= APP_MESSAGE_HEADER_SIZE {
        return Err(too_short().into());
    }
    let (header, payload) = AppMessageHeader::read_from_prefix(bytes).map_err(|_| too_short())?;

    if payload.len() % alignment != 0 {
        return Err(MalformedEnvelope::Misaligned {
            len: payload.len(),
            alignment,
        }
        .into());
    }

    match header.message_type {
        AppMessageType::GENERIC | AppMessageType::APPLICATION => Ok(AppMessage {
            message_type: header.message_type,
            payload,
        }),
        message_type => Err(EnvelopeError::UnsupportedAppMessageType(message_type)),
    }
}
