// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Request/response exchanges with the vTPM service.
//!
//! A handshake exchange wraps the engine's bytes in a HANDSHAKE envelope. A
//! secured exchange stacks every layer:
//!
//! ```text
//! app message -> record (encrypt, request keys) -> SECURED envelope -> channel
//! channel -> SECURED envelope -> record (decrypt, response keys) -> app message
//! ```

use crate::channel::ChannelTransport;
use crate::channel::TransportError;
use crate::config::SessionConfig;
use crate::framer::EnvelopeError;
use crate::framer::app_message_size;
use crate::framer::decode_app_message;
use crate::framer::decode_envelope;
use crate::framer::encode_app_message;
use crate::framer::encode_envelope;
use crate::framer::envelope_size;
use crate::record::RecordCodec;
use crate::record::RecordError;
use crate::store::Direction;
use crate::store::Session;
use std::time::Duration;
use thiserror::Error;
use vtpm_session_protocol::AppMessageType;
use vtpm_session_protocol::MessageType;
use zeroize::Zeroizing;

/// Errors from a single exchange with the vTPM service.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Secured requests must carry at least one byte. Nothing was sent.
    #[error("empty request")]
    EmptyRequest,
    /// The request cannot fit in one envelope. Nothing was sent.
    #[error("request of {size} bytes exceeds the {max} byte envelope limit")]
    RequestTooLarge {
        /// Encoded size of the request.
        size: usize,
        /// Largest envelope the channel can carry.
        max: usize,
    },
    /// The channel failed.
    #[error("transport error")]
    Transport(#[from] TransportError),
    /// An envelope or application message could not be framed.
    #[error("framing error")]
    Envelope(#[from] EnvelopeError),
    /// The record layer failed.
    #[error("record error")]
    Record(#[from] RecordError),
    /// The reply is addressed to a different session.
    #[error("reply for session {received:#x}, expected {expected:#x}")]
    SessionIdMismatch {
        /// The live session id.
        expected: u32,
        /// The id in the reply envelope.
        received: u32,
    },
    /// The reply envelope is of the wrong kind.
    #[error("unexpected reply message type {0:?}")]
    UnexpectedMessageType(MessageType),
    /// The decrypted reply is of the wrong application type.
    #[error("unexpected reply application message type {0:?}")]
    UnexpectedAppMessageType(AppMessageType),
}

impl MessageError {
    /// Whether the session must be torn down after this error.
    ///
    /// Once a request record has been produced the two sides' counters can
    /// only stay in step if the matching reply is consumed, so any failure
    /// past that point is fatal, as is any failure of the record layer's
    /// integrity checks.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            MessageError::EmptyRequest | MessageError::RequestTooLarge { .. } => false,
            MessageError::Transport(err) => !matches!(err, TransportError::BufferTooSmall { .. }),
            MessageError::Envelope(err) => !matches!(
                err,
                EnvelopeError::BufferTooSmall { .. } | EnvelopeError::PayloadTooLarge(_)
            ),
            MessageError::Record(err) => err.is_session_fatal(),
            MessageError::SessionIdMismatch { .. }
            | MessageError::UnexpectedMessageType(_)
            | MessageError::UnexpectedAppMessageType(_) => true,
        }
    }
}

/// Turns requests into envelopes and replies back into payloads.
#[derive(Debug, Clone)]
pub struct MessagePipeline {
    codec: RecordCodec,
    transport_alignment: usize,
    app_alignment: usize,
    timeout: Duration,
}

impl MessagePipeline {
    /// Creates a pipeline from a validated configuration.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            codec: RecordCodec::from_config(config),
            transport_alignment: config.transport_alignment,
            app_alignment: config.app_alignment,
            timeout: config.channel_timeout,
        }
    }

    /// Sends a plaintext handshake message and returns the peer's reply.
    pub fn exchange_handshake(
        &self,
        transport: &mut ChannelTransport,
        request: &[u8],
    ) -> Result<Vec<u8>, MessageError> {
        let size = envelope_size(request.len(), self.transport_alignment);
        check_size(transport, size)?;

        let mut envelope = vec![0; size];
        let len = encode_envelope(
            MessageType::HANDSHAKE,
            request,
            self.transport_alignment,
            &mut envelope,
        )?;
        let reply = transport.round_trip(&envelope[..len], self.timeout)?;

        let envelope = decode_envelope(&reply, self.transport_alignment)?;
        if envelope.message_type != MessageType::HANDSHAKE {
            return Err(MessageError::UnexpectedMessageType(envelope.message_type));
        }
        Ok(envelope.payload.to_vec())
    }

    /// Sends `request` as an application message of type `app_type` under
    /// `session` and returns the decrypted reply, which must be of the same
    /// type.
    pub fn exchange_secured(
        &self,
        transport: &mut ChannelTransport,
        session: &mut Session,
        app_type: AppMessageType,
        request: &[u8],
    ) -> Result<Vec<u8>, MessageError> {
        if request.is_empty() {
            return Err(MessageError::EmptyRequest);
        }
        let app_size = app_message_size(request.len(), self.app_alignment);
        let record_size = self.codec.max_record_size(app_size);
        let size = envelope_size(record_size, self.transport_alignment);
        check_size(transport, size)?;

        let mut message = Zeroizing::new(vec![0; app_size]);
        encode_app_message(app_type, request, self.app_alignment, &mut message)?;

        // No failure past this point leaves the request counter reusable.
        let mut record = vec![0; record_size];
        let record_len = self
            .codec
            .encode(session, Direction::Request, &message, &mut record)?;

        let mut envelope = vec![0; size];
        let len = encode_envelope(
            MessageType::SECURED,
            &record[..record_len],
            self.transport_alignment,
            &mut envelope,
        )?;
        let reply = transport.round_trip(&envelope[..len], self.timeout)?;

        let envelope = decode_envelope(&reply, self.transport_alignment)?;
        if envelope.message_type != MessageType::SECURED {
            return Err(MessageError::UnexpectedMessageType(envelope.message_type));
        }
        let received = envelope.session_id.unwrap_or(0);
        if received != session.session_id() {
            return Err(MessageError::SessionIdMismatch {
                expected: session.session_id(),
                received,
            });
        }

        let plaintext = Zeroizing::new(self.codec.decode(
            session,
            Direction::Response,
            envelope.payload,
        )?);
        let message = decode_app_message(&plaintext, self.app_alignment)?;
        if message.message_type != app_type {
            return Err(MessageError::UnexpectedAppMessageType(
                message.message_type,
            ));
        }
        Ok(message.payload.to_vec())
    }
}

fn check_size(transport: &ChannelTransport, size: usize) -> Result<(), MessageError> {
    let max = transport.max_envelope_size().min(u16::MAX as usize);
    if size > max {
        return Err(MessageError::RequestTooLarge { size, max });
    }
    Ok(())
}

/// Byte-level access to the peer for the session protocol engine.
///
/// The engine never sees key material; it only hands over message bytes and
/// gets the peer's reply back.
pub trait PeerIo {
    /// Sends one protocol message and waits for the reply.
    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, MessageError>;
}

/// [`PeerIo`] for messages sent before a session exists.
pub struct HandshakeIo<'a> {
    pipeline: &'a MessagePipeline,
    transport: &'a mut ChannelTransport,
}

impl PeerIo for HandshakeIo<'_> {
    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, MessageError> {
        self.pipeline.exchange_handshake(self.transport, request)
    }
}

/// [`PeerIo`] for session protocol messages sent inside an established
/// session.
pub struct SecuredIo<'a> {
    pipeline: &'a MessagePipeline,
    transport: &'a mut ChannelTransport,
    session: &'a mut Session,
}

impl PeerIo for SecuredIo<'_> {
    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, MessageError> {
        self.pipeline.exchange_secured(
            self.transport,
            self.session,
            AppMessageType::GENERIC,
            request,
        )
    }
}

/// The pipeline and channel, from which either kind of [`PeerIo`] is made.
pub struct PeerLink<'a> {
    pipeline: &'a MessagePipeline,
    transport: &'a mut ChannelTransport,
}

impl<'a> PeerLink<'a> {
    /// Pairs `pipeline` with `transport`.
    pub fn new(pipeline: &'a MessagePipeline, transport: &'a mut ChannelTransport) -> Self {
        Self {
            pipeline,
            transport,
        }
    }

    /// Plaintext access for the handshake.
    pub fn handshake(&mut self) -> HandshakeIo<'_> {
        HandshakeIo {
            pipeline: self.pipeline,
            transport: &mut *self.transport,
        }
    }

    /// Protected access under `session`.
    pub fn secured<'b>(&'b mut self, session: &'b mut Session) -> SecuredIo<'b> {
        SecuredIo {
            pipeline: self.pipeline,
            transport: &mut *self.transport,
            session,
        }
    }
}
