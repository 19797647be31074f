// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Adapter between encoded envelopes and the host-mediated channel.
//!
//! The guest never hands trust-domain-private memory to the host. Every
//! envelope is staged in a fixed, host-visible buffer owned by
//! [`ChannelTransport`], prefixed with a channel service header, and replies
//! are copied out of that buffer before any of their contents are examined.

use std::time::Duration;
use thiserror::Error;
use vtpm_session_protocol::CHANNEL_HEADER_SIZE;
use vtpm_session_protocol::CHANNEL_SERVICE_VERSION;
use vtpm_session_protocol::CHANNEL_STATUS_SUCCESS;
use vtpm_session_protocol::ChannelCommand;
use vtpm_session_protocol::ChannelRequestHeader;
use vtpm_session_protocol::ChannelResponseHeader;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Failure reported by a [`HostChannel`].
#[derive(Debug, Error)]
pub enum HostChannelError {
    /// The call did not complete within its timeout.
    #[error("host channel call timed out")]
    Timeout,
    /// The host refused the request.
    #[error("host rejected the request with status {0:#x}")]
    Rejected(u16),
    /// Any other channel failure.
    #[error("host channel failure")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// The blocking, byte-oriented channel to the host.
///
/// `buf` always points into the host-visible buffer.
pub trait HostChannel: Send {
    /// Delivers `buf` to the host.
    fn send(&mut self, buf: &[u8], timeout: Duration) -> Result<(), HostChannelError>;

    /// Waits for the host's reply to be placed into `buf`, returning its
    /// length.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, HostChannelError>;
}

/// Errors from [`ChannelTransport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The call did not complete within its timeout.
    #[error("channel call timed out")]
    Timeout,
    /// The host reported a failure.
    #[error("channel rejected the request with status {status:#x}")]
    ChannelRejected {
        /// Host status code.
        status: u16,
    },
    /// The host's reply is not a well-formed channel response.
    #[error("malformed channel response")]
    MalformedResponse,
    /// The envelope does not fit the shared buffer.
    #[error("shared buffer too small, {required} bytes required")]
    BufferTooSmall {
        /// Buffer bytes needed, including the service header.
        required: usize,
    },
    /// Any other channel failure.
    #[error("channel failure")]
    Channel(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<HostChannelError> for TransportError {
    fn from(value: HostChannelError) -> Self {
        match value {
            HostChannelError::Timeout => TransportError::Timeout,
            HostChannelError::Rejected(status) => TransportError::ChannelRejected { status },
            HostChannelError::Failed(err) => TransportError::Channel(err),
        }
    }
}

/// Stages envelopes in the shared buffer and performs the blocking round
/// trip.
///
/// The shared buffer is held from [`write`](Self::write) until the matching
/// [`read`](Self::read). Writing again while it is held is a bug in the
/// caller and panics. No call is ever retried here.
pub struct ChannelTransport {
    channel: Box<dyn HostChannel>,
    buffer: Vec<u8>,
    in_flight: bool,
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("buffer_size", &self.buffer.len())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl ChannelTransport {
    /// Creates an adapter with a shared buffer of `buffer_size` bytes.
    pub fn new(channel: Box<dyn HostChannel>, buffer_size: usize) -> Self {
        assert!(buffer_size > CHANNEL_HEADER_SIZE);
        Self {
            channel,
            buffer: vec![0; buffer_size],
            in_flight: false,
        }
    }

    /// The largest envelope a single write can carry.
    pub fn max_envelope_size(&self) -> usize {
        self.buffer.len() - CHANNEL_HEADER_SIZE
    }

    /// Whether a write is waiting for its read.
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Stages `envelope` in the shared buffer and sends it to the host.
    pub fn write(&mut self, envelope: &[u8], timeout: Duration) -> Result<(), TransportError> {
        assert!(!self.in_flight, "shared channel buffer already in use");

        let required = CHANNEL_HEADER_SIZE + envelope.len();
        if required > self.buffer.len() {
            return Err(TransportError::BufferTooSmall { required });
        }
        let length = u32::try_from(envelope.len())
            .map_err(|_| TransportError::BufferTooSmall { required })?;

        let header = ChannelRequestHeader {
            version: CHANNEL_SERVICE_VERSION,
            command: ChannelCommand::VTPM_MESSAGE,
            reserved: [0; 2],
            length: length.into(),
        };
        self.buffer[..CHANNEL_HEADER_SIZE].copy_from_slice(header.as_bytes());
        self.buffer[CHANNEL_HEADER_SIZE..required].copy_from_slice(envelope);

        self.in_flight = true;
        if let Err(err) = self.channel.send(&self.buffer[..required], timeout) {
            self.in_flight = false;
            return Err(err.into());
        }
        tracing::trace!(len = envelope.len(), "sent envelope");
        Ok(())
    }

    /// Waits for the host's reply to the last write and returns a private
    /// copy of the envelope it carries. Releases the shared buffer whatever
    /// the outcome.
    pub fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        assert!(self.in_flight, "channel read without a pending write");
        self.in_flight = false;

        let received = self.channel.receive(&mut self.buffer, timeout)?;
        if received > self.buffer.len() {
            return Err(TransportError::MalformedResponse);
        }
        let reply = &self.buffer[..received];

        let (header, body) = ChannelResponseHeader::read_from_prefix(reply)
            .map_err(|_| TransportError::MalformedResponse)?;
        if header.version != CHANNEL_SERVICE_VERSION
            || header.command != ChannelCommand::VTPM_MESSAGE
        {
            return Err(TransportError::MalformedResponse);
        }
        let status = header.status.get();
        if status != CHANNEL_STATUS_SUCCESS {
            return Err(TransportError::ChannelRejected { status });
        }
        let length = header.length.get() as usize;
        if length > body.len() {
            return Err(TransportError::MalformedResponse);
        }

        tracing::trace!(len = length, "received envelope");
        Ok(body[..length].to_vec())
    }

    /// One write followed by its read.
    pub fn round_trip(
        &mut self,
        envelope: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.write(envelope, timeout)?;
        self.read(timeout)
    }
}
