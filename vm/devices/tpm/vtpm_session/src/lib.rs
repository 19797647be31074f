// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Secured session between a confidential guest and its vTPM service.
//!
//! The vTPM service runs outside the guest's trust boundary and is reachable
//! only through a host-mediated channel that may observe, drop, reorder,
//! replay or modify any byte. This crate authenticates the service through
//! its attestation-backed certificate, runs a key exchange, and from then on
//! carries every vTPM command in an AES-256-GCM protected record with strict
//! sequence numbering.
//!
//! Surrounding code only uses [`SessionManager`]:
//!
//! - [`SessionManager::connect`] runs the handshake unless a session is
//!   already live.
//! - [`SessionManager::send_receive`] carries one command and its response.
//!   Any integrity failure tears the session down; the caller reconnects.
//! - [`SessionManager::disconnect`] ends the session, always dropping local
//!   state even if the service does not answer.
//!
//! The key-exchange protocol engine, attestation evidence verifier,
//! measurement log and host channel are supplied by the caller through the
//! [`SessionProtocolEngine`], [`EvidenceVerifier`], [`MeasurementLog`] and
//! [`HostChannel`] traits.

#![forbid(unsafe_code)]

pub mod channel;
pub mod config;
mod cursor;
pub mod framer;
pub mod handshake;
pub mod message;
pub mod record;
pub mod store;

#[cfg(test)]
mod tests;

#[cfg(any(test, feature = "test_helpers"))]
pub mod test_helpers;

pub use channel::HostChannel;
pub use channel::HostChannelError;
pub use config::ConfigError;
pub use config::SessionConfig;
pub use handshake::EvidenceError;
pub use handshake::EvidenceVerifier;
pub use handshake::HandshakeError;
pub use handshake::HandshakeState;
pub use handshake::MeasurementEvent;
pub use handshake::MeasurementLog;
pub use handshake::NegotiatedSession;
pub use handshake::SessionProtocolEngine;
pub use message::MessageError;
pub use message::PeerIo;
pub use vtpm_session_protocol::SessionPolicy;

use channel::ChannelTransport;
use handshake::HandshakeOrchestrator;
use message::MessagePipeline;
use message::PeerLink;
use store::SessionStore;
use thiserror::Error;
use vtpm_session_protocol::AppMessageType;

/// Error returned by [`SessionManager::connect`].
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The handshake failed. No session is stored.
    #[error("failed to establish vtpm session")]
    Handshake(#[source] HandshakeError),
}

/// Error returned by [`SessionManager::send_receive`].
#[derive(Debug, Error)]
pub enum SendReceiveError {
    /// No session is established.
    #[error("no vtpm session established")]
    NotConnected,
    /// The response does not fit the caller's buffer. The session is intact
    /// but the response is lost.
    #[error("response buffer too small, {required} bytes required")]
    ResponseBufferTooSmall {
        /// Length of the response.
        required: usize,
    },
    /// The exchange failed. See [`MessageError::is_session_fatal`] for
    /// whether the session survived.
    #[error("vtpm session exchange failed")]
    Channel(#[source] MessageError),
}

/// Error returned by [`SessionManager::disconnect`].
#[derive(Debug, Error)]
pub enum DisconnectError {
    /// The service did not acknowledge the end of the session. Local session
    /// state is dropped regardless.
    #[error("vtpm service did not acknowledge session end")]
    EndSession(#[source] HandshakeError),
}

/// The only entry point for code talking to the vTPM service.
///
/// One session, one caller, one request in flight at a time.
pub struct SessionManager {
    config: SessionConfig,
    pipeline: MessagePipeline,
    transport: ChannelTransport,
    orchestrator: HandshakeOrchestrator,
    store: SessionStore,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("transport", &self.transport)
            .field("orchestrator", &self.orchestrator)
            .field("session_id", &self.session_id())
            .finish()
    }
}

impl SessionManager {
    /// Creates a manager with no session.
    pub fn new(
        config: SessionConfig,
        engine: Box<dyn SessionProtocolEngine>,
        verifier: Box<dyn EvidenceVerifier>,
        log: Box<dyn MeasurementLog>,
        channel: Box<dyn HostChannel>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            pipeline: MessagePipeline::new(&config),
            transport: ChannelTransport::new(channel, config.channel_buffer_size),
            orchestrator: HandshakeOrchestrator::new(engine, verifier, log, config.measure_once),
            store: SessionStore::new(),
            config,
        })
    }

    /// Establishes a session unless one is already live.
    #[tracing::instrument(skip(self))]
    pub fn connect(&mut self) -> Result<(), ConnectError> {
        if let Some(session) = self.store.get() {
            tracing::debug!(session_id = session.session_id(), "already connected");
            return Ok(());
        }

        let mut link = PeerLink::new(&self.pipeline, &mut self.transport);
        self.orchestrator
            .establish(&mut link, self.config.session_policy, &mut self.store)
            .map_err(ConnectError::Handshake)?;
        Ok(())
    }

    /// Whether a usable session is established.
    pub fn is_connected(&self) -> bool {
        self.store.is_valid()
    }

    /// Sends one vTPM command and copies the response into `response`,
    /// returning its length.
    #[tracing::instrument(skip_all, fields(request_len = request.len()))]
    pub fn send_receive(
        &mut self,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<usize, SendReceiveError> {
        let session = self
            .store
            .get_mut()
            .ok_or(SendReceiveError::NotConnected)?;
        let session_id = session.session_id();

        let reply = match self.pipeline.exchange_secured(
            &mut self.transport,
            session,
            AppMessageType::APPLICATION,
            request,
        ) {
            Ok(reply) => reply,
            Err(err) => {
                if err.is_session_fatal() {
                    tracing::error!(
                        session_id,
                        error = &err as &dyn std::error::Error,
                        "vtpm session exchange failed, invalidating session"
                    );
                    self.orchestrator.invalidate(&mut self.store);
                } else {
                    tracing::warn!(
                        session_id,
                        error = &err as &dyn std::error::Error,
                        "vtpm session exchange refused"
                    );
                }
                return Err(SendReceiveError::Channel(err));
            }
        };

        let Some(out) = response.get_mut(..reply.len()) else {
            return Err(SendReceiveError::ResponseBufferTooSmall {
                required: reply.len(),
            });
        };
        out.copy_from_slice(&reply);
        Ok(reply.len())
    }

    /// Ends the session. Local state is always dropped; an error only means
    /// the service did not acknowledge. Safe to call when not connected.
    #[tracing::instrument(skip(self))]
    pub fn disconnect(&mut self) -> Result<(), DisconnectError> {
        let session_id = self.session_id();
        let mut link = PeerLink::new(&self.pipeline, &mut self.transport);
        let result = self.orchestrator.end_session(&mut link, &mut self.store);
        if let Some(session_id) = session_id {
            match &result {
                Ok(()) => tracing::info!(session_id, "vtpm session ended"),
                Err(err) => tracing::warn!(
                    session_id,
                    error = err as &dyn std::error::Error,
                    "vtpm session dropped without acknowledgement"
                ),
            }
        }
        result.map_err(DisconnectError::EndSession)
    }

    /// Id of the live session, for diagnostics.
    pub fn session_id(&self) -> Option<u32> {
        self.store.get().map(|s| s.session_id())
    }

    /// Handshake state, for diagnostics.
    pub fn state(&self) -> HandshakeState {
        self.orchestrator.state()
    }
}
