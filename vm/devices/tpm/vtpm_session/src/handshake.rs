// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Remote authentication, key exchange and measurement binding.
//!
//! The orchestrator drives an external [`SessionProtocolEngine`] through
//! `Uninitialized -> Initialized -> Authenticated -> SessionEstablished`. Any
//! failure moves it to `Failed` with the session store empty, and every
//! attempt that gets past the initial checks leaves exactly one event in the
//! [`MeasurementLog`].

use crate::message::PeerIo;
use crate::message::PeerLink;
use crate::store::DirectionKeys;
use crate::store::Session;
use crate::store::SessionStore;
use crate::store::StoreError;
use sha2::Digest;
use sha2::Sha384;
use thiserror::Error;
use vtpm_session_protocol::CipherSuite;
use vtpm_session_protocol::SessionPolicy;

/// Error type returned by the collaborators.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// Size of a SHA-384 digest.
pub const MEASUREMENT_DIGEST_SIZE: usize = 48;

/// Domain separator hashed in front of the session binding.
const SESSION_BINDING_LABEL: &[u8] = b"vtpm-session-binding";

/// What a successful key exchange yields.
#[derive(Debug)]
pub struct NegotiatedSession {
    /// Nonzero session id agreed with the peer.
    pub session_id: u32,
    /// Negotiated protocol version.
    pub protocol_version: u8,
    /// Negotiated secured-message version.
    pub secured_protocol_version: u8,
    /// Negotiated AEAD suite.
    pub cipher_suite: CipherSuite,
    /// Guest-to-service keys.
    pub request: DirectionKeys,
    /// Service-to-guest keys.
    pub response: DirectionKeys,
}

/// The key-exchange and authentication protocol engine.
///
/// The engine reaches the peer only through the [`PeerIo`] it is handed.
/// Before a session exists that is a plaintext handshake channel; for
/// [`end_session`](Self::end_session) it is the protected session itself.
pub trait SessionProtocolEngine: Send {
    /// Returns the SHA-384 digest the peer reports for its certificate chain.
    fn get_digest(&mut self, peer: &mut dyn PeerIo) -> Result<Vec<u8>, CollaboratorError>;

    /// Retrieves the peer's certificate chain.
    fn get_certificate(&mut self, peer: &mut dyn PeerIo) -> Result<Vec<u8>, CollaboratorError>;

    /// Proves the peer holds the key of the retrieved certificate, now.
    fn challenge(&mut self, peer: &mut dyn PeerIo) -> Result<(), CollaboratorError>;

    /// Runs the key exchange transcript under `policy`.
    fn key_exchange(
        &mut self,
        peer: &mut dyn PeerIo,
        policy: SessionPolicy,
    ) -> Result<NegotiatedSession, CollaboratorError>;

    /// Asks the peer to terminate `session_id`.
    fn end_session(
        &mut self,
        peer: &mut dyn PeerIo,
        session_id: u32,
    ) -> Result<(), CollaboratorError>;
}

/// Why the peer's attestation evidence was not accepted.
#[derive(Debug, Error)]
pub enum EvidenceError {
    /// The certificate chain carries no attestation evidence.
    #[error("certificate chain carries no attestation evidence")]
    Missing,
    /// The evidence is present but failed verification.
    #[error("attestation evidence rejected")]
    Rejected(#[source] CollaboratorError),
}

/// Verifies the hardware attestation evidence embedded in a certificate
/// chain.
pub trait EvidenceVerifier: Send {
    /// Accepts or rejects the evidence in `certificate_chain`.
    fn verify(&mut self, certificate_chain: &[u8]) -> Result<(), EvidenceError>;
}

/// A session event extended into the measurement log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeasurementEvent {
    /// Digest binding the established session's public parameters.
    SessionEstablished([u8; MEASUREMENT_DIGEST_SIZE]),
    /// Random value distinguishing a failed attempt.
    SessionFailed([u8; MEASUREMENT_DIGEST_SIZE]),
}

/// The trust domain's append-only measurement log.
pub trait MeasurementLog: Send {
    /// Extends `event` into the log.
    fn extend(&mut self, event: &MeasurementEvent) -> Result<(), CollaboratorError>;

    /// Whether any session event has been extended since boot.
    fn has_session_event(&self) -> Result<bool, CollaboratorError>;
}

/// Handshake progress.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    /// No handshake in progress and no session.
    Uninitialized,
    /// Ready to authenticate.
    Initialized,
    /// The peer is authenticated.
    Authenticated,
    /// A session is stored and usable.
    SessionEstablished,
    /// The last attempt or session failed. Nothing is stored.
    Failed,
}

/// Errors from the handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// A step was invoked out of order.
    #[error("operation not valid in state {0:?}")]
    InvalidState(HandshakeState),
    /// The measurement log already evidences a session attempt.
    #[error("a session attempt is already measured")]
    AlreadyMeasured,
    /// Retrieving the peer's digests failed.
    #[error("failed to get peer digests")]
    Digest(#[source] CollaboratorError),
    /// Retrieving the peer's certificate chain failed.
    #[error("failed to get peer certificate")]
    Certificate(#[source] CollaboratorError),
    /// The certificate chain does not match the reported digest.
    #[error("peer certificate chain does not match its digest")]
    CertificateDigestMismatch,
    /// The attestation evidence was missing or rejected.
    #[error("peer attestation evidence not accepted")]
    Evidence(#[source] EvidenceError),
    /// The liveness challenge failed.
    #[error("peer challenge failed")]
    Challenge(#[source] CollaboratorError),
    /// The key exchange failed.
    #[error("key exchange failed")]
    KeyExchange(#[source] CollaboratorError),
    /// The key exchange settled on a cipher suite other than AES-256-GCM.
    #[error("unsupported cipher suite {0:?}")]
    UnsupportedCipherSuite(CipherSuite),
    /// The negotiated session could not be stored.
    #[error("failed to store session")]
    Store(#[source] StoreError),
    /// The measurement log could not be read or extended.
    #[error("measurement log failure")]
    Measurement(#[source] CollaboratorError),
    /// The peer did not acknowledge the end of the session.
    #[error("failed to end session")]
    EndSession(#[source] CollaboratorError),
}

/// Drives the session protocol engine and owns the collaborators.
pub struct HandshakeOrchestrator {
    engine: Box<dyn SessionProtocolEngine>,
    verifier: Box<dyn EvidenceVerifier>,
    log: Box<dyn MeasurementLog>,
    measure_once: bool,
    state: HandshakeState,
    peer_chain_digest: Option<[u8; MEASUREMENT_DIGEST_SIZE]>,
}

impl std::fmt::Debug for HandshakeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeOrchestrator")
            .field("measure_once", &self.measure_once)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl HandshakeOrchestrator {
    /// Creates an orchestrator in the `Uninitialized` state.
    pub fn new(
        engine: Box<dyn SessionProtocolEngine>,
        verifier: Box<dyn EvidenceVerifier>,
        log: Box<dyn MeasurementLog>,
        measure_once: bool,
    ) -> Self {
        Self {
            engine,
            verifier,
            log,
            measure_once,
            state: HandshakeState::Uninitialized,
            peer_chain_digest: None,
        }
    }

    /// Current handshake state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Prepares a new attempt. Only refuses in measure-once mode, and then
    /// leaves the log untouched.
    pub fn initialize(&mut self) -> Result<(), HandshakeError> {
        match self.state {
            HandshakeState::Uninitialized | HandshakeState::Failed => {}
            state => return Err(HandshakeError::InvalidState(state)),
        }

        if self.measure_once
            && self
                .log
                .has_session_event()
                .map_err(HandshakeError::Measurement)?
        {
            tracing::error!("refusing handshake, a session attempt is already measured");
            self.state = HandshakeState::Failed;
            return Err(HandshakeError::AlreadyMeasured);
        }

        self.peer_chain_digest = None;
        self.state = HandshakeState::Initialized;
        Ok(())
    }

    /// Authenticates the peer: digest, certificate chain, attestation
    /// evidence, then a liveness challenge, strictly in that order.
    pub fn authenticate(&mut self, peer: &mut dyn PeerIo) -> Result<(), HandshakeError> {
        if self.state != HandshakeState::Initialized {
            return Err(HandshakeError::InvalidState(self.state));
        }

        match self.authenticate_inner(peer) {
            Ok(chain_digest) => {
                self.peer_chain_digest = Some(chain_digest);
                self.state = HandshakeState::Authenticated;
                tracing::debug!("peer authenticated");
                Ok(())
            }
            Err(err) => {
                self.state = HandshakeState::Failed;
                Err(err)
            }
        }
    }

    fn authenticate_inner(
        &mut self,
        peer: &mut dyn PeerIo,
    ) -> Result<[u8; MEASUREMENT_DIGEST_SIZE], HandshakeError> {
        let reported = self
            .engine
            .get_digest(peer)
            .map_err(HandshakeError::Digest)?;
        let chain = self
            .engine
            .get_certificate(peer)
            .map_err(HandshakeError::Certificate)?;

        let mut chain_digest = [0; MEASUREMENT_DIGEST_SIZE];
        chain_digest.copy_from_slice(&Sha384::digest(&chain));
        if reported != chain_digest {
            return Err(HandshakeError::CertificateDigestMismatch);
        }

        if let Err(err) = self.verifier.verify(&chain) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "peer attestation evidence not accepted"
            );
            return Err(HandshakeError::Evidence(err));
        }

        self.engine
            .challenge(peer)
            .map_err(HandshakeError::Challenge)?;
        Ok(chain_digest)
    }

    /// Runs the key exchange and stores the resulting session, returning its
    /// id. The store must be empty.
    pub fn start_session(
        &mut self,
        peer: &mut dyn PeerIo,
        policy: SessionPolicy,
        store: &mut SessionStore,
    ) -> Result<u32, HandshakeError> {
        if self.state != HandshakeState::Authenticated {
            return Err(HandshakeError::InvalidState(self.state));
        }

        match self.start_session_inner(peer, policy, store) {
            Ok(session_id) => {
                self.state = HandshakeState::SessionEstablished;
                Ok(session_id)
            }
            Err(err) => {
                store.clear();
                self.state = HandshakeState::Failed;
                Err(err)
            }
        }
    }

    fn start_session_inner(
        &mut self,
        peer: &mut dyn PeerIo,
        policy: SessionPolicy,
        store: &mut SessionStore,
    ) -> Result<u32, HandshakeError> {
        let negotiated = self
            .engine
            .key_exchange(peer, policy)
            .map_err(HandshakeError::KeyExchange)?;

        if negotiated.cipher_suite != CipherSuite::AES_256_GCM {
            tracing::error!(
                cipher_suite = ?negotiated.cipher_suite,
                "peer negotiated an unsupported cipher suite"
            );
            if let Err(err) = self.engine.end_session(peer, negotiated.session_id) {
                tracing::warn!(
                    error = err.as_ref() as &dyn std::error::Error,
                    "failed to end half-open session"
                );
            }
            return Err(HandshakeError::UnsupportedCipherSuite(
                negotiated.cipher_suite,
            ));
        }

        let session = Session::new(
            negotiated.session_id,
            negotiated.protocol_version,
            negotiated.secured_protocol_version,
            negotiated.cipher_suite,
            policy,
            negotiated.request,
            negotiated.response,
        )
        .map_err(HandshakeError::Store)?;
        let session_id = session.session_id();
        store.put(session).map_err(HandshakeError::Store)?;
        Ok(session_id)
    }

    /// Runs a complete handshake over `link` and measures the outcome.
    ///
    /// Any session left in `store` is discarded first.
    pub fn establish(
        &mut self,
        link: &mut PeerLink<'_>,
        policy: SessionPolicy,
        store: &mut SessionStore,
    ) -> Result<u32, HandshakeError> {
        store.clear();
        if self.state == HandshakeState::SessionEstablished {
            self.state = HandshakeState::Uninitialized;
        }
        self.initialize()?;

        let result = {
            let mut peer = link.handshake();
            self.authenticate(&mut peer)
                .and_then(|()| self.start_session(&mut peer, policy, store))
        };

        match result {
            Ok(session_id) => {
                if let Err(err) = self.measure_established(store) {
                    store.clear();
                    self.state = HandshakeState::Failed;
                    return Err(err);
                }
                tracing::info!(session_id, "vtpm session established");
                Ok(session_id)
            }
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "vtpm session handshake failed"
                );
                self.measure_failed();
                Err(err)
            }
        }
    }

    /// Asks the peer to end the session, then drops it locally whatever the
    /// peer said. Safe in any state.
    pub fn end_session(
        &mut self,
        link: &mut PeerLink<'_>,
        store: &mut SessionStore,
    ) -> Result<(), HandshakeError> {
        let result = match store.get_mut() {
            Some(session) => {
                let session_id = session.session_id();
                let mut peer = link.secured(session);
                self.engine
                    .end_session(&mut peer, session_id)
                    .map_err(HandshakeError::EndSession)
            }
            None => Ok(()),
        };

        store.clear();
        self.peer_chain_digest = None;
        self.state = HandshakeState::Uninitialized;
        result
    }

    /// Drops the session after it proved untrustworthy.
    pub fn invalidate(&mut self, store: &mut SessionStore) {
        store.clear();
        self.peer_chain_digest = None;
        self.state = HandshakeState::Failed;
    }

    fn measure_established(&mut self, store: &SessionStore) -> Result<(), HandshakeError> {
        let (Some(session), Some(chain_digest)) = (store.get(), self.peer_chain_digest.as_ref())
        else {
            return Err(HandshakeError::InvalidState(self.state));
        };
        let event = MeasurementEvent::SessionEstablished(binding_digest(session, chain_digest));
        self.log
            .extend(&event)
            .map_err(HandshakeError::Measurement)
    }

    fn measure_failed(&mut self) {
        let mut value = [0; MEASUREMENT_DIGEST_SIZE];
        if let Err(err) = getrandom::fill(&mut value) {
            tracing::error!(%err, "failed to generate failed-session measurement");
            return;
        }
        if let Err(err) = self.log.extend(&MeasurementEvent::SessionFailed(value)) {
            tracing::error!(
                error = err.as_ref() as &dyn std::error::Error,
                "failed to measure failed session"
            );
        }
    }
}

/// Hashes the public parameters that identify an established session.
pub fn binding_digest(
    session: &Session,
    peer_chain_digest: &[u8; MEASUREMENT_DIGEST_SIZE],
) -> [u8; MEASUREMENT_DIGEST_SIZE] {
    let mut hasher = Sha384::new();
    hasher.update(SESSION_BINDING_LABEL);
    hasher.update(session.session_id().to_le_bytes());
    hasher.update([
        session.protocol_version(),
        session.secured_protocol_version(),
    ]);
    hasher.update(session.cipher_suite().0.to_le_bytes());
    hasher.update([session.policy().into_bits()]);
    hasher.update(peer_chain_digest);

    let mut digest = [0; MEASUREMENT_DIGEST_SIZE];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageError;
    use crate::store::tests::test_session;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Engine whose steps succeed or fail as scripted, without a peer.
    #[derive(Default)]
    struct ScriptedEngine {
        chain: Vec<u8>,
        wrong_digest: bool,
        fail_challenge: bool,
        cipher_suite: Option<CipherSuite>,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl SessionProtocolEngine for ScriptedEngine {
        fn get_digest(&mut self, _peer: &mut dyn PeerIo) -> Result<Vec<u8>, CollaboratorError> {
            self.calls.lock().push("get_digest");
            let mut digest = Sha384::digest(&self.chain).to_vec();
            if self.wrong_digest {
                digest[0] ^= 1;
            }
            Ok(digest)
        }

        fn get_certificate(
            &mut self,
            _peer: &mut dyn PeerIo,
        ) -> Result<Vec<u8>, CollaboratorError> {
            self.calls.lock().push("get_certificate");
            Ok(self.chain.clone())
        }

        fn challenge(&mut self, _peer: &mut dyn PeerIo) -> Result<(), CollaboratorError> {
            self.calls.lock().push("challenge");
            if self.fail_challenge {
                return Err("bad signature".into());
            }
            Ok(())
        }

        fn key_exchange(
            &mut self,
            _peer: &mut dyn PeerIo,
            _policy: SessionPolicy,
        ) -> Result<NegotiatedSession, CollaboratorError> {
            self.calls.lock().push("key_exchange");
            let keys = || DirectionKeys::new(&[1; 32], &[2; 12]).unwrap();
            Ok(NegotiatedSession {
                session_id: 7,
                protocol_version: 0x12,
                secured_protocol_version: 0x11,
                cipher_suite: self.cipher_suite.unwrap_or(CipherSuite::AES_256_GCM),
                request: keys(),
                response: keys(),
            })
        }

        fn end_session(
            &mut self,
            _peer: &mut dyn PeerIo,
            _session_id: u32,
        ) -> Result<(), CollaboratorError> {
            self.calls.lock().push("end_session");
            Ok(())
        }
    }

    struct NullPeer;

    impl PeerIo for NullPeer {
        fn exchange(&mut self, _request: &[u8]) -> Result<Vec<u8>, MessageError> {
            Ok(Vec::new())
        }
    }

    struct Verifier(Option<EvidenceError>);

    impl EvidenceVerifier for Verifier {
        fn verify(&mut self, _certificate_chain: &[u8]) -> Result<(), EvidenceError> {
            self.0.take().map_or(Ok(()), Err)
        }
    }

    #[derive(Default)]
    struct Log {
        events: VecDeque<MeasurementEvent>,
    }

    impl MeasurementLog for Log {
        fn extend(&mut self, event: &MeasurementEvent) -> Result<(), CollaboratorError> {
            self.events.push_back(event.clone());
            Ok(())
        }

        fn has_session_event(&self) -> Result<bool, CollaboratorError> {
            Ok(!self.events.is_empty())
        }
    }

    fn orchestrator(engine: ScriptedEngine, verifier: Verifier) -> HandshakeOrchestrator {
        orchestrator_with_calls(engine, verifier).0
    }

    fn orchestrator_with_calls(
        engine: ScriptedEngine,
        verifier: Verifier,
    ) -> (HandshakeOrchestrator, Arc<Mutex<Vec<&'static str>>>) {
        let calls = engine.calls.clone();
        let orchestrator = HandshakeOrchestrator::new(
            Box::new(ScriptedEngine {
                chain: b"certificate chain".to_vec(),
                ..engine
            }),
            Box::new(verifier),
            Box::new(Log::default()),
            false,
        );
        (orchestrator, calls)
    }

    #[test]
    fn state_machine_happy_path() {
        let mut orchestrator = orchestrator(ScriptedEngine::default(), Verifier(None));
        let mut store = SessionStore::new();
        assert_eq!(orchestrator.state(), HandshakeState::Uninitialized);

        assert!(matches!(
            orchestrator.authenticate(&mut NullPeer),
            Err(HandshakeError::InvalidState(HandshakeState::Uninitialized))
        ));

        orchestrator.initialize().unwrap();
        assert_eq!(orchestrator.state(), HandshakeState::Initialized);
        assert!(matches!(
            orchestrator.start_session(&mut NullPeer, SessionPolicy::new(), &mut store),
            Err(HandshakeError::InvalidState(HandshakeState::Initialized))
        ));

        orchestrator.authenticate(&mut NullPeer).unwrap();
        assert_eq!(orchestrator.state(), HandshakeState::Authenticated);
        let session_id = orchestrator
            .start_session(&mut NullPeer, SessionPolicy::new(), &mut store)
            .unwrap();
        assert_eq!(session_id, 7);
        assert_eq!(orchestrator.state(), HandshakeState::SessionEstablished);
        assert!(store.is_valid());
    }

    #[test]
    fn rejected_evidence_stops_before_challenge() {
        let (mut orchestrator, calls) = orchestrator_with_calls(
            ScriptedEngine::default(),
            Verifier(Some(EvidenceError::Rejected("bad report".into()))),
        );
        orchestrator.initialize().unwrap();
        let err = orchestrator.authenticate(&mut NullPeer).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Evidence(EvidenceError::Rejected(_))
        ));
        assert_eq!(orchestrator.state(), HandshakeState::Failed);
        assert_eq!(*calls.lock(), ["get_digest", "get_certificate"]);
    }

    #[test]
    fn missing_evidence_is_distinct() {
        let mut orchestrator =
            orchestrator(ScriptedEngine::default(), Verifier(Some(EvidenceError::Missing)));
        orchestrator.initialize().unwrap();
        assert!(matches!(
            orchestrator.authenticate(&mut NullPeer),
            Err(HandshakeError::Evidence(EvidenceError::Missing))
        ));
    }

    #[test]
    fn digest_must_match_chain() {
        let mut orchestrator = orchestrator(
            ScriptedEngine {
                wrong_digest: true,
                ..Default::default()
            },
            Verifier(None),
        );
        orchestrator.initialize().unwrap();
        assert!(matches!(
            orchestrator.authenticate(&mut NullPeer),
            Err(HandshakeError::CertificateDigestMismatch)
        ));
    }

    #[test]
    fn failed_challenge() {
        let mut orchestrator = orchestrator(
            ScriptedEngine {
                fail_challenge: true,
                ..Default::default()
            },
            Verifier(None),
        );
        orchestrator.initialize().unwrap();
        assert!(matches!(
            orchestrator.authenticate(&mut NullPeer),
            Err(HandshakeError::Challenge(_))
        ));
        assert_eq!(orchestrator.state(), HandshakeState::Failed);
        orchestrator.initialize().unwrap();
    }

    #[test]
    fn unsupported_cipher_suite_leaves_store_empty() {
        let (mut orchestrator, calls) = orchestrator_with_calls(
            ScriptedEngine {
                cipher_suite: Some(CipherSuite(0x0001)),
                ..Default::default()
            },
            Verifier(None),
        );
        let mut store = SessionStore::new();
        orchestrator.initialize().unwrap();
        orchestrator.authenticate(&mut NullPeer).unwrap();
        assert!(matches!(
            orchestrator.start_session(&mut NullPeer, SessionPolicy::new(), &mut store),
            Err(HandshakeError::UnsupportedCipherSuite(CipherSuite(1)))
        ));
        assert!(!store.is_valid());
        assert_eq!(orchestrator.state(), HandshakeState::Failed);
        assert_eq!(calls.lock().last(), Some(&"end_session"));
    }

    #[test]
    fn occupied_store_fails_key_exchange_cleanly() {
        let mut orchestrator = orchestrator(ScriptedEngine::default(), Verifier(None));
        let mut store = SessionStore::new();
        store.put(test_session(3)).unwrap();
        orchestrator.initialize().unwrap();
        orchestrator.authenticate(&mut NullPeer).unwrap();
        assert!(matches!(
            orchestrator.start_session(&mut NullPeer, SessionPolicy::new(), &mut store),
            Err(HandshakeError::Store(StoreError::SessionAlreadyExists))
        ));
        assert!(!store.is_valid());
    }

    #[test]
    fn binding_digest_covers_public_parameters() {
        let chain = [0x5a; MEASUREMENT_DIGEST_SIZE];
        let session = test_session(7);
        let digest = binding_digest(&session, &chain);
        assert_eq!(digest, binding_digest(&test_session(7), &chain));
        assert_ne!(digest, binding_digest(&test_session(8), &chain));
        assert_ne!(
            digest,
            binding_digest(&session, &[0x5b; MEASUREMENT_DIGEST_SIZE])
        );

        let mut expected = Sha384::new();
        expected.update(b"vtpm-session-binding");
        expected.update([7, 0, 0, 0, 0x12, 0x11, 0x02, 0x00, 0x00]);
        expected.update(chain);
        assert_eq!(digest[..], expected.finalize()[..]);
    }
}
