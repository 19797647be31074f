// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mock collaborators for exercising a [`SessionManager`](crate::SessionManager)
//! without a host or a real vTPM service.
//!
//! [`MockVtpmService`] plays the peer end of the host channel and
//! [`MockSessionEngine`] the guest end of a minimal key-exchange protocol they
//! both understand. Every mock is a cheap clone around shared state, so a test
//! keeps one clone for inspection and fault injection and hands the other to
//! the manager.

use crate::channel::HostChannel;
use crate::channel::HostChannelError;
use crate::config::SessionConfig;
use crate::framer::AppMessage;
use crate::framer::app_message_size;
use crate::framer::decode_app_message;
use crate::framer::decode_envelope;
use crate::framer::encode_app_message;
use crate::framer::encode_envelope;
use crate::framer::envelope_size;
use crate::handshake::CollaboratorError;
use crate::handshake::EvidenceError;
use crate::handshake::EvidenceVerifier;
use crate::handshake::MeasurementEvent;
use crate::handshake::MeasurementLog;
use crate::handshake::NegotiatedSession;
use crate::handshake::SessionProtocolEngine;
use crate::message::PeerIo;
use crate::record::RecordCodec;
use crate::store::Direction;
use crate::store::DirectionKeys;
use crate::store::Session;
use parking_lot::Mutex;
use sha2::Digest;
use sha2::Sha384;
use std::sync::Arc;
use std::time::Duration;
use vtpm_session_protocol::AEAD_IV_SIZE;
use vtpm_session_protocol::AEAD_KEY_SIZE;
use vtpm_session_protocol::AppMessageType;
use vtpm_session_protocol::CHANNEL_HEADER_SIZE;
use vtpm_session_protocol::CHANNEL_SERVICE_VERSION;
use vtpm_session_protocol::CHANNEL_STATUS_SUCCESS;
use vtpm_session_protocol::ChannelCommand;
use vtpm_session_protocol::ChannelRequestHeader;
use vtpm_session_protocol::ChannelResponseHeader;
use vtpm_session_protocol::CipherSuite;
use vtpm_session_protocol::MessageType;
use vtpm_session_protocol::SessionPolicy;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Protocol version the mock service negotiates.
pub const MOCK_PROTOCOL_VERSION: u8 = 0x12;
/// Secured-message version the mock service negotiates.
pub const MOCK_SECURED_PROTOCOL_VERSION: u8 = 0x11;
/// Certificate chain presented by the mock service.
pub const MOCK_CERTIFICATE_CHAIN: &[u8] = b"mock vtpm service certificate chain";

/// Request codes of the mock key-exchange protocol. Replies carry the request
/// code with the top bit cleared.
pub mod code {
    /// Ask for the certificate chain digest.
    pub const GET_DIGESTS: u8 = 0x81;
    /// Ask for the certificate chain.
    pub const GET_CERTIFICATE: u8 = 0x82;
    /// Prove possession of the certificate key over a fresh nonce.
    pub const CHALLENGE: u8 = 0x83;
    /// Agree on a session id and keys.
    pub const KEY_EXCHANGE: u8 = 0xe4;
    /// Terminate the session.
    pub const END_SESSION: u8 = 0xec;
    /// Reply to an unknown request.
    pub const ERROR: u8 = 0x7f;

    /// The reply code for `request`.
    pub const fn reply(request: u8) -> u8 {
        request & 0x7f
    }
}

/// Channel status the mock service reports for a request it cannot process.
pub const MOCK_STATUS_BAD_REQUEST: u16 = 0x0001;
/// Channel status the mock service reports for a record that fails to
/// decrypt.
pub const MOCK_STATUS_BAD_RECORD: u16 = 0x0002;
/// Channel status the mock service reports for a secured message without a
/// session.
pub const MOCK_STATUS_NO_SESSION: u16 = 0x0003;

const RANDOM_SIZE: usize = 32;

/// Derives the direction keys both mock endpoints agree on.
pub fn derive_mock_keys(
    guest_random: &[u8],
    service_random: &[u8],
) -> Result<(DirectionKeys, DirectionKeys), CollaboratorError> {
    let derive = |label: &[u8]| {
        let mut hasher = Sha384::new();
        hasher.update(label);
        hasher.update(guest_random);
        hasher.update(service_random);
        let digest = hasher.finalize();
        DirectionKeys::new(
            &digest[..AEAD_KEY_SIZE],
            &digest[AEAD_KEY_SIZE..AEAD_KEY_SIZE + AEAD_IV_SIZE],
        )
    };
    Ok((derive(b"mock request")?, derive(b"mock response")?))
}

/// One-shot faults the mock service injects into its next reply.
#[derive(Debug, Default, Clone)]
pub struct MockFaults {
    /// Flip a bit in the next reply record's tag.
    pub tamper_next_reply: bool,
    /// Answer the next secured request with the previous secured reply.
    pub replay_next_reply: bool,
    /// Process the next request but let the reply time out.
    pub time_out_next_reply: bool,
    /// Reject the next request with this channel status.
    pub reject_next: Option<u16>,
    /// Address the next secured reply to a different session.
    pub misaddress_next_reply: bool,
    /// Answer every challenge with a bad signature.
    pub fail_challenge: bool,
    /// Answer every key exchange with this cipher suite.
    pub cipher_suite: Option<CipherSuite>,
}

/// What the mock service has seen.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MockServiceStats {
    /// Completed key exchanges.
    pub key_exchanges: usize,
    /// Application messages answered.
    pub application_messages: usize,
    /// Sessions ended at the guest's request.
    pub end_sessions: usize,
    /// Secured records that failed to decode.
    pub rejected_records: usize,
}

struct ServiceState {
    codec: RecordCodec,
    transport_alignment: usize,
    app_alignment: usize,
    next_session_id: u32,
    session: Option<Session>,
    pending: Option<Vec<u8>>,
    last_secured_reply: Option<Vec<u8>>,
    faults: MockFaults,
    stats: MockServiceStats,
}

/// The vTPM service end of the host channel.
#[derive(Clone)]
pub struct MockVtpmService {
    state: Arc<Mutex<ServiceState>>,
}

impl MockVtpmService {
    /// Creates a service that frames messages the way `config` does.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServiceState {
                codec: RecordCodec::from_config(config),
                transport_alignment: config.transport_alignment,
                app_alignment: config.app_alignment,
                next_session_id: 0x1000,
                session: None,
                pending: None,
                last_secured_reply: None,
                faults: MockFaults::default(),
                stats: MockServiceStats::default(),
            })),
        }
    }

    /// Updates the fault configuration.
    pub fn with_faults(&self, f: impl FnOnce(&mut MockFaults)) {
        f(&mut self.state.lock().faults);
    }

    /// Counters of what the service has processed.
    pub fn stats(&self) -> MockServiceStats {
        self.state.lock().stats.clone()
    }

    /// Id of the session the service considers live.
    pub fn session_id(&self) -> Option<u32> {
        self.state.lock().session.as_ref().map(|s| s.session_id())
    }

    /// Policy the guest sent with the key exchange of the live session.
    pub fn session_policy(&self) -> Option<SessionPolicy> {
        self.state.lock().session.as_ref().map(|s| s.policy())
    }

    /// The service's next expected request and next response sequence
    /// numbers.
    pub fn sequence_numbers(&self) -> Option<(u64, u64)> {
        self.state.lock().session.as_ref().map(|s| {
            (
                s.keys(Direction::Request).sequence_number(),
                s.keys(Direction::Response).sequence_number(),
            )
        })
    }
}

impl ServiceState {
    fn process(&mut self, buf: &[u8]) -> (u16, Vec<u8>) {
        let Ok((header, body)) = ChannelRequestHeader::read_from_prefix(buf) else {
            return (MOCK_STATUS_BAD_REQUEST, Vec::new());
        };
        let length = header.length.get() as usize;
        if header.version != CHANNEL_SERVICE_VERSION
            || header.command != ChannelCommand::VTPM_MESSAGE
            || length > body.len()
        {
            return (MOCK_STATUS_BAD_REQUEST, Vec::new());
        }

        let Ok(envelope) = decode_envelope(&body[..length], self.transport_alignment) else {
            return (MOCK_STATUS_BAD_REQUEST, Vec::new());
        };
        match envelope.message_type {
            MessageType::HANDSHAKE => {
                let reply = self.handshake(envelope.payload);
                (CHANNEL_STATUS_SUCCESS, self.frame(MessageType::HANDSHAKE, &reply))
            }
            _ => self.secured(envelope.payload),
        }
    }

    fn handshake(&mut self, request: &[u8]) -> Vec<u8> {
        let Some((&request_code, body)) = request.split_first() else {
            return vec![code::ERROR];
        };
        let mut reply = vec![code::reply(request_code)];
        match request_code {
            code::GET_DIGESTS => reply.extend_from_slice(&Sha384::digest(MOCK_CERTIFICATE_CHAIN)),
            code::GET_CERTIFICATE => reply.extend_from_slice(MOCK_CERTIFICATE_CHAIN),
            code::CHALLENGE => {
                let mut signature = challenge_signature(body);
                if self.faults.fail_challenge {
                    signature[0] ^= 1;
                }
                reply.extend_from_slice(&signature);
            }
            code::KEY_EXCHANGE if body.len() == 1 + RANDOM_SIZE => {
                let policy = SessionPolicy::from_bits(body[0]);
                let mut service_random = [0; RANDOM_SIZE];
                getrandom::fill(&mut service_random).expect("random");
                let (request, response) =
                    derive_mock_keys(&body[1..], &service_random).expect("fixed key sizes");
                let cipher_suite = self.faults.cipher_suite.unwrap_or(CipherSuite::AES_256_GCM);
                let session_id = self.next_session_id;
                self.next_session_id += 1;

                self.session = Some(
                    Session::new(
                        session_id,
                        MOCK_PROTOCOL_VERSION,
                        MOCK_SECURED_PROTOCOL_VERSION,
                        cipher_suite,
                        policy,
                        request,
                        response,
                    )
                    .expect("nonzero session id"),
                );
                self.last_secured_reply = None;
                self.stats.key_exchanges += 1;

                reply.extend_from_slice(&session_id.to_le_bytes());
                reply.extend_from_slice(&cipher_suite.0.to_le_bytes());
                reply.extend_from_slice(&service_random);
            }
            _ => return vec![code::ERROR],
        }
        reply
    }

    fn secured(&mut self, record: &[u8]) -> (u16, Vec<u8>) {
        let Some(session) = self.session.as_mut() else {
            return (MOCK_STATUS_NO_SESSION, Vec::new());
        };
        let Ok(plaintext) = self.codec.decode(session, Direction::Request, record) else {
            self.stats.rejected_records += 1;
            return (MOCK_STATUS_BAD_RECORD, Vec::new());
        };
        let Ok(AppMessage {
            message_type,
            payload,
        }) = decode_app_message(&plaintext, self.app_alignment)
        else {
            return (MOCK_STATUS_BAD_REQUEST, Vec::new());
        };

        let mut end_session = false;
        let reply = match message_type {
            AppMessageType::APPLICATION => {
                self.stats.application_messages += 1;
                payload.to_vec()
            }
            _ if payload.first() == Some(&code::END_SESSION) => {
                end_session = true;
                vec![code::reply(code::END_SESSION)]
            }
            _ => vec![code::ERROR],
        };

        let mut message = vec![0; app_message_size(reply.len(), self.app_alignment)];
        encode_app_message(message_type, &reply, self.app_alignment, &mut message)
            .expect("sized");
        let mut record = vec![0; self.codec.max_record_size(message.len())];
        let record_len = self
            .codec
            .encode(session, Direction::Response, &message, &mut record)
            .expect("sized");
        record.truncate(record_len);

        if std::mem::take(&mut self.faults.tamper_next_reply) {
            record[record_len - 1] ^= 0x80;
        }
        if std::mem::take(&mut self.faults.misaddress_next_reply) {
            let wrong = session.session_id().wrapping_add(1);
            record[..4].copy_from_slice(&wrong.to_le_bytes());
        }
        if end_session {
            self.session = None;
            self.stats.end_sessions += 1;
        }

        let mut envelope = self.frame(MessageType::SECURED, &record);
        if std::mem::take(&mut self.faults.replay_next_reply) {
            if let Some(previous) = self.last_secured_reply.clone() {
                envelope = previous;
            }
        } else {
            self.last_secured_reply = Some(envelope.clone());
        }
        (CHANNEL_STATUS_SUCCESS, envelope)
    }

    fn frame(&self, message_type: MessageType, payload: &[u8]) -> Vec<u8> {
        let mut envelope = vec![0; envelope_size(payload.len(), self.transport_alignment)];
        let len = encode_envelope(message_type, payload, self.transport_alignment, &mut envelope)
            .expect("sized");
        envelope.truncate(len);
        envelope
    }
}

impl HostChannel for MockVtpmService {
    fn send(&mut self, buf: &[u8], _timeout: Duration) -> Result<(), HostChannelError> {
        let mut state = self.state.lock();
        let (status, envelope) = state.process(buf);
        let status = state.faults.reject_next.take().unwrap_or(status);
        let mut reply = ChannelResponseHeader {
            version: CHANNEL_SERVICE_VERSION,
            command: ChannelCommand::VTPM_MESSAGE,
            status: status.into(),
            length: (envelope.len() as u32).into(),
        }
        .as_bytes()
        .to_vec();
        reply.extend_from_slice(&envelope);
        state.pending = Some(reply);
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, HostChannelError> {
        let mut state = self.state.lock();
        let pending = state.pending.take();
        if std::mem::take(&mut state.faults.time_out_next_reply) {
            return Err(HostChannelError::Timeout);
        }
        let reply = pending.ok_or_else(|| HostChannelError::Failed("no reply pending".into()))?;
        if reply.len() > buf.len() || reply.len() < CHANNEL_HEADER_SIZE {
            return Err(HostChannelError::Failed("reply does not fit".into()));
        }
        buf[..reply.len()].copy_from_slice(&reply);
        Ok(reply.len())
    }
}

fn challenge_signature(nonce: &[u8]) -> Vec<u8> {
    let mut hasher = Sha384::new();
    hasher.update(MOCK_CERTIFICATE_CHAIN);
    hasher.update(nonce);
    hasher.finalize().to_vec()
}

/// What the mock engine has been asked to do.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MockEngineStats {
    /// Handshakes started, counted at the digest request.
    pub handshakes: usize,
    /// Key exchanges completed.
    pub key_exchanges: usize,
    /// End-session requests sent.
    pub end_sessions: usize,
}

/// Guest side of the mock key-exchange protocol.
#[derive(Clone, Default)]
pub struct MockSessionEngine {
    stats: Arc<Mutex<MockEngineStats>>,
    certificate_chain: Vec<u8>,
}

impl MockSessionEngine {
    /// Creates an engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters of the engine's activity.
    pub fn stats(&self) -> MockEngineStats {
        self.stats.lock().clone()
    }
}

fn request(
    peer: &mut dyn PeerIo,
    request_code: u8,
    body: &[u8],
) -> Result<Vec<u8>, CollaboratorError> {
    let mut message = vec![request_code];
    message.extend_from_slice(body);
    let mut reply = peer.exchange(&message)?;
    if reply.first() != Some(&code::reply(request_code)) {
        return Err(format!("unexpected reply to request {request_code:#x}").into());
    }
    reply.remove(0);
    Ok(reply)
}

impl SessionProtocolEngine for MockSessionEngine {
    fn get_digest(&mut self, peer: &mut dyn PeerIo) -> Result<Vec<u8>, CollaboratorError> {
        self.stats.lock().handshakes += 1;
        request(peer, code::GET_DIGESTS, &[])
    }

    fn get_certificate(&mut self, peer: &mut dyn PeerIo) -> Result<Vec<u8>, CollaboratorError> {
        self.certificate_chain = request(peer, code::GET_CERTIFICATE, &[])?;
        Ok(self.certificate_chain.clone())
    }

    fn challenge(&mut self, peer: &mut dyn PeerIo) -> Result<(), CollaboratorError> {
        let mut nonce = [0; RANDOM_SIZE];
        getrandom::fill(&mut nonce).map_err(|e| e.to_string())?;
        let signature = request(peer, code::CHALLENGE, &nonce)?;

        let mut hasher = Sha384::new();
        hasher.update(&self.certificate_chain);
        hasher.update(nonce);
        if signature[..] != hasher.finalize()[..] {
            return Err("challenge signature does not verify".into());
        }
        Ok(())
    }

    fn key_exchange(
        &mut self,
        peer: &mut dyn PeerIo,
        policy: SessionPolicy,
    ) -> Result<NegotiatedSession, CollaboratorError> {
        let mut body = [0; 1 + RANDOM_SIZE];
        body[0] = policy.into_bits();
        getrandom::fill(&mut body[1..]).map_err(|e| e.to_string())?;
        let reply = request(peer, code::KEY_EXCHANGE, &body)?;
        if reply.len() != 4 + 2 + RANDOM_SIZE {
            return Err("truncated key exchange reply".into());
        }

        let session_id = u32::from_le_bytes([reply[0], reply[1], reply[2], reply[3]]);
        let cipher_suite = CipherSuite(u16::from_le_bytes([reply[4], reply[5]]));
        let (request, response) = derive_mock_keys(&body[1..], &reply[6..])?;
        self.stats.lock().key_exchanges += 1;
        Ok(NegotiatedSession {
            session_id,
            protocol_version: MOCK_PROTOCOL_VERSION,
            secured_protocol_version: MOCK_SECURED_PROTOCOL_VERSION,
            cipher_suite,
            request,
            response,
        })
    }

    fn end_session(
        &mut self,
        peer: &mut dyn PeerIo,
        _session_id: u32,
    ) -> Result<(), CollaboratorError> {
        self.stats.lock().end_sessions += 1;
        request(peer, code::END_SESSION, &[])?;
        Ok(())
    }
}

/// Outcome the mock verifier reports.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum MockEvidence {
    /// Evidence present and valid.
    #[default]
    Valid,
    /// No evidence in the chain.
    Missing,
    /// Evidence present but rejected.
    Rejected,
}

/// Attestation evidence verifier with a configurable verdict.
#[derive(Clone, Default)]
pub struct MockVerifier {
    outcome: Arc<Mutex<MockEvidence>>,
    verified: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockVerifier {
    /// Creates a verifier that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the verdict for subsequent verifications.
    pub fn set_outcome(&self, outcome: MockEvidence) {
        *self.outcome.lock() = outcome;
    }

    /// Every chain presented so far.
    pub fn verified(&self) -> Vec<Vec<u8>> {
        self.verified.lock().clone()
    }
}

impl EvidenceVerifier for MockVerifier {
    fn verify(&mut self, certificate_chain: &[u8]) -> Result<(), EvidenceError> {
        self.verified.lock().push(certificate_chain.to_vec());
        match *self.outcome.lock() {
            MockEvidence::Valid => Ok(()),
            MockEvidence::Missing => Err(EvidenceError::Missing),
            MockEvidence::Rejected => Err(EvidenceError::Rejected(
                "report signature does not verify".into(),
            )),
        }
    }
}

#[derive(Default)]
struct LogState {
    events: Vec<MeasurementEvent>,
    fail_extend: bool,
}

/// In-memory measurement log.
#[derive(Clone, Default)]
pub struct MockMeasurementLog {
    state: Arc<Mutex<LogState>>,
}

impl MockMeasurementLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event extended so far, oldest first.
    pub fn events(&self) -> Vec<MeasurementEvent> {
        self.state.lock().events.clone()
    }

    /// Makes subsequent extends fail.
    pub fn set_fail_extend(&self, fail: bool) {
        self.state.lock().fail_extend = fail;
    }
}

impl MeasurementLog for MockMeasurementLog {
    fn extend(&mut self, event: &MeasurementEvent) -> Result<(), CollaboratorError> {
        let mut state = self.state.lock();
        if state.fail_extend {
            return Err("measurement log is unavailable".into());
        }
        state.events.push(event.clone());
        Ok(())
    }

    fn has_session_event(&self) -> Result<bool, CollaboratorError> {
        Ok(!self.state.lock().events.is_empty())
    }
}
