// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ConfigError;
use crate::ConnectError;
use crate::DisconnectError;
use crate::EvidenceError;
use crate::HandshakeError;
use crate::HandshakeState;
use crate::SendReceiveError;
use crate::SessionConfig;
use crate::SessionManager;
use crate::SessionPolicy;
use crate::test_helpers::MOCK_CERTIFICATE_CHAIN;
use crate::test_helpers::MockEvidence;
use crate::test_helpers::MockMeasurementLog;
use crate::test_helpers::MockSessionEngine;
use crate::test_helpers::MockVerifier;
use crate::test_helpers::MockVtpmService;
use crate::tests::rig;
use crate::tests::rig_with;
use vtpm_session_protocol::CipherSuite;

#[test]
fn connect_establishes_session() {
    let mut rig = rig();
    assert!(!rig.manager.is_connected());
    assert_eq!(rig.manager.session_id(), None);
    assert_eq!(rig.manager.state(), HandshakeState::Uninitialized);

    rig.manager.connect().unwrap();
    assert!(rig.manager.is_connected());
    assert_eq!(rig.manager.state(), HandshakeState::SessionEstablished);
    assert_eq!(rig.manager.session_id(), rig.service.session_id());
    assert_eq!(rig.verifier.verified(), [MOCK_CERTIFICATE_CHAIN.to_vec()]);
    assert_eq!(rig.service.sequence_numbers(), Some((0, 0)));
}

#[test]
fn configured_policy_reaches_key_exchange() {
    let policy = SessionPolicy::new().with_allow_renegotiation(true);
    let mut rig = rig_with(SessionConfig {
        session_policy: policy,
        ..Default::default()
    });
    rig.manager.connect().unwrap();

    assert_eq!(rig.service.session_policy(), Some(policy));
    assert_eq!(rig.manager.store.get().unwrap().policy(), policy);
    assert!(!policy.terminate_on_measurement_update());
}

#[test]
fn connect_is_idempotent() {
    let mut rig = rig();
    rig.manager.connect().unwrap();
    let session_id = rig.manager.session_id();
    rig.manager.connect().unwrap();

    assert_eq!(rig.manager.session_id(), session_id);
    assert_eq!(rig.engine.stats().handshakes, 1);
    assert_eq!(rig.service.stats().key_exchanges, 1);
}

#[test]
fn disconnect_then_send_is_not_connected() {
    let mut rig = rig();
    rig.manager.connect().unwrap();
    rig.manager.disconnect().unwrap();

    assert!(!rig.manager.is_connected());
    assert_eq!(rig.manager.state(), HandshakeState::Uninitialized);
    assert_eq!(rig.service.stats().end_sessions, 1);
    assert_eq!(rig.service.session_id(), None);

    let mut response = [0; 16];
    assert!(matches!(
        rig.manager.send_receive(&[1, 2, 3], &mut response),
        Err(SendReceiveError::NotConnected)
    ));
}

#[test]
fn disconnect_without_session_is_harmless() {
    let mut rig = rig();
    rig.manager.disconnect().unwrap();
    rig.manager.disconnect().unwrap();
    assert_eq!(rig.engine.stats().end_sessions, 0);
    assert_eq!(rig.manager.state(), HandshakeState::Uninitialized);

    rig.manager.connect().unwrap();
    rig.manager.disconnect().unwrap();
    rig.manager.disconnect().unwrap();
    assert_eq!(rig.engine.stats().end_sessions, 1);
}

#[test]
fn disconnect_drops_session_without_acknowledgement() {
    let mut rig = rig();
    rig.manager.connect().unwrap();
    rig.service.with_faults(|f| f.time_out_next_reply = true);

    assert!(matches!(
        rig.manager.disconnect(),
        Err(DisconnectError::EndSession(HandshakeError::EndSession(_)))
    ));
    assert!(!rig.manager.is_connected());
    assert_eq!(rig.manager.state(), HandshakeState::Uninitialized);
}

#[test]
fn reconnect_negotiates_new_session() {
    let mut rig = rig();
    rig.manager.connect().unwrap();
    let first = rig.manager.session_id().unwrap();
    rig.manager.disconnect().unwrap();
    rig.manager.connect().unwrap();
    let second = rig.manager.session_id().unwrap();

    assert_ne!(first, second);
    assert_eq!(rig.engine.stats().handshakes, 2);
}

#[test]
fn rejected_evidence_fails_connect() {
    let mut rig = rig();
    rig.verifier.set_outcome(MockEvidence::Rejected);

    let err = rig.manager.connect().unwrap_err();
    assert!(matches!(
        err,
        ConnectError::Handshake(HandshakeError::Evidence(EvidenceError::Rejected(_)))
    ));
    assert!(!rig.manager.is_connected());
    assert_eq!(rig.manager.state(), HandshakeState::Failed);
    assert_eq!(rig.service.stats().key_exchanges, 0);
}

#[test]
fn missing_evidence_fails_connect() {
    let mut rig = rig();
    rig.verifier.set_outcome(MockEvidence::Missing);
    assert!(matches!(
        rig.manager.connect(),
        Err(ConnectError::Handshake(HandshakeError::Evidence(
            EvidenceError::Missing
        )))
    ));
    assert_eq!(rig.service.stats().key_exchanges, 0);

    rig.verifier.set_outcome(MockEvidence::Valid);
    rig.manager.connect().unwrap();
    assert!(rig.manager.is_connected());
}

#[test]
fn failed_challenge_fails_connect() {
    let mut rig = rig();
    rig.service.with_faults(|f| f.fail_challenge = true);
    assert!(matches!(
        rig.manager.connect(),
        Err(ConnectError::Handshake(HandshakeError::Challenge(_)))
    ));
    assert!(!rig.manager.is_connected());
    assert_eq!(rig.service.stats().key_exchanges, 0);
}

#[test]
fn unsupported_cipher_suite_fails_connect() {
    let mut rig = rig();
    rig.service
        .with_faults(|f| f.cipher_suite = Some(CipherSuite(0x0001)));
    assert!(matches!(
        rig.manager.connect(),
        Err(ConnectError::Handshake(HandshakeError::UnsupportedCipherSuite(
            CipherSuite(0x0001)
        )))
    ));
    assert!(!rig.manager.is_connected());
    assert_eq!(rig.engine.stats().end_sessions, 1);
}

#[test]
fn handshake_timeout_is_recoverable() {
    let mut rig = rig();
    rig.service.with_faults(|f| f.time_out_next_reply = true);
    assert!(matches!(
        rig.manager.connect(),
        Err(ConnectError::Handshake(HandshakeError::Digest(_)))
    ));
    assert_eq!(rig.manager.state(), HandshakeState::Failed);

    rig.manager.connect().unwrap();
    assert!(rig.manager.is_connected());
}

#[test]
fn invalid_config_is_rejected() {
    let config = SessionConfig {
        transport_alignment: 3,
        ..Default::default()
    };
    let result = SessionManager::new(
        config,
        Box::new(MockSessionEngine::new()),
        Box::new(MockVerifier::new()),
        Box::new(MockMeasurementLog::new()),
        Box::new(MockVtpmService::new(&SessionConfig::default())),
    );
    assert!(matches!(
        result,
        Err(ConfigError::InvalidAlignment { value: 3, .. })
    ));
}
