// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::HandshakeState;
use crate::MessageError;
use crate::SendReceiveError;
use crate::SessionConfig;
use crate::channel::TransportError;
use crate::record::RecordError;
use crate::store::Direction;
use crate::tests::TestRig;
use crate::tests::rig;
use crate::tests::rig_with;

/// A TPM2_GetRandom command.
const GET_RANDOM: [u8; 12] = [
    0x80, 0x01, 0x00, 0x00, 0x00, 0x0c, 0x00, 0x00, 0x01, 0x7b, 0x00, 0x10,
];

fn connected() -> TestRig {
    let mut rig = rig();
    rig.manager.connect().unwrap();
    rig
}

fn assert_invalidated(rig: &mut TestRig) {
    assert!(!rig.manager.is_connected());
    assert_eq!(rig.manager.state(), HandshakeState::Failed);
    let mut response = [0; 64];
    assert!(matches!(
        rig.manager.send_receive(&GET_RANDOM, &mut response),
        Err(SendReceiveError::NotConnected)
    ));
}

#[test]
fn round_trip() {
    let mut rig = connected();
    let mut response = [0; 4096];
    for n in 1..=3u64 {
        let len = rig
            .manager
            .send_receive(&GET_RANDOM, &mut response)
            .unwrap();
        assert_eq!(response[..len], GET_RANDOM);
        assert_eq!(rig.service.sequence_numbers(), Some((n, n)));
    }

    let session = rig.manager.store.get().unwrap();
    assert_eq!(session.keys(Direction::Request).sequence_number(), 3);
    assert_eq!(session.keys(Direction::Response).sequence_number(), 3);
    assert_eq!(rig.service.stats().application_messages, 3);
}

#[test]
fn large_payload() {
    let mut rig = connected();
    let request: Vec<u8> = (0..4096).map(|i| i as u8).collect();
    let mut response = vec![0; 4096];
    let len = rig.manager.send_receive(&request, &mut response).unwrap();
    assert_eq!(response[..len], request[..]);
}

#[test]
fn small_response_buffer_keeps_session() {
    let mut rig = connected();
    let mut response = [0; 4];
    assert!(matches!(
        rig.manager.send_receive(&GET_RANDOM, &mut response),
        Err(SendReceiveError::ResponseBufferTooSmall { required: 12 })
    ));
    assert!(rig.manager.is_connected());

    let mut response = [0; 12];
    rig.manager.send_receive(&GET_RANDOM, &mut response).unwrap();
}

#[test]
fn oversized_request_keeps_session() {
    let mut rig = connected();
    let mut response = [0; 16];
    let err = rig
        .manager
        .send_receive(&vec![0; 0x2000], &mut response)
        .unwrap_err();
    assert!(matches!(
        err,
        SendReceiveError::Channel(MessageError::RequestTooLarge { .. })
    ));
    assert!(rig.manager.is_connected());
    assert_eq!(rig.service.sequence_numbers(), Some((0, 0)));
}

#[test]
fn empty_request_keeps_session() {
    let mut rig = connected();
    let mut response = [0; 16];
    assert!(matches!(
        rig.manager.send_receive(&[], &mut response),
        Err(SendReceiveError::Channel(MessageError::EmptyRequest))
    ));
    assert!(rig.manager.is_connected());
    assert_eq!(rig.service.sequence_numbers(), Some((0, 0)));
    let session = rig.manager.store.get().unwrap();
    assert_eq!(session.keys(Direction::Request).sequence_number(), 0);
    assert_eq!(session.keys(Direction::Response).sequence_number(), 0);

    let len = rig
        .manager
        .send_receive(&GET_RANDOM, &mut response)
        .unwrap();
    assert_eq!(response[..len], GET_RANDOM);
}

#[test]
fn tampered_reply_invalidates_session() {
    let mut rig = connected();
    rig.service.with_faults(|f| f.tamper_next_reply = true);
    let mut response = [0; 64];
    assert!(matches!(
        rig.manager.send_receive(&GET_RANDOM, &mut response),
        Err(SendReceiveError::Channel(MessageError::Record(
            RecordError::AuthenticationFailed
        )))
    ));
    assert_invalidated(&mut rig);

    rig.manager.connect().unwrap();
    rig.manager.send_receive(&GET_RANDOM, &mut response).unwrap();
}

#[test]
fn replayed_reply_invalidates_session() {
    let mut rig = connected();
    let mut response = [0; 64];
    rig.manager.send_receive(&GET_RANDOM, &mut response).unwrap();

    rig.service.with_faults(|f| f.replay_next_reply = true);
    assert!(matches!(
        rig.manager.send_receive(&GET_RANDOM, &mut response),
        Err(SendReceiveError::Channel(MessageError::Record(
            RecordError::SequenceNumberMismatch {
                expected: 1,
                received: 0
            }
        )))
    ));
    assert_invalidated(&mut rig);
}

#[test]
fn misaddressed_reply_invalidates_session() {
    let mut rig = connected();
    rig.service.with_faults(|f| f.misaddress_next_reply = true);
    let mut response = [0; 64];
    assert!(matches!(
        rig.manager.send_receive(&GET_RANDOM, &mut response),
        Err(SendReceiveError::Channel(
            MessageError::SessionIdMismatch { .. }
        ))
    ));
    assert_invalidated(&mut rig);
}

#[test]
fn timeout_invalidates_session() {
    let mut rig = connected();
    rig.service.with_faults(|f| f.time_out_next_reply = true);
    let mut response = [0; 64];
    assert!(matches!(
        rig.manager.send_receive(&GET_RANDOM, &mut response),
        Err(SendReceiveError::Channel(MessageError::Transport(
            TransportError::Timeout
        )))
    ));
    assert_invalidated(&mut rig);
}

#[test]
fn host_rejection_invalidates_session() {
    let mut rig = connected();
    rig.service.with_faults(|f| f.reject_next = Some(0x55));
    let mut response = [0; 64];
    assert!(matches!(
        rig.manager.send_receive(&GET_RANDOM, &mut response),
        Err(SendReceiveError::Channel(MessageError::Transport(
            TransportError::ChannelRejected { status: 0x55 }
        )))
    ));
    assert_invalidated(&mut rig);
}

#[test]
fn exhausted_request_counter_invalidates_session() {
    let mut rig = connected();
    rig.manager
        .store
        .get_mut()
        .unwrap()
        .keys_mut(Direction::Request)
        .set_sequence_number(u64::MAX);

    let mut response = [0; 64];
    assert!(matches!(
        rig.manager.send_receive(&GET_RANDOM, &mut response),
        Err(SendReceiveError::Channel(MessageError::Record(
            RecordError::SequenceNumberExhausted(Direction::Request)
        )))
    ));
    assert_invalidated(&mut rig);
    assert_eq!(rig.service.stats().application_messages, 0);
}

#[test]
fn exhausted_response_counter_invalidates_session() {
    let mut rig = connected();
    rig.manager
        .store
        .get_mut()
        .unwrap()
        .keys_mut(Direction::Response)
        .set_sequence_number(u64::MAX);

    let mut response = [0; 64];
    assert!(matches!(
        rig.manager.send_receive(&GET_RANDOM, &mut response),
        Err(SendReceiveError::Channel(MessageError::Record(
            RecordError::SequenceNumberExhausted(Direction::Response)
        )))
    ));
    assert_invalidated(&mut rig);
}

#[test]
fn aligned_app_messages_keep_padding() {
    let mut rig = rig_with(SessionConfig {
        app_alignment: 4,
        ..Default::default()
    });
    rig.manager.connect().unwrap();
    let mut response = [0; 16];
    let len = rig
        .manager
        .send_receive(&[1, 2, 3], &mut response)
        .unwrap();
    assert_eq!(response[..len], [1, 2, 3, 0]);
}

#[test]
fn truncated_sequence_numbers_still_work() {
    let mut rig = rig_with(SessionConfig {
        sequence_number_width: 2,
        max_random_padding: 0,
        ..Default::default()
    });
    rig.manager.connect().unwrap();
    let mut response = [0; 64];
    for _ in 0..3 {
        let len = rig
            .manager
            .send_receive(&GET_RANDOM, &mut response)
            .unwrap();
        assert_eq!(response[..len], GET_RANDOM);
    }
}
