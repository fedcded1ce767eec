//! Adversarial inputs against a listening server.
//!
//! Every authentication, routing and sequence failure must look the same
//! on the wire, so nothing here should let a sender tell an unknown id from
//! a wrong secret, a replay, or a retired connection.

use paystream_core::address::connection_id;
use paystream_core::error::opaque_reject;
use paystream_core::{CloseCode, ConfigError, ConnectionError, Frame, PacketType, StreamPacket};
use paystream_crypto::{PacketCipher, SharedSecret, Token};
use paystream_integration_tests::fixtures::{
    SERVER_ADDRESS, ServerClientFixture, open_response, raw_prepare,
};
use paystream_integration_tests::test_helpers::{eventually, within};
use paystream_transport::{ErrorCode, Packet, Prepare};
use std::time::{Duration, SystemTime};

const WAIT: Duration = Duration::from_secs(5);

fn empty_packet(sequence: u64) -> StreamPacket {
    StreamPacket::new(PacketType::Prepare, sequence, 0, Vec::new())
}

fn opaque() -> Packet {
    opaque_reject(SERVER_ADDRESS).into()
}

// ============================================================================
// Opaque rejects
// ============================================================================

#[tokio::test]
async fn test_failures_are_indistinguishable() {
    let fx = ServerClientFixture::new().await;
    let mut responses = Vec::new();

    // No connection id at all.
    let bare = raw_prepare(SERVER_ADDRESS, &SharedSecret::from_bytes([3; 32]), &empty_packet(1), 0);
    responses.push(("no id", fx.send_raw(&bare).await));

    // Not a token.
    let garbage = raw_prepare(
        &format!("{SERVER_ADDRESS}.not-a-token"),
        &SharedSecret::from_bytes([3; 32]),
        &empty_packet(1),
        0,
    );
    responses.push(("garbage id", fx.send_raw(&garbage).await));

    // Well-formed token, secret not derived from it.
    let forged = format!("{SERVER_ADDRESS}.{}", Token::from_bytes([9; 18]).encode());
    let wrong_secret = raw_prepare(&forged, &SharedSecret::from_bytes([3; 32]), &empty_packet(1), 0);
    responses.push(("wrong secret", fx.send_raw(&wrong_secret).await));

    // Replay on a live connection.
    let credentials = fx.credentials(None);
    let first = raw_prepare(
        &credentials.destination_account,
        &credentials.shared_secret,
        &empty_packet(1),
        0,
    );
    assert!(matches!(fx.send_raw(&first).await, Packet::Fulfill(_)));
    responses.push(("replay", fx.send_raw(&first).await));

    // Retired connection.
    let server_side = within(WAIT, "accept", fx.server.accept())
        .await
        .expect("raw connection accepted");
    server_side.destroy().await;
    let id = server_side.id().to_string();
    eventually(WAIT, "id retired", || fx.server.is_retired(&id)).await;
    let after = raw_prepare(
        &credentials.destination_account,
        &credentials.shared_secret,
        &empty_packet(2),
        0,
    );
    responses.push(("retired", fx.send_raw(&after).await));

    let expected = opaque().to_bytes();
    for (case, response) in responses {
        assert_eq!(response.to_bytes(), expected, "{case} leaked information");
    }
}

#[tokio::test]
async fn test_replayed_payment_is_not_credited_twice() {
    let fx = ServerClientFixture::new().await;
    let credentials = fx.credentials(None);
    let paying = StreamPacket::new(
        PacketType::Prepare,
        1,
        30,
        vec![
            Frame::StreamMoney {
                stream_id: 1,
                shares: 1,
            },
            Frame::StreamData {
                stream_id: 1,
                offset: 0,
                fin: false,
                data: b"once".to_vec(),
            },
        ],
    );
    let prepare = raw_prepare(
        &credentials.destination_account,
        &credentials.shared_secret,
        &paying,
        30,
    );
    assert!(matches!(fx.send_raw(&prepare).await, Packet::Fulfill(_)));

    let server_side = within(WAIT, "accept", fx.server.accept())
        .await
        .expect("connection");
    let incoming = within(WAIT, "incoming", server_side.accept_stream())
        .await
        .expect("stream");
    assert_eq!(incoming.total_received(), 30);

    assert_eq!(fx.send_raw(&prepare).await, opaque());
    assert_eq!(incoming.total_received(), 30);
    assert_eq!(server_side.stats().await.total_received, 30);
    assert_eq!(within(WAIT, "money", incoming.next_money()).await, Some(30));
    assert_eq!(
        within(WAIT, "data", incoming.read()).await.expect("read"),
        Some(b"once".to_vec())
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(100), incoming.read())
            .await
            .is_err(),
        "replayed bytes were delivered"
    );
}

#[tokio::test]
async fn test_tampered_payload_is_opaque() {
    let fx = ServerClientFixture::new().await;
    let credentials = fx.credentials(None);
    let mut prepare = raw_prepare(
        &credentials.destination_account,
        &credentials.shared_secret,
        &empty_packet(1),
        0,
    );
    let last = prepare.data.len() - 1;
    prepare.data[last] ^= 0x01;

    assert_eq!(fx.send_raw(&prepare).await, opaque());
    assert!(fx.server.active_connections().is_empty());
}

#[tokio::test]
async fn test_sequence_outside_window_is_opaque() {
    let fx = ServerClientFixture::new().await;
    let credentials = fx.credentials(None);
    let send = |sequence| {
        raw_prepare(
            &credentials.destination_account,
            &credentials.shared_secret,
            &empty_packet(sequence),
            0,
        )
    };

    assert!(matches!(fx.send_raw(&send(100)).await, Packet::Fulfill(_)));
    // Reordered within the window is fine, far behind it is not.
    assert!(matches!(fx.send_raw(&send(90)).await, Packet::Fulfill(_)));
    assert_eq!(fx.send_raw(&send(10)).await, opaque());
    // Sequence zero is never valid.
    assert_eq!(fx.send_raw(&send(0)).await, opaque());
}

// ============================================================================
// Connection creation
// ============================================================================

#[tokio::test]
async fn test_concurrent_first_packets_create_one_connection() {
    let fx = ServerClientFixture::new().await;
    let credentials = fx.credentials(Some("race"));
    let a = raw_prepare(
        &credentials.destination_account,
        &credentials.shared_secret,
        &empty_packet(1),
        0,
    );
    let b = raw_prepare(
        &credentials.destination_account,
        &credentials.shared_secret,
        &empty_packet(2),
        0,
    );

    let (ra, rb) = tokio::join!(fx.send_raw(&a), fx.send_raw(&b));
    assert!(matches!(ra, Packet::Fulfill(_)));
    assert!(matches!(rb, Packet::Fulfill(_)));

    let accepted = within(WAIT, "accept", fx.server.accept())
        .await
        .expect("connection");
    assert_eq!(accepted.connection_tag(), Some("race"));
    assert_eq!(fx.server.active_connections().len(), 1);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), fx.server.accept())
            .await
            .is_err(),
        "a second connection was announced"
    );
}

#[tokio::test]
async fn test_invalid_tag_refused() {
    let fx = ServerClientFixture::new().await;
    for tag in ["has space", "dot.ted", "tilde~", ""] {
        assert!(
            matches!(
                fx.server.generate_address_and_secret(Some(tag)),
                Err(ConnectionError::Config(ConfigError::InvalidTag(_)))
            ),
            "tag {tag:?} accepted"
        );
    }
    assert!(fx.server.generate_address_and_secret(Some("Ok_tag-1")).is_ok());
}

// ============================================================================
// Authentic but misbehaving peers
// ============================================================================

/// An empty packet with one frame of an unassigned mandatory type.
fn unsupported_frame_prepare(destination: &str, secret: &SharedSecret) -> Prepare {
    let mut plaintext = empty_packet(1).encode();
    plaintext[18..20].copy_from_slice(&1u16.to_be_bytes());
    plaintext.extend_from_slice(&[0x30, 0, 0, 0, 0]);
    let cipher = PacketCipher::new(secret);
    let data = cipher.encrypt(&plaintext).expect("encrypt");
    Prepare {
        amount: 0,
        expires_at: SystemTime::now() + Duration::from_secs(30),
        execution_condition: cipher.condition(&data),
        destination: destination.to_string(),
        data,
    }
}

async fn wait_for_empty_accept_queue(fx: &ServerClientFixture) {
    within(WAIT, "accept queue drained", async {
        while fx.server.pending_accepts().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn test_unsupported_frame_closes_connection() {
    let fx = ServerClientFixture::new().await;
    let credentials = fx.credentials(None);
    let prepare = unsupported_frame_prepare(&credentials.destination_account, &credentials.shared_secret);

    let response = fx.send_raw(&prepare).await;
    let Packet::Reject(reject) = &response else {
        panic!("expected a reject, got {response:?}");
    };
    assert_eq!(reject.code, ErrorCode::F99_APPLICATION_ERROR);
    let payload = open_response(&credentials.shared_secret, &response).expect("sealed payload");
    assert!(payload.frames.iter().any(|f| matches!(
        f,
        Frame::ConnectionClose {
            code: CloseCode::ProtocolViolation,
            ..
        }
    )));

    // The connection closed before anyone accepted it, so it is retired
    // and never handed out.
    let id = connection_id(SERVER_ADDRESS, &credentials.destination_account)
        .expect("connection id")
        .to_string();
    eventually(WAIT, "id retired", || fx.server.is_retired(&id)).await;
    wait_for_empty_accept_queue(&fx).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(100), fx.server.accept())
            .await
            .is_err(),
        "a closed connection was handed out"
    );
}

#[tokio::test]
async fn test_unaccepted_closed_connections_do_not_accumulate() {
    let fx = ServerClientFixture::new().await;
    for _ in 0..50 {
        let credentials = fx.credentials(None);
        let prepare =
            unsupported_frame_prepare(&credentials.destination_account, &credentials.shared_secret);
        assert!(matches!(fx.send_raw(&prepare).await, Packet::Reject(_)));
    }
    wait_for_empty_accept_queue(&fx).await;
    eventually(WAIT, "all retired", || fx.server.active_connections().is_empty()).await;

    // A live connection is still announced afterwards.
    let (_client, server_side) = fx.connect(None).await;
    assert_eq!(server_side.state(), paystream_core::ConnectionState::Open);
}

#[tokio::test]
async fn test_stream_id_of_wrong_parity_is_fatal() {
    let fx = ServerClientFixture::new().await;
    let credentials = fx.credentials(None);
    // Even ids belong to the server.
    let packet = StreamPacket::new(
        PacketType::Prepare,
        1,
        0,
        vec![Frame::StreamData {
            stream_id: 2,
            offset: 0,
            fin: false,
            data: b"x".to_vec(),
        }],
    );
    let prepare = raw_prepare(
        &credentials.destination_account,
        &credentials.shared_secret,
        &packet,
        0,
    );

    let response = fx.send_raw(&prepare).await;
    let payload = open_response(&credentials.shared_secret, &response).expect("sealed payload");
    assert_eq!(payload.packet_type, PacketType::Reject);
    assert_eq!(payload.sequence, 1);
    assert!(payload.frames.iter().any(|f| matches!(
        f,
        Frame::ConnectionClose {
            code: CloseCode::StreamIdError,
            ..
        }
    )));
}

#[tokio::test]
async fn test_underpaid_packet_is_refused_without_closing() {
    let fx = ServerClientFixture::new().await;
    let credentials = fx.credentials(None);
    let underpaid = StreamPacket::new(
        PacketType::Prepare,
        1,
        100,
        vec![Frame::StreamMoney {
            stream_id: 1,
            shares: 1,
        }],
    );
    let prepare = raw_prepare(
        &credentials.destination_account,
        &credentials.shared_secret,
        &underpaid,
        50,
    );

    let response = fx.send_raw(&prepare).await;
    let Packet::Reject(reject) = &response else {
        panic!("expected a reject, got {response:?}");
    };
    assert_eq!(reject.code, ErrorCode::F99_APPLICATION_ERROR);
    let payload = open_response(&credentials.shared_secret, &response).expect("sealed payload");
    assert_eq!(payload.packet_type, PacketType::Reject);
    assert_eq!(payload.prepare_amount, 50);

    // The connection survives and a correct packet goes through.
    let paid = StreamPacket::new(
        PacketType::Prepare,
        2,
        50,
        vec![Frame::StreamMoney {
            stream_id: 1,
            shares: 1,
        }],
    );
    let prepare = raw_prepare(
        &credentials.destination_account,
        &credentials.shared_secret,
        &paid,
        50,
    );
    assert!(matches!(fx.send_raw(&prepare).await, Packet::Fulfill(_)));

    let server_side = within(WAIT, "accept", fx.server.accept())
        .await
        .expect("connection");
    let incoming = within(WAIT, "incoming", server_side.accept_stream())
        .await
        .expect("stream");
    assert_eq!(within(WAIT, "money", incoming.next_money()).await, Some(50));
}
