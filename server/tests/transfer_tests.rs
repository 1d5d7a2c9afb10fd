//! End-to-end file transfer tests over real TCP connections

mod common;

use common::*;

use confab_protocol::{Body, Envelope, ErrorCode};
use uuid::Uuid;

const CHUNK: usize = 100;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn full_transfer_delivers_every_byte_in_order() {
    let (addr, _shutdown) = start_server(test_config()).await;
    let mut alice = join(addr, "alice").await;
    let mut bob = join(addr, "bob").await;

    let data = payload(1000);
    let transfer_id = Uuid::new_v4();
    alice
        .send(Envelope::new(Body::FileTransferRequest {
            transfer_id,
            recipient: "bob".into(),
            file_name: "blob.bin".into(),
            total_size: data.len() as u64,
        }))
        .await
        .unwrap();

    let env = recv_expect(&mut bob, "FILE_TRANSFER_REQUEST").await;
    assert_eq!(env.sender.as_deref(), Some("alice"));
    assert!(matches!(
        env.body,
        Body::FileTransferRequest { total_size: 1000, .. }
    ));

    bob.send(Envelope::new(Body::FileTransferResponse {
        transfer_id,
        accepted: true,
    }))
    .await
    .unwrap();
    let env = recv_expect(&mut alice, "FILE_TRANSFER_RESPONSE").await;
    assert!(matches!(
        env.body,
        Body::FileTransferResponse { accepted: true, .. }
    ));

    for (sequence, chunk) in data.chunks(CHUNK).enumerate() {
        alice
            .send(Envelope::new(Body::FileChunk {
                transfer_id,
                sequence: sequence as u64,
                data: chunk.to_vec(),
            }))
            .await
            .unwrap();
    }
    alice
        .send(Envelope::new(Body::FileTransferComplete { transfer_id }))
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut expected_seq = 0u64;
    loop {
        let env = recv_expect(&mut bob, "FILE_CHUNK").await;
        if let Body::FileChunk { sequence, data, .. } = env.body {
            assert_eq!(sequence, expected_seq);
            expected_seq += 1;
            received.extend_from_slice(&data);
        }
        if received.len() == 1000 {
            break;
        }
    }
    assert_eq!(received, data);
    recv_expect(&mut bob, "FILE_TRANSFER_COMPLETE").await;
}

#[tokio::test]
async fn chunk_after_completion_is_a_violation() {
    let (addr, _shutdown) = start_server(test_config()).await;
    let mut alice = join(addr, "alice").await;
    let mut bob = join(addr, "bob").await;

    let transfer_id = Uuid::new_v4();
    run_transfer(&mut alice, &mut bob, transfer_id, payload(200)).await;

    alice
        .send(Envelope::new(Body::FileChunk {
            transfer_id,
            sequence: 2,
            data: payload(CHUNK),
        }))
        .await
        .unwrap();

    let env = recv_expect(&mut alice, "ERROR").await;
    assert!(matches!(
        env.body,
        Body::Error {
            code: ErrorCode::ProtocolViolation,
            ..
        }
    ));
}

#[tokio::test]
async fn out_of_order_chunk_is_rejected_without_delivery() {
    let (addr, _shutdown) = start_server(test_config()).await;
    let mut alice = join(addr, "alice").await;
    let mut bob = join(addr, "bob").await;

    let transfer_id = Uuid::new_v4();
    open_transfer(&mut alice, &mut bob, transfer_id, 1000).await;

    alice
        .send(Envelope::new(Body::FileChunk {
            transfer_id,
            sequence: 5,
            data: payload(CHUNK),
        }))
        .await
        .unwrap();

    let env = recv_expect(&mut alice, "ERROR").await;
    assert!(matches!(
        env.body,
        Body::Error {
            code: ErrorCode::ProtocolViolation,
            ..
        }
    ));
    assert!(drain(&mut bob)
        .await
        .iter()
        .all(|e| !matches!(e.body, Body::FileChunk { .. })));
}

#[tokio::test]
async fn rejected_offer_closes_the_transfer() {
    let (addr, _shutdown) = start_server(test_config()).await;
    let mut alice = join(addr, "alice").await;
    let mut bob = join(addr, "bob").await;

    let transfer_id = Uuid::new_v4();
    alice
        .send(Envelope::new(Body::FileTransferRequest {
            transfer_id,
            recipient: "bob".into(),
            file_name: "unwanted.bin".into(),
            total_size: 500,
        }))
        .await
        .unwrap();
    recv_expect(&mut bob, "FILE_TRANSFER_REQUEST").await;

    bob.send(Envelope::new(Body::FileTransferResponse {
        transfer_id,
        accepted: false,
    }))
    .await
    .unwrap();
    let env = recv_expect(&mut alice, "FILE_TRANSFER_RESPONSE").await;
    assert!(matches!(
        env.body,
        Body::FileTransferResponse { accepted: false, .. }
    ));

    // The transfer is gone; chunks against it are violations.
    alice
        .send(Envelope::new(Body::FileChunk {
            transfer_id,
            sequence: 0,
            data: payload(CHUNK),
        }))
        .await
        .unwrap();
    let env = recv_expect(&mut alice, "ERROR").await;
    assert!(matches!(
        env.body,
        Body::Error {
            code: ErrorCode::ProtocolViolation,
            ..
        }
    ));
}

#[tokio::test]
async fn sender_disconnect_cancels_the_transfer() {
    let (addr, _shutdown) = start_server(test_config()).await;
    let mut alice = join(addr, "alice").await;
    let mut bob = join(addr, "bob").await;

    let transfer_id = Uuid::new_v4();
    open_transfer(&mut alice, &mut bob, transfer_id, 1000).await;
    alice
        .send(Envelope::new(Body::FileChunk {
            transfer_id,
            sequence: 0,
            data: payload(CHUNK),
        }))
        .await
        .unwrap();
    recv_expect(&mut bob, "FILE_CHUNK").await;

    alice.disconnect().await.unwrap();

    let env = recv_expect(&mut bob, "FILE_TRANSFER_CANCELLED").await;
    match env.body {
        Body::FileTransferCancelled { transfer_id: id, reason } => {
            assert_eq!(id, transfer_id);
            assert!(reason.contains("alice"));
        }
        other => panic!("unexpected body: {:?}", other),
    }
}

#[tokio::test]
async fn only_the_recipient_may_answer_an_offer() {
    let (addr, _shutdown) = start_server(test_config()).await;
    let mut alice = join(addr, "alice").await;
    let mut bob = join(addr, "bob").await;
    let mut mallory = join(addr, "mallory").await;

    let transfer_id = Uuid::new_v4();
    alice
        .send(Envelope::new(Body::FileTransferRequest {
            transfer_id,
            recipient: "bob".into(),
            file_name: "secret.bin".into(),
            total_size: 500,
        }))
        .await
        .unwrap();
    recv_expect(&mut bob, "FILE_TRANSFER_REQUEST").await;

    mallory
        .send(Envelope::new(Body::FileTransferResponse {
            transfer_id,
            accepted: true,
        }))
        .await
        .unwrap();
    let env = recv_expect(&mut mallory, "ERROR").await;
    assert!(matches!(
        env.body,
        Body::Error {
            code: ErrorCode::Unauthorized,
            ..
        }
    ));
}

/// Offer `total_size` bytes to bob and accept the transfer.
async fn open_transfer(
    alice: &mut confab_client::Connection,
    bob: &mut confab_client::Connection,
    transfer_id: Uuid,
    total_size: u64,
) {
    alice
        .send(Envelope::new(Body::FileTransferRequest {
            transfer_id,
            recipient: "bob".into(),
            file_name: "blob.bin".into(),
            total_size,
        }))
        .await
        .unwrap();
    recv_expect(bob, "FILE_TRANSFER_REQUEST").await;
    bob.send(Envelope::new(Body::FileTransferResponse {
        transfer_id,
        accepted: true,
    }))
    .await
    .unwrap();
    recv_expect(alice, "FILE_TRANSFER_RESPONSE").await;
}

/// Drive a small transfer to successful completion.
async fn run_transfer(
    alice: &mut confab_client::Connection,
    bob: &mut confab_client::Connection,
    transfer_id: Uuid,
    data: Vec<u8>,
) {
    open_transfer(alice, bob, transfer_id, data.len() as u64).await;
    for (sequence, chunk) in data.chunks(CHUNK).enumerate() {
        alice
            .send(Envelope::new(Body::FileChunk {
                transfer_id,
                sequence: sequence as u64,
                data: chunk.to_vec(),
            }))
            .await
            .unwrap();
        recv_expect(bob, "FILE_CHUNK").await;
    }
    alice
        .send(Envelope::new(Body::FileTransferComplete { transfer_id }))
        .await
        .unwrap();
    recv_expect(bob, "FILE_TRANSFER_COMPLETE").await;
}
