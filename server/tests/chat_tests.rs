//! End-to-end chat tests over real TCP connections

mod common;

use common::*;

use confab_client::{ClientError, Connection};
use confab_protocol::{Body, Envelope, ErrorCode};

#[tokio::test]
async fn public_message_reaches_each_peer_exactly_once() {
    let (addr, _shutdown) = start_server(test_config()).await;
    let mut alice = join(addr, "alice").await;
    let mut bob = join(addr, "bob").await;
    let mut charlie = join(addr, "charlie").await;

    alice
        .send(Envelope::stamped(Body::PublicMessage {
            content: "hello room".into(),
        }))
        .await
        .unwrap();

    for peer in [&mut bob, &mut charlie] {
        let env = recv_expect(peer, "PUBLIC_MESSAGE").await;
        assert_eq!(env.sender.as_deref(), Some("alice"));
        assert!(env.timestamp.is_some());
        assert!(matches!(env.body, Body::PublicMessage { ref content } if content == "hello room"));
    }

    // No duplicates for the peers, no echo for the sender.
    let count = |got: Vec<Envelope>| {
        got.iter()
            .filter(|e| matches!(e.body, Body::PublicMessage { .. }))
            .count()
    };
    assert_eq!(count(drain(&mut bob).await), 0);
    assert_eq!(count(drain(&mut charlie).await), 0);
    assert_eq!(count(drain(&mut alice).await), 0);
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() {
    let (addr, _shutdown) = start_server(test_config()).await;
    let mut alice = join(addr, "alice").await;
    let mut bob = join(addr, "bob").await;

    for i in 0..20 {
        alice
            .send(Envelope::stamped(Body::PublicMessage {
                content: format!("msg {}", i),
            }))
            .await
            .unwrap();
    }

    for i in 0..20 {
        let env = recv_expect(&mut bob, "PUBLIC_MESSAGE").await;
        assert!(
            matches!(env.body, Body::PublicMessage { ref content } if *content == format!("msg {}", i)),
            "message {} out of order",
            i
        );
    }
}

#[tokio::test]
async fn private_message_reaches_only_its_recipient() {
    let (addr, _shutdown) = start_server(test_config()).await;
    let mut alice = join(addr, "alice").await;
    let mut bob = join(addr, "bob").await;
    let mut charlie = join(addr, "charlie").await;

    alice
        .send(Envelope::stamped(Body::PrivateMessage {
            recipient: "bob".into(),
            content: "just us".into(),
        }))
        .await
        .unwrap();

    let env = recv_expect(&mut bob, "PRIVATE_MESSAGE").await;
    assert_eq!(env.sender.as_deref(), Some("alice"));

    let leaked = drain(&mut charlie)
        .await
        .iter()
        .any(|e| matches!(e.body, Body::PrivateMessage { .. }));
    assert!(!leaked, "third party saw a private message");
}

#[tokio::test]
async fn private_message_to_absent_user_errors_sender_only() {
    let (addr, _shutdown) = start_server(test_config()).await;
    let mut alice = join(addr, "alice").await;
    let mut bob = join(addr, "bob").await;

    alice
        .send(Envelope::stamped(Body::PrivateMessage {
            recipient: "ghost".into(),
            content: "anyone?".into(),
        }))
        .await
        .unwrap();

    let env = recv_expect(&mut alice, "ERROR").await;
    assert!(matches!(
        env.body,
        Body::Error {
            code: ErrorCode::UnknownRecipient,
            ..
        }
    ));

    let delivered = drain(&mut bob)
        .await
        .iter()
        .any(|e| matches!(e.body, Body::PrivateMessage { .. }));
    assert!(!delivered);
}

#[tokio::test]
async fn public_message_without_timestamp_is_rejected() {
    let (addr, _shutdown) = start_server(test_config()).await;
    let mut alice = join(addr, "alice").await;
    let mut bob = join(addr, "bob").await;

    alice
        .send(Envelope::new(Body::PublicMessage {
            content: "no clock".into(),
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
        .all(|e| !matches!(e.body, Body::PublicMessage { .. })));
}

#[tokio::test]
async fn duplicate_username_is_rejected_but_retry_succeeds() {
    let (addr, _shutdown) = start_server(test_config()).await;
    let _alice = join(addr, "alice").await;

    let mut second = Connection::connect(addr).await.unwrap();
    let err = second.login("alice").await.unwrap_err();
    assert!(matches!(err, ClientError::AuthRejected(_)));

    // Connection stays open for another attempt.
    let users = second.login("alice2").await.unwrap();
    assert_eq!(users, vec!["alice", "alice2"]);
}

#[tokio::test]
async fn invalid_usernames_are_rejected() {
    let (addr, _shutdown) = start_server(test_config()).await;

    for bad in ["", "   ", "a".repeat(21).as_str(), "no!bang"] {
        let mut conn = Connection::connect(addr).await.unwrap();
        let err = conn.login(bad).await.unwrap_err();
        assert!(matches!(err, ClientError::AuthRejected(_)), "accepted {:?}", bad);
    }
}

#[tokio::test]
async fn join_and_leave_are_announced() {
    let (addr, _shutdown) = start_server(test_config()).await;
    let mut alice = join(addr, "alice").await;

    let bob = join(addr, "bob").await;
    let env = recv_expect(&mut alice, "USER_JOINED").await;
    assert!(matches!(env.body, Body::UserJoined { ref username } if username == "bob"));

    bob.disconnect().await.unwrap();
    let env = recv_expect(&mut alice, "USER_LEFT").await;
    assert!(matches!(env.body, Body::UserLeft { ref username } if username == "bob"));
}

#[tokio::test]
async fn user_list_reflects_registration_order() {
    let (addr, _shutdown) = start_server(test_config()).await;
    let mut alice = join(addr, "alice").await;
    let _bob = join(addr, "bob").await;
    let _charlie = join(addr, "charlie").await;

    alice.send(Envelope::new(Body::UserListRequest)).await.unwrap();
    let env = recv_expect(&mut alice, "USER_LIST_RESPONSE").await;
    match env.body {
        Body::UserListResponse { users } => assert_eq!(users, vec!["alice", "bob", "charlie"]),
        other => panic!("unexpected body: {:?}", other),
    }
}

#[tokio::test]
async fn excess_connections_are_refused_with_resource_exhausted() {
    let config = confab_server::ServerConfig {
        max_connections: 1,
        ..test_config()
    };
    let (addr, _shutdown) = start_server(config).await;
    let _alice = join(addr, "alice").await;

    let err = Connection::connect(addr).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Server {
            code: ErrorCode::ResourceExhausted,
            ..
        }
    ));
}
