//! Client session lifecycle tests over the in-memory radio


use bluechat_core::session::SessionPhase;
use bluechat_core::transport::{MemoryFaults, SessionEvent, SessionEventKind};
use bluechat_core::{ChatConfig, Direction, MemoryRadio, SessionError};
use tokio_test::{assert_err, assert_ok};

use test_utils::*;

#[tokio::test]
async fn test_connect_walks_every_phase_in_order() {
    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new_at(1_000);
    let (client, _server) = ready_pair(&radio, &clock).await;

    let path: Vec<(SessionPhase, SessionPhase)> = client
        .audit_trail()
        .iter()
        .map(|entry| (entry.from_state, entry.to_state))
        .collect();
    assert_eq!(
        path,
        vec![
            (SessionPhase::Idle, SessionPhase::Connecting),
            (SessionPhase::Connecting, SessionPhase::DiscoveringServices),
            (SessionPhase::DiscoveringServices, SessionPhase::Subscribing),
            (SessionPhase::Subscribing, SessionPhase::Ready),
        ]
    );

    let status = client.status();
    assert!(status.connected);
    assert_eq!(status.peer_id, Some(peer(SERVER_ADDRESS)));
    assert_eq!(status.label(), "Unknown Device");
    assert!(client.state().resolved().is_some());
}

#[tokio::test]
async fn test_device_name_resolved_when_available() {
    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new();
    radio.named_device(SERVER_ADDRESS, "Pixel 8");
    let mut server = start_server(&radio, SERVER_ADDRESS, &clock).await;
    let mut client = client_on(&radio, CLIENT_ADDRESS, &clock);

    assert_ok!(client.connect(&peer(SERVER_ADDRESS)).await);
    settle(&mut client, &mut server).await;

    assert_eq!(client.device_name(), Some("Pixel 8"));
    assert_eq!(client.status().label(), "Pixel 8");
}

#[tokio::test]
async fn test_send_yo_writes_once_and_records_outgoing() {
    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new_at(5_000);
    let (mut client, mut server) = ready_pair(&radio, &clock).await;

    let message = assert_ok!(client.send("yo").await);
    assert_eq!(message.content(), "yo");

    let last = client.history().last().cloned().unwrap();
    assert_eq!(last.content(), "yo");
    assert_eq!(last.direction(), Direction::Outgoing);
    assert_eq!(radio.writes(&peer(CLIENT_ADDRESS)), vec![b"yo".to_vec()]);

    settle(&mut client, &mut server).await;
    let received = server.messages();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].content(), "yo");
    assert_eq!(received[0].direction(), Direction::Incoming);
}

#[tokio::test]
async fn test_stale_discovery_event_is_ignored() {
    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new();
    let (mut client, mut server) = ready_pair(&radio, &clock).await;
    let old_session = client.session_handle().unwrap();

    client.disconnect().await;
    assert_eq!(client.phase(), SessionPhase::Closed);

    assert_ok!(client.connect(&peer(SERVER_ADDRESS)).await);
    settle(&mut client, &mut server).await;
    assert!(client.is_connected());
    assert_ne!(client.session_handle(), Some(old_session));

    let state_before = client.state().clone();
    let audit_before = client.audit_trail().len();
    client
        .handle_event(SessionEvent::new(
            old_session,
            SessionEventKind::ServicesDiscovered(Ok(Vec::new())),
        ))
        .await;

    assert_eq!(client.state(), &state_before);
    assert_eq!(client.audit_trail().len(), audit_before);
}

#[tokio::test]
async fn test_send_succeeds_only_when_ready() {
    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new();
    let mut server = start_server(&radio, SERVER_ADDRESS, &clock).await;
    let mut client = client_on(&radio, CLIENT_ADDRESS, &clock);

    // Idle
    let err = assert_err!(client.send("early").await);
    assert!(err.is_not_connected());

    // Connecting, before any event is processed
    assert_ok!(client.connect(&peer(SERVER_ADDRESS)).await);
    assert_eq!(client.phase(), SessionPhase::Connecting);
    assert!(assert_err!(client.send("still early").await).is_not_connected());

    // Ready
    settle(&mut client, &mut server).await;
    assert_ok!(client.send("now").await);

    // Closed
    client.disconnect().await;
    assert!(assert_err!(client.send("late").await).is_not_connected());

    assert_eq!(radio.writes(&peer(CLIENT_ADDRESS)), vec![b"now".to_vec()]);
    let contents: Vec<String> = client
        .messages()
        .iter()
        .map(|m| m.content().to_string())
        .collect();
    assert_eq!(contents, vec!["now".to_string()]);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new();
    let (mut client, mut server) = ready_pair(&radio, &clock).await;

    client.disconnect().await;
    assert_eq!(client.phase(), SessionPhase::Closed);
    assert!(client.session_handle().is_none());
    let audit_len = client.audit_trail().len();
    let status = client.status();

    client.disconnect().await;
    assert_eq!(client.phase(), SessionPhase::Closed);
    assert_eq!(client.audit_trail().len(), audit_len);
    assert_eq!(client.status(), status);

    settle(&mut client, &mut server).await;
    assert!(server.connected_remotes().is_empty());
    assert_eq!(radio.link_count(&peer(CLIENT_ADDRESS)), 0);
}

#[tokio::test]
async fn test_connect_while_live_is_rejected() {
    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new();
    let (mut client, _server) = ready_pair(&radio, &clock).await;

    let err = assert_err!(client.connect(&peer("EE:FF")).await);
    assert!(matches!(
        err,
        bluechat_core::BluechatError::Session(SessionError::SessionActive { .. })
    ));
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_unexpected_disconnect_fails_session() {
    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new();
    let (mut client, mut server) = ready_pair(&radio, &clock).await;
    client.send("before").await.unwrap();

    radio.sever(&peer(CLIENT_ADDRESS), &peer(SERVER_ADDRESS));
    settle(&mut client, &mut server).await;

    assert_eq!(client.phase(), SessionPhase::Failed);
    assert!(!client.status().connected);
    assert!(server.connected_remotes().is_empty());

    // No automatic reconnect; a fresh connect starts an empty history
    assert_ok!(client.connect(&peer(SERVER_ADDRESS)).await);
    settle(&mut client, &mut server).await;
    assert!(client.is_connected());
    assert!(client.messages().is_empty());
}

#[tokio::test]
async fn test_discovery_failures_fail_session() {
    let cases = [
        MemoryFaults {
            fail_discovery: true,
            ..Default::default()
        },
        MemoryFaults {
            omit_characteristic: true,
            ..Default::default()
        },
        MemoryFaults {
            fail_subscribe: true,
            ..Default::default()
        },
    ];

    for faults in cases {
        let radio = MemoryRadio::new();
        let clock = MockTimeSource::new();
        let mut server = start_server(&radio, SERVER_ADDRESS, &clock).await;
        let mut client = client_on(&radio, CLIENT_ADDRESS, &clock);
        radio.set_faults(&peer(CLIENT_ADDRESS), faults.clone());

        assert_ok!(client.connect(&peer(SERVER_ADDRESS)).await);
        settle(&mut client, &mut server).await;

        assert_eq!(client.phase(), SessionPhase::Failed, "faults: {:?}", faults);
        assert!(client.session_handle().is_none());
        assert_eq!(radio.link_count(&peer(CLIENT_ADDRESS)), 0);
    }
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new();
    let mut client = client_on(&radio, CLIENT_ADDRESS, &clock);

    assert_ok!(client.connect(&peer(SERVER_ADDRESS)).await);
    let err = assert_err!(client.wait_until_ready().await);
    assert!(err.is_not_connected());
    assert_eq!(client.phase(), SessionPhase::Failed);
}

#[tokio::test]
async fn test_wait_until_ready() {
    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new();
    let _server = start_server(&radio, SERVER_ADDRESS, &clock).await;
    let mut client = client_on(&radio, CLIENT_ADDRESS, &clock);

    assert_ok!(client.connect(&peer(SERVER_ADDRESS)).await);
    assert_ok!(client.wait_until_ready().await);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_oversized_send_is_rejected() {
    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new();
    let mut server = start_server(&radio, SERVER_ADDRESS, &clock).await;
    let mut client = client_with_config(
        &radio,
        CLIENT_ADDRESS,
        &clock,
        ChatConfig::default().with_max_payload_size(8),
    );
    assert_ok!(client.connect(&peer(SERVER_ADDRESS)).await);
    settle(&mut client, &mut server).await;

    let err = assert_err!(client.send("far too long for eight").await);
    assert!(err.is_size_exceeded());
    assert!(radio.writes(&peer(CLIENT_ADDRESS)).is_empty());
    assert!(client.messages().is_empty());

    // The negotiated link limit narrows the bound further
    radio.set_payload_limit(&peer(SERVER_ADDRESS), Some(4));
    assert!(assert_err!(client.send("12345").await).is_size_exceeded());
    assert_ok!(client.send("1234").await);
}

#[tokio::test]
async fn test_dropping_client_releases_link() {
    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new();
    let (client, mut server) = ready_pair(&radio, &clock).await;
    assert_eq!(server.connected_remotes().len(), 1);

    drop(client);
    tokio::task::yield_now().await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    assert_eq!(radio.link_count(&peer(CLIENT_ADDRESS)), 0);
    server.process_pending().await;
    assert!(server.connected_remotes().is_empty());
}

#[tokio::test]
async fn test_status_watch_tracks_phases() {
    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new();
    let mut server = start_server(&radio, SERVER_ADDRESS, &clock).await;
    let mut client = client_on(&radio, CLIENT_ADDRESS, &clock);
    let status = client.watch_status();
    assert!(!status.borrow().connected);

    client.connect(&peer(SERVER_ADDRESS)).await.unwrap();
    settle(&mut client, &mut server).await;
    assert!(status.borrow().connected);
    assert_eq!(status.borrow().phase, SessionPhase::Ready);

    client.disconnect().await;
    assert!(!status.borrow().connected);
    assert_eq!(status.borrow().phase, SessionPhase::Closed);
}
