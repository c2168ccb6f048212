//! End-to-end chat over the in-memory radio


use bluechat_core::{Direction, MemoryRadio};
use tokio_test::assert_ok;

use test_utils::*;

#[tokio::test]
async fn test_hello_round_trip() {
    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new_at(1_700_000_000_000);
    let (mut client, mut server) = ready_pair(&radio, &clock).await;

    assert_ok!(client.send("hello").await);
    settle(&mut client, &mut server).await;

    let received = server.messages();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].content(), "hello");
    assert_eq!(received[0].direction(), Direction::Incoming);

    assert_eq!(assert_ok!(server.broadcast("hello").await), 1);
    settle(&mut client, &mut server).await;

    let received = client.messages();
    assert_eq!(received.last().unwrap().content(), "hello");
    assert_eq!(received.last().unwrap().direction(), Direction::Incoming);
}

#[tokio::test]
async fn test_conversation_keeps_order_and_time() {
    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new_at(10_000);
    let (mut client, mut server) = ready_pair(&radio, &clock).await;
    let mut updates = client.subscribe_messages();

    client.send("one").await.unwrap();
    clock.advance(1_000);
    server.broadcast("two").await.unwrap();
    settle(&mut client, &mut server).await;
    // A clock that steps back never reorders history
    clock.set_time(5_000);
    client.send("three").await.unwrap();

    let log: Vec<(String, Direction, u64)> = client
        .messages()
        .iter()
        .map(|m| {
            (
                m.content().to_string(),
                m.direction(),
                m.timestamp().as_millis(),
            )
        })
        .collect();
    assert_eq!(
        log,
        vec![
            ("one".to_string(), Direction::Outgoing, 10_000),
            ("two".to_string(), Direction::Incoming, 11_000),
            ("three".to_string(), Direction::Outgoing, 11_000),
        ]
    );

    assert_eq!(updates.recv().await.unwrap().content(), "one");
    assert_eq!(updates.recv().await.unwrap().content(), "two");
    assert_eq!(updates.recv().await.unwrap().content(), "three");
}

#[tokio::test]
async fn test_invalid_utf8_is_decoded_lossily() {
    use bluechat_core::transport::Transport;
    use bluechat_core::CHAT_CHARACTERISTIC_UUID;

    let radio = MemoryRadio::new();
    let clock = MockTimeSource::new();
    let (mut client, mut server) = ready_pair(&radio, &clock).await;

    let device = radio.device(CLIENT_ADDRESS);
    let session = client.session_handle().unwrap();
    device
        .write(session, CHAT_CHARACTERISTIC_UUID, &[b'o', b'k', 0xFF])
        .await
        .unwrap();
    settle(&mut client, &mut server).await;

    assert_eq!(server.messages()[0].content(), "ok\u{FFFD}");
}
