mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use common::{linked_client, wait_until, Kind, MockTransport, Reply};
use ytlounge::{Command, LoungeError, Termination};

#[tokio::test]
async fn offset_advances_per_accepted_command() {
    let transport = MockTransport::new();
    let (client, _) = linked_client(transport.clone());
    client.connect().await.unwrap();

    assert!(client.play().await.unwrap());
    assert!(client.seek_to(42.5).await.unwrap());
    assert!(client.set_volume(150).await.unwrap());

    let sent = transport.requests(Kind::Command);
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].form_field("req0__sc"), Some("play"));
    assert_eq!(sent[0].form_field("count"), Some("1"));
    assert_eq!(sent[0].form_field("ofs"), Some("0"));
    assert_eq!(sent[1].form_field("req0__sc"), Some("seekTo"));
    assert_eq!(sent[1].form_field("req0_newTime"), Some("42.5"));
    assert_eq!(sent[1].form_field("ofs"), Some("1"));
    assert_eq!(sent[2].form_field("req0_volume"), Some("100"));
    assert_eq!(sent[2].form_field("ofs"), Some("2"));

    let rids: Vec<u64> = sent
        .iter()
        .map(|r| r.query_param("RID").unwrap().parse().unwrap())
        .collect();
    assert!(rids.windows(2).all(|w| w[1] > w[0]));
    assert_eq!(sent[0].query_param("SID"), Some("sid1"));
    assert_eq!(sent[0].query_param("loungeIdToken"), Some("tok1"));
}

#[tokio::test]
async fn rejected_batch_does_not_advance_offset() {
    let transport = MockTransport::new();
    transport.push(Kind::Command, Reply::status(500, "Internal Server Error"));
    let (client, _) = linked_client(transport.clone());
    client.connect().await.unwrap();

    assert!(!client.pause().await.unwrap());
    assert!(client.pause().await.unwrap());

    let sent = transport.requests(Kind::Command);
    assert_eq!(sent[0].form_field("ofs"), Some("0"));
    assert_eq!(sent[1].form_field("ofs"), Some("0"));
}

#[tokio::test]
async fn commands_submitted_during_a_send_are_coalesced() {
    let transport = MockTransport::new();
    let gate = Arc::new(Notify::new());
    transport.push(Kind::Command, Reply::Gate(gate.clone()));
    let (client, _) = linked_client(transport.clone());
    let client = Arc::new(client);
    client.connect().await.unwrap();

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.play().await }
    });
    wait_until("first batch in flight", || transport.count(Kind::Command) == 1).await;

    let second = tokio::spawn({
        let client = client.clone();
        async move { client.submit(Command::new("pause")).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let third = tokio::spawn({
        let client = client.clone();
        async move { client.next().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.count(Kind::Command), 1);

    gate.notify_one();
    assert!(first.await.unwrap().unwrap());
    assert!(second.await.unwrap().unwrap());
    assert!(third.await.unwrap().unwrap());

    let sent = transport.requests(Kind::Command);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].form_field("count"), Some("2"));
    assert_eq!(sent[1].form_field("ofs"), Some("1"));
    assert_eq!(sent[1].form_field("req0__sc"), Some("pause"));
    assert_eq!(sent[1].form_field("req1__sc"), Some("next"));
}

#[tokio::test(start_paused = true)]
async fn offset_restarts_on_new_channel() {
    let transport = MockTransport::new();
    let (client, _) = linked_client(transport.clone());
    let client = Arc::new(client);
    client.connect().await.unwrap();
    assert!(client.play().await.unwrap());

    transport.push(Kind::Poll, Reply::status(410, "Gone"));
    let poller = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe().await }
    });
    wait_until("rebound poll", || transport.count(Kind::Poll) == 2).await;

    assert!(client.play_video("dQw4w9WgXcQ").await.unwrap());
    let sent = transport.requests(Kind::Command);
    assert_eq!(sent[1].form_field("ofs"), Some("0"));
    assert_eq!(sent[1].form_field("req0__sc"), Some("setPlaylist"));
    assert_eq!(sent[1].form_field("req0_videoId"), Some("dQw4w9WgXcQ"));
    assert_eq!(sent[1].query_param("SID"), Some("sid2"));

    client.close();
    assert_eq!(poller.await.unwrap().unwrap(), Termination::Closed);
}

#[tokio::test]
async fn close_cancels_in_flight_send() {
    let transport = MockTransport::new();
    transport.push(Kind::Command, Reply::Gate(Arc::new(Notify::new())));
    let (client, _) = linked_client(transport.clone());
    let client = Arc::new(client);
    client.connect().await.unwrap();

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.skip_ad().await }
    });
    wait_until("batch in flight", || transport.count(Kind::Command) == 1).await;

    client.close();
    assert!(!pending.await.unwrap().unwrap());
    assert!(matches!(client.play().await, Err(LoungeError::NotConnected)));
}

#[tokio::test]
async fn expired_token_on_command_triggers_refresh() {
    let transport = MockTransport::new();
    transport.push(Kind::Command, Reply::status(401, "Expired"));
    transport.push(
        Kind::TokenBatch,
        Reply::ok(r#"{"screens":[{"screenId":"abc","loungeToken":"tok2"}]}"#),
    );
    let (client, _) = linked_client(transport.clone());
    let client = Arc::new(client);
    client.connect().await.unwrap();

    let poller = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe().await }
    });
    wait_until("first poll", || transport.count(Kind::Poll) == 1).await;

    assert!(!client.set_autoplay_mode(true).await.unwrap());
    wait_until("rebound poll", || transport.count(Kind::Poll) == 2).await;
    assert_eq!(transport.count(Kind::Handshake), 2);
    assert_eq!(
        transport.requests(Kind::Handshake)[1].form_field("loungeIdToken"),
        Some("tok2")
    );

    client.close();
    assert_eq!(poller.await.unwrap().unwrap(), Termination::Closed);
}
