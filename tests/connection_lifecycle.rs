mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use block_feed::core::DisconnectCause;
use block_feed::testing::MockFallback;
use block_feed::{
    CallOptions, ConnectionState, FeedError, KeepaliveConfig, PushKind, RpcError, TransportChoice,
};
use common::*;
use serde_json::{Value, json};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_is_refused_while_open() {
    let (feed, mut server) = mock_feed(fast_config(), MockFallback::new());
    let _socket = start_and_accept(&feed, &mut server).await;

    assert_eq!(feed.start().await, Err(FeedError::AlreadyConnecting));
    assert_eq!(server.connection_count(), 1);

    feed.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn block_update_push_reaches_handler_without_rpc() {
    let fallback = MockFallback::new();
    let (feed, mut server) = mock_feed(fast_config(), fallback.clone());
    let height = Arc::new(AtomicU64::new(0));
    let seen = height.clone();
    feed.on(PushKind::BlockUpdate, move |message| {
        let h = message
            .data
            .get("height")
            .and_then(Value::as_u64)
            .ok_or("block_update without height")?;
        seen.store(h, Ordering::SeqCst);
        Ok(())
    });

    let socket = start_and_accept(&feed, &mut server).await;
    socket.push("block_update", json!({"height": 100})).unwrap();

    assert!(wait_until(WAIT, || height.load(Ordering::SeqCst) == 100).await);
    assert_eq!(fallback.total_calls(), 0);
    assert_eq!(feed.rpc().in_flight(), 0);

    feed.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_handler_does_not_block_others() {
    let (feed, mut server) = mock_feed(fast_config(), MockFallback::new());
    let delivered = Arc::new(AtomicUsize::new(0));
    feed.on(PushKind::Gate, |_| Err("boom".into()));
    feed.on(PushKind::Gate, |_| panic!("handler panicked"));
    let counter = delivered.clone();
    feed.on(PushKind::Gate, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let socket = start_and_accept(&feed, &mut server).await;
    socket.push("gate", json!({"name": "trade"})).unwrap();
    socket.push("gate", json!({"name": "compute"})).unwrap();

    assert!(wait_until(WAIT, || delivered.load(Ordering::SeqCst) == 2).await);
    assert_eq!(feed.metrics().snapshot().handler_errors, 4);
    assert_eq!(feed.connection().status(), ConnectionState::Open);

    feed.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_and_unknown_messages_keep_socket_open() {
    let (feed, mut server) = mock_feed(fast_config(), MockFallback::new());
    let socket = start_and_accept(&feed, &mut server).await;

    socket.send_text("{not json").unwrap();
    socket.push("solar_flare", json!({})).unwrap();
    socket.send_json(&json!({"id": 999, "result": 1})).unwrap();

    let metrics = feed.metrics().clone();
    assert!(
        wait_until(WAIT, || {
            let snapshot = metrics.snapshot();
            snapshot.protocol_errors == 1 && snapshot.unknown_messages == 1
        })
        .await
    );
    assert_eq!(feed.connection().status(), ConnectionState::Open);
    assert_eq!(server.connection_count(), 1);

    feed.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socket_drop_reconnects_and_replays_subscriptions_once() {
    let (feed, mut server) = mock_feed(fast_config(), MockFallback::new());
    assert!(feed.subscribe("blocks").await.unwrap());
    assert!(feed.subscribe("gates").await.unwrap());
    assert!(!feed.subscribe("blocks").await.unwrap());

    let mut first = start_and_accept(&feed, &mut server).await;
    for topic in ["blocks", "gates"] {
        let frame = first.recv_json_timeout(WAIT).await.expect("subscribe frame");
        assert_eq!(method_of(&frame), Some("state_stream.subscribe"));
        assert_eq!(frame["params"], json!([topic]));
    }

    first.drop_socket();
    let mut second = server.accept_timeout(WAIT).await.expect("reconnected socket");
    wait_for_state(&feed, ConnectionState::Open).await;

    let connection = feed.connection().clone();
    let call = tokio::spawn(async move {
        connection
            .call("consensus.block_height", &json!({}), false)
            .await
    });

    let mut methods = Vec::new();
    for _ in 0..3 {
        let frame = second.recv_json_timeout(WAIT).await.expect("frame");
        if method_of(&frame) == Some("consensus.block_height") {
            second.respond(&frame["id"], json!({"height": 5})).unwrap();
        }
        methods.push((method_of(&frame).map(str::to_string), frame["params"].clone()));
    }
    assert_eq!(
        methods,
        vec![
            (Some("state_stream.subscribe".to_string()), json!(["blocks"])),
            (Some("state_stream.subscribe".to_string()), json!(["gates"])),
            (Some("consensus.block_height".to_string()), json!({})),
        ]
    );
    assert_eq!(call.await.unwrap(), Ok(json!({"height": 5})));
    assert!(second.recv_json_timeout(Duration::from_millis(50)).await.is_none());

    let stats = feed.connection().stats().await.unwrap();
    assert_eq!(stats.attempt, 0);
    assert_eq!(stats.subscriptions, 2);
    assert_eq!(stats.last_disconnect, Some(DisconnectCause::RemoteClosed));
    assert_eq!(feed.metrics().snapshot().reconnects, 1);

    feed.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn calls_queued_during_reconnect_follow_the_replay() {
    let (feed, mut server) = mock_feed(fast_config(), MockFallback::new());
    feed.subscribe("blocks").await.unwrap();
    let mut first = start_and_accept(&feed, &mut server).await;
    first.recv_json_timeout(WAIT).await.expect("initial subscribe");

    server.set_refusing(true);
    first.drop_socket();
    assert!(wait_until(WAIT, || server.connect_attempts() >= 3).await);
    assert_ne!(feed.connection().status(), ConnectionState::Open);

    let connection = feed.connection().clone();
    let call = tokio::spawn(async move {
        connection
            .call("governor.status", &json!({}), true)
            .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    let stats = feed.connection().stats().await.unwrap();
    assert_eq!(stats.queued_socket_calls, 1);
    server.set_refusing(false);

    let mut second = server.accept_timeout(WAIT).await.expect("reconnected socket");
    let replay = second.recv_json_timeout(WAIT).await.expect("replay");
    assert_eq!(method_of(&replay), Some("state_stream.subscribe"));
    let request = second.recv_json_timeout(WAIT).await.expect("queued call");
    assert_eq!(method_of(&request), Some("governor.status"));
    second.respond(&request["id"], json!({"gates": []})).unwrap();

    assert_eq!(call.await.unwrap(), Ok(json!({"gates": []})));

    feed.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_missed_pongs_force_reconnect() {
    let mut config = fast_config();
    config.keepalive = KeepaliveConfig {
        interval: Duration::from_millis(30),
        pong_timeout: Duration::from_millis(20),
        max_missed: 2,
    };
    let (feed, mut server) = mock_feed(config, MockFallback::new());
    let mut first = start_and_accept(&feed, &mut server).await;

    // Never answer pings.
    let ping = first.recv_json_timeout(WAIT).await.expect("ping");
    assert_eq!(ping["type"], json!("ping"));
    assert!(ping["timestamp"].is_u64());

    let second = server.accept_timeout(WAIT).await.expect("reconnect after missed pongs");
    wait_for_state(&feed, ConnectionState::Open).await;

    let stats = feed.connection().stats().await.unwrap();
    assert!(matches!(
        stats.last_disconnect,
        Some(DisconnectCause::PongTimeout { missed: 2 })
    ));
    assert_eq!(server.connection_count(), 2);

    drop(second);
    feed.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn answered_pings_keep_socket_and_record_rtt() {
    let mut config = fast_config();
    config.keepalive = KeepaliveConfig {
        interval: Duration::from_millis(20),
        pong_timeout: Duration::from_millis(200),
        max_missed: 2,
    };
    let (feed, mut server) = mock_feed(config, MockFallback::new());
    let mut socket = start_and_accept(&feed, &mut server).await;

    for _ in 0..4 {
        let ping = socket.recv_json_timeout(WAIT).await.expect("ping");
        socket
            .send_json(&json!({"type": "pong", "timestamp": ping["timestamp"]}))
            .unwrap();
    }

    let metrics = feed.metrics().clone();
    assert!(wait_until(WAIT, || metrics.snapshot().rtt.samples >= 4).await);
    assert_eq!(server.connection_count(), 1);
    assert_eq!(feed.connection().status(), ConnectionState::Open);

    feed.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gives_up_after_max_attempts() {
    let mut config = fast_config();
    config.reconnect.max_attempts = 3;
    let (feed, server) = mock_feed(config, MockFallback::new());
    server.set_refusing(true);

    feed.start().await.unwrap();
    wait_for_state(&feed, ConnectionState::Failed).await;
    // The first attempt plus three retries.
    assert_eq!(server.connect_attempts(), 4);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connect_attempts(), 4);

    // A manual connect gets a fresh budget.
    server.set_refusing(false);
    feed.start().await.unwrap();
    wait_for_state(&feed, ConnectionState::Open).await;

    feed.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_returns_to_idle_without_reconnect() {
    let (feed, mut server) = mock_feed(fast_config(), MockFallback::new());
    let mut socket = start_and_accept(&feed, &mut server).await;

    feed.connection().disconnect().await.unwrap();
    assert_eq!(feed.connection().status(), ConnectionState::Idle);

    let close = socket.recv_outbound_timeout(WAIT).await.expect("close frame");
    assert!(matches!(close, block_feed::core::WsFrame::Close(Some(ref f)) if f.code == 1000));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connect_attempts(), 1);
    let stats = feed.connection().stats().await.unwrap();
    assert_eq!(stats.last_disconnect, Some(DisconnectCause::CallerRequested));

    feed.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsubscribe_sends_once_and_skips_replay() {
    let (feed, mut server) = mock_feed(fast_config(), MockFallback::new());
    let mut socket = start_and_accept(&feed, &mut server).await;

    assert!(feed.subscribe("blocks").await.unwrap());
    let sub = socket.recv_json_timeout(WAIT).await.expect("subscribe");
    assert_eq!(method_of(&sub), Some("state_stream.subscribe"));
    socket.respond(&sub["id"], json!(true)).unwrap();

    assert!(feed.connection().unsubscribe("blocks").await.unwrap());
    assert!(!feed.connection().unsubscribe("blocks").await.unwrap());
    let unsub = socket.recv_json_timeout(WAIT).await.expect("unsubscribe");
    assert_eq!(method_of(&unsub), Some("state_stream.unsubscribe"));
    assert_eq!(unsub["params"], json!(["blocks"]));
    assert!(socket.recv_json_timeout(Duration::from_millis(50)).await.is_none());

    socket.drop_socket();
    let mut second = server.accept_timeout(WAIT).await.expect("reconnected");
    wait_for_state(&feed, ConnectionState::Open).await;
    assert!(second.recv_json_timeout(Duration::from_millis(50)).await.is_none());

    feed.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_socket_calls_are_swept_without_keepalive() {
    let (feed, mut server) = mock_feed(fast_config(), MockFallback::new());
    let _socket = start_and_accept(&feed, &mut server).await;

    let options = CallOptions::default()
        .retries(0)
        .timeout(Duration::from_millis(5))
        .transport(TransportChoice::Socket);
    for i in 0..20 {
        let result = feed
            .rpc()
            .call("consensus.block_height", json!({"n": i}), options)
            .await;
        assert!(matches!(result, Err(RpcError::Timeout { .. })), "{result:?}");
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = feed.connection().stats().await.unwrap();
    assert_eq!(stats.state, ConnectionState::Open);
    assert_eq!(stats.in_flight_socket_calls, 0);

    feed.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unacknowledged_topic_requests_expire() {
    let mut config = fast_config();
    config.topic_ack_timeout = Duration::from_millis(50);
    let (feed, mut server) = mock_feed(config, MockFallback::new());
    let mut socket = start_and_accept(&feed, &mut server).await;

    assert!(feed.subscribe("blocks").await.unwrap());
    assert!(feed.subscribe("receipts").await.unwrap());
    let first = socket.recv_json_timeout(WAIT).await.expect("subscribe");
    socket.recv_json_timeout(WAIT).await.expect("subscribe");
    socket.respond(&first["id"], json!(true)).unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(feed.connection().stats().await.unwrap().pending_topic_acks, 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let stats = feed.connection().stats().await.unwrap();
    assert_eq!(stats.pending_topic_acks, 0);
    assert_eq!(stats.subscriptions, 2);
    assert_eq!(stats.state, ConnectionState::Open);

    feed.shutdown().await;
}
