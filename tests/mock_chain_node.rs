mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use block_feed::testing::MockChain;
use block_feed::{CallOptions, ConnectionState, KeepaliveConfig, PushKind, TransportChoice};
use common::*;
use serde_json::{Value, json};

fn chain_config() -> block_feed::FeedConfig {
    let mut config = fast_config();
    config.keepalive = KeepaliveConfig {
        interval: Duration::from_millis(20),
        pong_timeout: Duration::from_millis(200),
        max_missed: 2,
    };
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn served_chain_drives_pushes_pongs_and_calls() {
    let chain = MockChain::with_tps_range(1000..=1000);
    chain.set_height(10);
    let (feed, mut server) = mock_feed(chain_config(), chain.clone());

    let latest = Arc::new(AtomicU64::new(0));
    let seen = latest.clone();
    feed.on(PushKind::BlockUpdate, move |message| {
        let height = message
            .data
            .get("height")
            .and_then(Value::as_u64)
            .ok_or("block_update without height")?;
        seen.store(height, Ordering::SeqCst);
        Ok(())
    });

    feed.start().await.unwrap();
    let socket = server.accept_timeout(WAIT).await.expect("socket accepted");
    let node = chain.serve(socket, Some(Duration::from_millis(20)));
    wait_for_state(&feed, ConnectionState::Open).await;

    assert!(feed.subscribe("blocks").await.unwrap());
    assert!(wait_until(WAIT, || latest.load(Ordering::SeqCst) >= 13).await);
    assert!(latest.load(Ordering::SeqCst) <= chain.height());

    let metrics = feed.metrics().clone();
    assert!(wait_until(WAIT, || metrics.snapshot().rtt.samples >= 2).await);

    let options = CallOptions::default().transport(TransportChoice::Socket);
    let reply = feed
        .rpc()
        .call("consensus.tps", json!({}), options)
        .await
        .unwrap();
    assert_eq!(reply["tps"], json!(1000));
    assert!(reply["block_height"].as_u64().unwrap() >= 13);

    let stats = feed.connection().stats().await.unwrap();
    assert_eq!(stats.pending_topic_acks, 0);
    assert_eq!(stats.missed_pongs, 0);
    assert_eq!(server.connection_count(), 1);

    node.abort();
    feed.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pushes_resume_after_node_restart() {
    let chain = MockChain::new();
    let (feed, mut server) = mock_feed(chain_config(), chain.clone());

    let latest = Arc::new(AtomicU64::new(0));
    let seen = latest.clone();
    feed.on(PushKind::BlockUpdate, move |message| {
        if let Some(height) = message.data.get("height").and_then(Value::as_u64) {
            seen.store(height, Ordering::SeqCst);
        }
        Ok(())
    });

    feed.start().await.unwrap();
    let first = chain.serve(
        server.accept_timeout(WAIT).await.expect("socket accepted"),
        Some(Duration::from_millis(20)),
    );
    wait_for_state(&feed, ConnectionState::Open).await;
    assert!(feed.subscribe("blocks").await.unwrap());
    assert!(wait_until(WAIT, || latest.load(Ordering::SeqCst) >= 2).await);

    first.abort();
    let restarted = server.accept_timeout(WAIT).await.expect("reconnected");
    let before = chain.height();
    let second = chain.serve(restarted, Some(Duration::from_millis(20)));
    wait_for_state(&feed, ConnectionState::Open).await;

    assert!(wait_until(WAIT, || latest.load(Ordering::SeqCst) > before).await);
    let stats = feed.connection().stats().await.unwrap();
    assert_eq!(stats.subscriptions, 1);
    assert_eq!(server.connection_count(), 2);

    second.abort();
    feed.shutdown().await;
}
