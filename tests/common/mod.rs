#![allow(dead_code)]

use std::time::{Duration, Instant};

use block_feed::testing::{MockFallback, MockServer, MockSocket, MockTransport};
use block_feed::{
    BlockFeed, ConnectionState, FeedConfig, KeepaliveConfig, PollingConfig, ReconnectConfig,
    RpcDefaults,
};
use serde_json::Value;

pub type MockFeed<F = MockFallback> = BlockFeed<MockTransport, F>;

pub const WAIT: Duration = Duration::from_secs(3);

/// Millisecond-scale timings; keepalive off unless a test turns it on.
pub fn fast_config() -> FeedConfig {
    let mut config = FeedConfig::default();
    config.ws_url = "ws://mock.local/feed".to_string();
    config.reconnect = ReconnectConfig {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        jitter_ratio: 0.0,
        max_attempts: 20,
    };
    config.keepalive = KeepaliveConfig {
        interval: Duration::ZERO,
        pong_timeout: Duration::from_millis(20),
        max_missed: 2,
    };
    config.rpc = RpcDefaults {
        retries: 2,
        timeout: Duration::from_millis(500),
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
    };
    config.polling = PollingConfig {
        interval: Duration::from_millis(50),
        // Tests that exercise polling shorten this.
        grace: Duration::from_secs(60),
        ..PollingConfig::default()
    };
    config
}

pub fn mock_feed<F: block_feed::rpc::FallbackChannel>(
    config: FeedConfig,
    fallback: F,
) -> (MockFeed<F>, MockServer) {
    let (transport, server) = MockTransport::channel_pair();
    (BlockFeed::with_transports(config, transport, fallback), server)
}

pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state<F: block_feed::rpc::FallbackChannel>(
    feed: &MockFeed<F>,
    state: ConnectionState,
) {
    let mut status = feed.connection().watch_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .expect("status channel open");
}

/// Start the feed and return the first accepted socket once the feed reports open.
pub async fn start_and_accept<F: block_feed::rpc::FallbackChannel>(
    feed: &MockFeed<F>,
    server: &mut MockServer,
) -> MockSocket {
    feed.start().await.expect("start");
    let socket = server.accept_timeout(WAIT).await.expect("socket accepted");
    wait_for_state(feed, ConnectionState::Open).await;
    socket
}

pub fn method_of(frame: &Value) -> Option<&str> {
    frame.get("method").and_then(Value::as_str)
}
