//! Reusable test utilities for exercising the feed without a node.
//!
//! - [`MockTransport`] / [`MockServer`]: in-memory sockets. Every `connect` produces a fresh
//!   [`MockSocket`] on the server side, so reconnects can be driven (and refused) from tests.
//! - [`MockFallback`]: scripted request channel that counts what it is asked.
//! - [`MockChain`]: synthetic chain answering the core read calls and producing
//!   `block_update` pushes, usable both as a fallback channel and as a socket peer.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::Sink;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::{
    FeedError, SUBSCRIBE_METHOD, UNSUBSCRIBE_METHOD, WebSocketBufferConfig, WsFrame, into_ws_frame,
    now_millis,
};
use crate::rpc::{AttemptError, BatchItem, FallbackChannel, FallbackFuture};
use crate::transport::{WsConnectFuture, WsTransport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn method_not_found(method: &str) -> AttemptError {
    AttemptError::Remote {
        code: -32601,
        message: format!("method not found: {method}"),
    }
}

#[derive(Default)]
struct MockControl {
    refuse_next: u32,
    refuse_all: bool,
    attempts: usize,
    connections: usize,
}

struct MockShared {
    accept_tx: mpsc::UnboundedSender<MockSocket>,
    control: Mutex<MockControl>,
}

/// A transport backed by in-memory channels.
///
/// Create it with [`MockTransport::channel_pair`] to obtain both the transport for the
/// connection actor and the [`MockServer`] that accepts its sockets.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

impl MockTransport {
    pub fn channel_pair() -> (Self, MockServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            accept_tx,
            control: Mutex::new(MockControl::default()),
        });
        (
            Self {
                shared: shared.clone(),
            },
            MockServer { accept_rx, shared },
        )
    }
}

impl WsTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(
        &self,
        _url: String,
        _buffers: WebSocketBufferConfig,
    ) -> WsConnectFuture<Self::Reader, Self::Writer> {
        let shared = self.shared.clone();
        Box::pin(async move {
            {
                let mut control = lock(&shared.control);
                control.attempts += 1;
                if control.refuse_all || control.refuse_next > 0 {
                    control.refuse_next = control.refuse_next.saturating_sub(1);
                    return Err(FeedError::ConnectionError(
                        "mock connection refused".to_string(),
                    ));
                }
                control.connections += 1;
            }

            let (sent_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, rx) = mpsc::unbounded_channel();
            // A server that stopped accepting drops the socket, which reads as a remote close.
            let _ = shared.accept_tx.send(MockSocket {
                outbound_rx,
                inbound_tx: Some(inbound_tx),
            });
            Ok((MockReader { rx }, MockWriter { sent_tx }))
        })
    }
}

/// Server-side test handle paired with [`MockTransport`].
pub struct MockServer {
    accept_rx: mpsc::UnboundedReceiver<MockSocket>,
    shared: Arc<MockShared>,
}

impl MockServer {
    /// Wait for the next accepted socket.
    pub async fn accept(&mut self) -> Option<MockSocket> {
        self.accept_rx.recv().await
    }

    pub async fn accept_timeout(&mut self, timeout: Duration) -> Option<MockSocket> {
        tokio::time::timeout(timeout, self.accept_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: u32) {
        lock(&self.shared.control).refuse_next = count;
    }

    /// Refuse every attempt until switched back.
    pub fn set_refusing(&self, refusing: bool) {
        lock(&self.shared.control).refuse_all = refusing;
    }

    /// Connection attempts seen, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        lock(&self.shared.control).attempts
    }

    /// Sockets successfully opened.
    pub fn connection_count(&self) -> usize {
        lock(&self.shared.control).connections
    }
}

/// Error surface for operations on [`MockSocket`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MockServerError {
    /// The inbound socket side was intentionally dropped.
    SocketDropped,
    /// The client side is no longer reading inbound frames.
    ChannelClosed,
}

impl std::fmt::Display for MockServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockServerError::SocketDropped => f.write_str("mock socket already dropped"),
            MockServerError::ChannelClosed => f.write_str("mock client channel is closed"),
        }
    }
}

impl std::error::Error for MockServerError {}

/// Server side of one accepted mock connection.
pub struct MockSocket {
    outbound_rx: mpsc::UnboundedReceiver<WsFrame>,
    inbound_tx: Option<mpsc::UnboundedSender<WsFrame>>,
}

impl MockSocket {
    /// Receive a frame written by the client.
    pub async fn recv_outbound(&mut self) -> Option<WsFrame> {
        self.outbound_rx.recv().await
    }

    pub async fn recv_outbound_timeout(&mut self, timeout: Duration) -> Option<WsFrame> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Next client data frame decoded as JSON; control frames are skipped.
    pub async fn recv_json_timeout(&mut self, timeout: Duration) -> Option<Value> {
        tokio::time::timeout(timeout, async {
            while let Some(frame) = self.outbound_rx.recv().await {
                if let Some(value) = frame.data().and_then(|d| serde_json::from_slice(d).ok()) {
                    return Some(value);
                }
            }
            None
        })
        .await
        .unwrap_or_default()
    }

    /// Next client JSON-RPC request (anything with a `method`); pings are skipped.
    pub async fn recv_request_timeout(&mut self, timeout: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let value = self.recv_json_timeout(remaining).await?;
            if value.get("method").is_some() {
                return Some(value);
            }
        }
    }

    pub fn send_inbound(&self, frame: WsFrame) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(frame).map_err(|_| MockServerError::ChannelClosed)
    }

    pub fn send_text(&self, text: impl AsRef<str>) -> Result<(), MockServerError> {
        self.send_inbound(into_ws_frame(text.as_ref().as_bytes().to_vec()))
    }

    pub fn send_json(&self, value: &Value) -> Result<(), MockServerError> {
        self.send_text(value.to_string())
    }

    /// Answer request `id` with `result`.
    pub fn respond(&self, id: &Value, result: Value) -> Result<(), MockServerError> {
        self.send_json(&json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }

    /// Push `{type: kind, data}` to the client.
    pub fn push(&self, kind: &str, data: Value) -> Result<(), MockServerError> {
        self.send_json(&json!({"type": kind, "data": data, "timestamp": now_millis()}))
    }

    /// Simulate a server-side socket drop by closing the inbound channel.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }

    pub fn is_dropped(&self) -> bool {
        self.inbound_tx.is_none()
    }
}

/// Reader side for [`MockTransport`].
pub struct MockReader {
    rx: mpsc::UnboundedReceiver<WsFrame>,
}

impl futures_util::Stream for MockReader {
    type Item = Result<WsFrame, FeedError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

/// Writer side for [`MockTransport`].
pub struct MockWriter {
    sent_tx: mpsc::UnboundedSender<WsFrame>,
}

impl Sink<WsFrame> for MockWriter {
    type Error = FeedError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        self.get_mut()
            .sent_tx
            .send(item)
            .map_err(|_| FeedError::Transport {
                context: "mock_transport_write",
                error: "mock outbound channel closed".to_string(),
            })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Default)]
struct FallbackScript {
    responses: HashMap<String, Result<Value, AttemptError>>,
    calls: HashMap<String, usize>,
    call_times: HashMap<String, Vec<Instant>>,
    batches: usize,
}

/// Scripted [`FallbackChannel`].
///
/// Methods without a scripted answer fail with a JSON-RPC "method not found" error.
#[derive(Clone, Default)]
pub struct MockFallback {
    script: Arc<Mutex<FallbackScript>>,
    delay: Option<Duration>,
}

impl MockFallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every answer; applies to clones made afterwards.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn respond(&self, method: &str, result: Value) {
        lock(&self.script)
            .responses
            .insert(method.to_string(), Ok(result));
    }

    pub fn fail(&self, method: &str, error: AttemptError) {
        lock(&self.script)
            .responses
            .insert(method.to_string(), Err(error));
    }

    /// Requests seen for `method`, batch items included.
    pub fn calls(&self, method: &str) -> usize {
        lock(&self.script).calls.get(method).copied().unwrap_or(0)
    }

    /// When each request for `method` arrived, oldest first.
    pub fn call_times(&self, method: &str) -> Vec<Instant> {
        lock(&self.script)
            .call_times
            .get(method)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.script).calls.values().sum()
    }

    pub fn batches(&self) -> usize {
        lock(&self.script).batches
    }

    fn answer(&self, method: &str) -> Result<Value, AttemptError> {
        let mut script = lock(&self.script);
        *script.calls.entry(method.to_string()).or_default() += 1;
        script
            .call_times
            .entry(method.to_string())
            .or_default()
            .push(Instant::now());
        script
            .responses
            .get(method)
            .cloned()
            .unwrap_or_else(|| Err(method_not_found(method)))
    }
}

impl FallbackChannel for MockFallback {
    fn call(&self, _id: u64, method: &str, _params: &Value) -> FallbackFuture<Value> {
        let outcome = self.answer(method);
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            outcome
        })
    }

    fn call_batch(&self, items: Vec<BatchItem>) -> FallbackFuture<Vec<Result<Value, AttemptError>>> {
        lock(&self.script).batches += 1;
        let outcomes: Vec<_> = items.iter().map(|item| self.answer(&item.method)).collect();
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(outcomes)
        })
    }
}

struct ChainState {
    height: AtomicU64,
    tps_range: RangeInclusive<u32>,
    rng: Mutex<SmallRng>,
}

/// Synthetic chain for offline runs and tests.
#[derive(Clone)]
pub struct MockChain {
    state: Arc<ChainState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub const DEFAULT_TPS: RangeInclusive<u32> = 700..=2600;

    pub fn new() -> Self {
        Self::with_tps_range(Self::DEFAULT_TPS)
    }

    pub fn with_tps_range(tps_range: RangeInclusive<u32>) -> Self {
        Self {
            state: Arc::new(ChainState {
                height: AtomicU64::new(1),
                tps_range,
                rng: Mutex::new(SmallRng::from_entropy()),
            }),
        }
    }

    pub fn height(&self) -> u64 {
        self.state.height.load(Ordering::Relaxed)
    }

    pub fn set_height(&self, height: u64) {
        self.state.height.store(height, Ordering::Relaxed);
    }

    /// Produce the next block; returns its height.
    pub fn advance(&self) -> u64 {
        self.state.height.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn tps(&self) -> u32 {
        let range = self.state.tps_range.clone();
        if range.is_empty() {
            return *range.start();
        }
        lock(&self.state.rng).gen_range(range)
    }

    pub fn answer(&self, method: &str, _params: &Value) -> Result<Value, AttemptError> {
        let height = self.height();
        match method {
            "consensus.block_height" => Ok(json!({ "height": height })),
            "consensus.tps" => Ok(json!({ "tps": self.tps(), "block_height": height })),
            "governor.status" => Ok(json!({
                "gates": [
                    { "name": "trade", "state": "Trade", "enter_streak": 3, "streak_required": 3 },
                    { "name": "compute", "state": "Rehearsal", "enter_streak": 1, "streak_required": 3 },
                ],
                "block_height": height,
            })),
            other => Err(method_not_found(other)),
        }
    }

    /// `block_update` push payload for the current height.
    pub fn block_update(&self) -> Value {
        json!({
            "type": "block_update",
            "data": { "height": self.height(), "tps": self.tps() },
            "timestamp": now_millis(),
        })
    }

    /// Act as the node behind `socket`: answer requests and pings, acknowledge subscriptions
    /// and, with `block_interval`, advance the chain and push a `block_update` per interval.
    pub fn serve(&self, mut socket: MockSocket, block_interval: Option<Duration>) -> JoinHandle<()> {
        let chain = self.clone();
        tokio::spawn(async move {
            let mut blocks = block_interval.map(|every| {
                let mut ticker = tokio::time::interval(every);
                ticker.reset();
                ticker
            });
            loop {
                let frame = tokio::select! {
                    frame = socket.recv_outbound() => frame,
                    _ = async {
                        match blocks.as_mut() {
                            Some(ticker) => { ticker.tick().await; }
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        chain.advance();
                        if socket.send_json(&chain.block_update()).is_err() {
                            return;
                        }
                        continue;
                    }
                };
                let Some(frame) = frame else { return };
                if let Some(reply) = chain.reply_to(&frame) {
                    if socket.send_json(&reply).is_err() {
                        return;
                    }
                }
            }
        })
    }

    fn reply_to(&self, frame: &WsFrame) -> Option<Value> {
        let request: Value = serde_json::from_slice(frame.data()?).ok()?;
        if request.get("type").and_then(Value::as_str) == Some("ping") {
            return Some(json!({ "type": "pong", "timestamp": request.get("timestamp")? }));
        }
        let id = request.get("id")?.clone();
        let method = request.get("method")?.as_str()?;
        if method == SUBSCRIBE_METHOD || method == UNSUBSCRIBE_METHOD {
            return Some(json!({ "jsonrpc": "2.0", "id": id, "result": true }));
        }
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        Some(match self.answer(method, &params) {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(AttemptError::Remote { code, message }) => {
                json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
            }
            Err(other) => {
                json!({ "jsonrpc": "2.0", "id": id, "error": { "code": -32000, "message": other.to_string() } })
            }
        })
    }
}

impl FallbackChannel for MockChain {
    fn call(&self, _id: u64, method: &str, params: &Value) -> FallbackFuture<Value> {
        let outcome = self.answer(method, params);
        Box::pin(async move { outcome })
    }

    fn call_batch(&self, items: Vec<BatchItem>) -> FallbackFuture<Vec<Result<Value, AttemptError>>> {
        let outcomes = items
            .iter()
            .map(|item| self.answer(&item.method, &item.params))
            .collect();
        Box::pin(async move { Ok(outcomes) })
    }
}
