use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::http::{BatchItem, FallbackChannel};
use super::pending::{Detached, PendingExpired, PendingInsertOutcome, PendingTable};
use super::{AttemptError, RequestKey, RpcError, RpcResult};
use crate::config::RpcDefaults;
use crate::core::FeedMetrics;
use crate::transport::WsTransport;
use crate::ws::ConnectionHandle;

/// Which channel an attempt may use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportChoice {
    /// Socket while it is open, the fallback otherwise.
    #[default]
    Auto,
    Socket,
    Fallback,
}

/// Per-call overrides; unset fields take the client defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub transport: TransportChoice,
}

impl CallOptions {
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn transport(mut self, transport: TransportChoice) -> Self {
        self.transport = transport;
        self
    }
}

type Waiter = oneshot::Sender<RpcResult<Value>>;
type SharedTable = Arc<Mutex<PendingTable<Waiter>>>;

fn lock_table(table: &SharedTable) -> MutexGuard<'_, PendingTable<Waiter>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

struct ClientInner<T: WsTransport, F: FallbackChannel> {
    socket: Option<ConnectionHandle<T>>,
    fallback: Arc<F>,
    pending: SharedTable,
    metrics: Arc<FeedMetrics>,
    defaults: RpcDefaults,
    offline: bool,
    next_waiter: AtomicU64,
    next_id: AtomicU64,
}

/// Deduplicating JSON-RPC client.
///
/// Identical in-flight calls (same method and canonical params) share one attempt task and
/// every caller receives a copy of its outcome. Attempts go over the socket while it is open
/// and over the [`FallbackChannel`] otherwise.
pub struct RpcClient<T: WsTransport, F: FallbackChannel> {
    inner: Arc<ClientInner<T, F>>,
}

impl<T: WsTransport, F: FallbackChannel> Clone for RpcClient<T, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: WsTransport, F: FallbackChannel> RpcClient<T, F> {
    pub fn new(
        socket: Option<ConnectionHandle<T>>,
        fallback: Arc<F>,
        metrics: Arc<FeedMetrics>,
        defaults: RpcDefaults,
        offline: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                socket,
                fallback,
                pending: Arc::new(Mutex::new(PendingTable::new())),
                metrics,
                defaults,
                offline,
                next_waiter: AtomicU64::new(1),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn defaults(&self) -> RpcDefaults {
        self.inner.defaults
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline
    }

    /// Number of distinct calls currently in flight.
    pub fn in_flight(&self) -> usize {
        lock_table(&self.inner.pending).len()
    }

    /// Waiters attached to the in-flight call for `method`/`params`.
    pub fn waiters(&self, method: &str, params: &Value) -> usize {
        lock_table(&self.inner.pending).waiter_count(&RequestKey::new(method, params))
    }

    pub async fn call(&self, method: &str, params: Value, options: CallOptions) -> RpcResult<Value> {
        self.start(method, params, options).await
    }

    /// Register a call and return its cancellable handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, method: &str, params: Value, options: CallOptions) -> PendingCall {
        let metrics = self.inner.metrics.clone();
        if self.inner.offline {
            metrics.record_request_failed();
            return PendingCall::ready(
                Err(RpcError::CallFailed {
                    method: method.to_string(),
                    attempts: 0,
                    last: AttemptError::Offline,
                }),
                metrics,
            );
        }

        let key = RequestKey::new(method, &params);
        let waiter_id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let deadline = now + self.entry_lifetime(&options);

        let mut table = lock_table(&self.inner.pending);
        let expired = table.expire_due(now);
        let (outcome, evicted) = table.insert_or_join(&key, now, deadline, waiter_id, tx);
        let generation = outcome.generation();
        match outcome {
            PendingInsertOutcome::Joined { .. } => {
                metrics.record_dedup();
                debug!(method, fingerprint = key.fingerprint(), "joined in-flight call");
            }
            PendingInsertOutcome::Inserted { .. } => {
                let task = tokio::spawn(run_call(
                    self.inner.clone(),
                    key.clone(),
                    generation,
                    method.to_string(),
                    params,
                    options,
                ));
                table.attach_task(&key, generation, task.abort_handle());
            }
        }
        drop(table);

        for entry in expired.into_iter().chain(evicted) {
            fail_expired(entry, &metrics);
        }

        PendingCall {
            state: CallState::Waiting {
                rx,
                table: self.inner.pending.clone(),
                key,
                generation,
                waiter_id,
            },
            metrics,
        }
    }

    /// Send several calls in one fallback round-trip; results follow the order of `calls`.
    ///
    /// Batches are neither deduplicated nor routed over the socket. Retries cover the
    /// round-trip as a whole; per-item errors are returned as-is.
    pub async fn call_batch(
        &self,
        calls: &[(String, Value)],
        options: CallOptions,
    ) -> RpcResult<Vec<Result<Value, AttemptError>>> {
        const METHOD: &str = "batch";
        if self.inner.offline {
            self.inner.metrics.record_request_failed();
            return Err(RpcError::CallFailed {
                method: METHOD.to_string(),
                attempts: 0,
                last: AttemptError::Offline,
            });
        }
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let items: Vec<BatchItem> = calls
            .iter()
            .map(|(method, params)| BatchItem {
                id: self.inner.next_id(),
                method: method.clone(),
                params: params.clone(),
            })
            .collect();

        let inner = &self.inner;
        let started = Instant::now();
        let outcome = inner
            .with_retries(METHOD, &options, |_| inner.fallback.call_batch(items.clone()))
            .await;
        inner.record_outcome(&outcome, started.elapsed());
        outcome
    }

    /// `true` when the node answers `consensus.block_height` with a height.
    pub async fn health_check(&self) -> bool {
        let options = CallOptions::default().retries(0);
        match self
            .call(
                "consensus.block_height",
                Value::Object(Default::default()),
                options,
            )
            .await
        {
            Ok(value) => value.get("height").is_some(),
            Err(err) => {
                debug!(error = %err, "health check failed");
                false
            }
        }
    }

    /// Fail every in-flight call with [`RpcError::Cancelled`] and abort its attempt task.
    pub fn shutdown(&self) {
        let drained = lock_table(&self.inner.pending).drain();
        for entry in drained {
            if let Some(task) = entry.task {
                task.abort();
            }
            for waiter in entry.waiters {
                let _ = waiter.send(Err(RpcError::Cancelled));
            }
        }
    }

    /// Upper bound on how long an entry may stay joinable: every attempt timing out plus every
    /// backoff at its cap.
    fn entry_lifetime(&self, options: &CallOptions) -> Duration {
        let defaults = &self.inner.defaults;
        let retries = options.retries.unwrap_or(defaults.retries);
        let timeout = options.timeout.unwrap_or(defaults.timeout);
        timeout
            .saturating_mul(retries.saturating_add(1))
            .saturating_add(defaults.backoff_max.saturating_mul(retries))
    }
}

fn fail_expired(entry: PendingExpired<Waiter>, metrics: &FeedMetrics) {
    warn!(
        method = %entry.key.method(),
        fingerprint = entry.key.fingerprint(),
        attempts = entry.attempts,
        "pending call expired"
    );
    if let Some(task) = entry.task {
        task.abort();
    }
    metrics.record_request_timeout();
    let error = RpcError::Timeout {
        method: entry.key.method().to_string(),
        attempts: entry.attempts,
    };
    for waiter in entry.waiters {
        let _ = waiter.send(Err(error.clone()));
    }
}

async fn run_call<T: WsTransport, F: FallbackChannel>(
    inner: Arc<ClientInner<T, F>>,
    key: RequestKey,
    generation: u64,
    method: String,
    params: Value,
    options: CallOptions,
) {
    let started = Instant::now();
    let outcome = inner
        .with_retries(&method, &options, |_| {
            inner.attempt_once(&key, generation, &method, &params, options.transport)
        })
        .await;
    inner.record_outcome(&outcome, started.elapsed());

    let waiters = lock_table(&inner.pending).complete(&key, generation);
    let Some(waiters) = waiters else {
        // Every waiter left or the entry expired; nobody is listening.
        return;
    };
    for waiter in waiters {
        let _ = waiter.send(outcome.clone());
    }
}

impl<T: WsTransport, F: FallbackChannel> ClientInner<T, F> {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn record_outcome<V>(&self, outcome: &RpcResult<V>, elapsed: Duration) {
        self.metrics.record_call_latency(elapsed);
        match outcome {
            Ok(_) => {}
            Err(RpcError::Timeout { .. }) => self.metrics.record_request_timeout(),
            Err(err) => {
                self.metrics.record_request_failed();
                self.metrics.record_error("rpc", &err.to_string());
            }
        }
    }

    /// Run `attempt` until it succeeds, fails deterministically, or `retries + 1` attempts are
    /// spent. Each attempt is bounded by the call timeout.
    async fn with_retries<V, Fut, A>(
        &self,
        method: &str,
        options: &CallOptions,
        mut attempt: A,
    ) -> RpcResult<V>
    where
        A: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<V, AttemptError>>,
    {
        let retries = options.retries.unwrap_or(self.defaults.retries);
        let timeout = options.timeout.unwrap_or(self.defaults.timeout);
        let backoff = self.defaults.backoff();

        self.metrics.record_request();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = match tokio::time::timeout(timeout, attempt(attempts)).await {
                Ok(result) => result,
                Err(_) => Err(AttemptError::TimedOut(timeout)),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempts > retries || !err.is_retryable() {
                return Err(match err {
                    AttemptError::TimedOut(_) => RpcError::Timeout {
                        method: method.to_string(),
                        attempts,
                    },
                    last => RpcError::CallFailed {
                        method: method.to_string(),
                        attempts,
                        last,
                    },
                });
            }

            let delay = backoff.delay(attempts - 1);
            debug!(
                method,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying call"
            );
            self.metrics.record_retry();
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt_once(
        &self,
        key: &RequestKey,
        generation: u64,
        method: &str,
        params: &Value,
        choice: TransportChoice,
    ) -> Result<Value, AttemptError> {
        match choice {
            TransportChoice::Socket => {
                let Some(socket) = &self.socket else {
                    return Err(AttemptError::NotConnected);
                };
                self.mark_attempt(key, generation);
                socket.call(method, params, false).await
            }
            TransportChoice::Fallback => self.via_fallback(key, generation, method, params).await,
            TransportChoice::Auto => {
                if let Some(socket) = self.socket.as_ref().filter(|s| s.status().is_open()) {
                    self.mark_attempt(key, generation);
                    match socket.call(method, params, false).await {
                        Err(AttemptError::NotConnected) => {
                            debug!(method, "socket closed under call, using fallback");
                        }
                        other => return other,
                    }
                }
                self.via_fallback(key, generation, method, params).await
            }
        }
    }

    async fn via_fallback(
        &self,
        key: &RequestKey,
        generation: u64,
        method: &str,
        params: &Value,
    ) -> Result<Value, AttemptError> {
        self.mark_attempt(key, generation);
        self.fallback.call(self.next_id(), method, params).await
    }

    fn mark_attempt(&self, key: &RequestKey, generation: u64) {
        lock_table(&self.pending).record_attempt(key, generation);
    }
}

enum CallState {
    Ready(Option<RpcResult<Value>>),
    Waiting {
        rx: oneshot::Receiver<RpcResult<Value>>,
        table: SharedTable,
        key: RequestKey,
        generation: u64,
        waiter_id: u64,
    },
    Done,
}

/// A caller's view of an in-flight call.
///
/// Dropping it (or calling [`cancel`](Self::cancel)) detaches this caller only; the attempt
/// task is aborted once no caller is left.
#[must_use = "a dropped PendingCall cancels its share of the call"]
pub struct PendingCall {
    state: CallState,
    metrics: Arc<FeedMetrics>,
}

impl PendingCall {
    fn ready(outcome: RpcResult<Value>, metrics: Arc<FeedMetrics>) -> Self {
        Self {
            state: CallState::Ready(Some(outcome)),
            metrics,
        }
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Future for PendingCall {
    type Output = RpcResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let outcome = match &mut this.state {
            CallState::Ready(outcome) => outcome.take().unwrap_or(Err(RpcError::Cancelled)),
            CallState::Waiting { rx, .. } => match Pin::new(rx).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(outcome)) => outcome,
                Poll::Ready(Err(_)) => Err(RpcError::Cancelled),
            },
            CallState::Done => Err(RpcError::Cancelled),
        };
        this.state = CallState::Done;
        Poll::Ready(outcome)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        let CallState::Waiting {
            table,
            key,
            generation,
            waiter_id,
            ..
        } = &self.state
        else {
            return;
        };

        let detached = lock_table(table).detach(key, *generation, *waiter_id);
        match detached {
            Detached::NotFound => {}
            Detached::Remaining(remaining) => {
                self.metrics.record_request_cancelled();
                debug!(fingerprint = key.fingerprint(), remaining, "waiter detached");
            }
            Detached::Last { task } => {
                self.metrics.record_request_cancelled();
                if let Some(task) = task {
                    task.abort();
                }
                debug!(fingerprint = key.fingerprint(), "last waiter detached, call aborted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockFallback, MockTransport};
    use serde_json::json;

    fn client(fallback: MockFallback, defaults: RpcDefaults) -> RpcClient<MockTransport, MockFallback> {
        RpcClient::new(
            None,
            Arc::new(fallback),
            Arc::new(FeedMetrics::new()),
            defaults,
            false,
        )
    }

    fn quick_defaults() -> RpcDefaults {
        RpcDefaults {
            retries: 2,
            timeout: Duration::from_millis(200),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn identical_concurrent_calls_share_one_exchange() {
        let fallback = MockFallback::new().with_delay(Duration::from_millis(50));
        fallback.respond("governor.status", json!({"active": true}));
        let client = client(fallback.clone(), quick_defaults());

        let a = client.start("governor.status", json!({}), CallOptions::default());
        let b = client.start("governor.status", json!({}), CallOptions::default());
        assert_eq!(client.waiters("governor.status", &json!({})), 2);

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a, Ok(json!({"active": true})));
        assert_eq!(a, b);
        assert_eq!(fallback.calls("governor.status"), 1);
        assert_eq!(client.inner.metrics.snapshot().requests_deduplicated, 1);
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn retries_then_call_failed() {
        let fallback = MockFallback::new();
        fallback.fail("governor.status", AttemptError::Connection("refused".into()));
        let client = client(fallback.clone(), quick_defaults());

        let err = client
            .call("governor.status", json!({}), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RpcError::CallFailed {
                method: "governor.status".into(),
                attempts: 3,
                last: AttemptError::Connection("refused".into()),
            }
        );
        assert_eq!(fallback.calls("governor.status"), 3);
    }

    #[tokio::test]
    async fn remote_errors_are_not_retried() {
        let fallback = MockFallback::new();
        fallback.fail(
            "consensus.tps",
            AttemptError::Remote {
                code: -32601,
                message: "method not found".into(),
            },
        );
        let client = client(fallback.clone(), quick_defaults());

        let err = client
            .call("consensus.tps", json!({}), CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::CallFailed { attempts: 1, .. }));
        assert_eq!(fallback.calls("consensus.tps"), 1);
    }

    #[tokio::test]
    async fn final_timed_out_attempt_reports_timeout() {
        let fallback = MockFallback::new().with_delay(Duration::from_millis(200));
        fallback.respond("consensus.tps", json!({"tps": 1}));
        let client = client(fallback.clone(), quick_defaults());

        let options = CallOptions::default()
            .retries(1)
            .timeout(Duration::from_millis(20));
        let err = client.call("consensus.tps", json!({}), options).await.unwrap_err();
        assert_eq!(
            err,
            RpcError::Timeout {
                method: "consensus.tps".into(),
                attempts: 2
            }
        );
    }

    #[tokio::test]
    async fn cancelling_one_waiter_keeps_the_other() {
        let fallback = MockFallback::new().with_delay(Duration::from_millis(50));
        fallback.respond("consensus.block_height", json!({"height": 9}));
        let client = client(fallback.clone(), quick_defaults());

        let a = client.start("consensus.block_height", json!({}), CallOptions::default());
        let b = client.start("consensus.block_height", json!({}), CallOptions::default());
        a.cancel();

        assert_eq!(b.await, Ok(json!({"height": 9})));
        assert_eq!(client.inner.metrics.snapshot().requests_cancelled, 1);
    }

    #[tokio::test]
    async fn cancelling_last_waiter_removes_entry() {
        let fallback = MockFallback::new().with_delay(Duration::from_secs(5));
        fallback.respond("consensus.block_height", json!({"height": 9}));
        let client = client(fallback.clone(), quick_defaults());

        let call = client.start("consensus.block_height", json!({}), CallOptions::default());
        assert_eq!(client.in_flight(), 1);
        call.cancel();
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn offline_fails_without_transport() {
        let fallback = MockFallback::new();
        let client = RpcClient::<MockTransport, _>::new(
            None,
            Arc::new(fallback.clone()),
            Arc::new(FeedMetrics::new()),
            quick_defaults(),
            true,
        );

        let err = client
            .call("governor.status", json!({}), CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::CallFailed {
                attempts: 0,
                last: AttemptError::Offline,
                ..
            }
        ));
        assert_eq!(fallback.total_calls(), 0);
        assert!(!client.health_check().await);
    }

    #[tokio::test]
    async fn batch_returns_per_item_results() {
        let fallback = MockFallback::new();
        fallback.respond("consensus.block_height", json!({"height": 3}));
        let client = client(fallback.clone(), quick_defaults());

        let results = client
            .call_batch(
                &[
                    ("consensus.block_height".to_string(), json!({})),
                    ("unknown.method".to_string(), json!({})),
                ],
                CallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(results[0], Ok(json!({"height": 3})));
        assert!(results[1].is_err());
        assert_eq!(fallback.batches(), 1);
    }

    #[tokio::test]
    async fn health_check_requires_height() {
        let fallback = MockFallback::new();
        fallback.respond("consensus.block_height", json!({"height": 3}));
        assert!(client(fallback, quick_defaults()).health_check().await);

        let fallback = MockFallback::new();
        fallback.respond("consensus.block_height", json!({"tip": 3}));
        assert!(!client(fallback, quick_defaults()).health_check().await);
    }
}
