//! Periodic re-issue of a fixed call list while the socket is down.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::{PollCall, PollingConfig};
use crate::core::{ConnectionState, FeedMetrics};
use crate::rpc::{CallOptions, FallbackChannel, RpcClient, RpcResult};
use crate::transport::WsTransport;

/// One polled result.
#[derive(Clone, Debug, PartialEq)]
pub struct PollUpdate {
    pub method: String,
    pub params: Value,
    pub result: RpcResult<Value>,
}

/// Watches connection status and polls through the RPC client while the socket has been
/// down for longer than the grace period.
pub struct PollingController {
    active: Arc<watch::Sender<bool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingController {
    pub fn spawn<T, F>(
        config: PollingConfig,
        status: watch::Receiver<ConnectionState>,
        client: RpcClient<T, F>,
        metrics: Arc<FeedMetrics>,
        updates: mpsc::Sender<PollUpdate>,
    ) -> Self
    where
        T: WsTransport,
        F: FallbackChannel,
    {
        let active = Arc::new(watch::Sender::new(false));
        let task = tokio::spawn(run(
            config,
            status,
            client,
            metrics,
            active.clone(),
            updates,
        ));
        Self {
            active,
            task: Mutex::new(Some(task)),
        }
    }

    /// A controller that never polls; used for offline feeds.
    pub fn disabled() -> Self {
        Self {
            active: Arc::new(watch::Sender::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    pub fn watch_active(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }

    /// Stop polling for good; in-flight poll calls are dropped.
    pub fn shutdown(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.active.send_replace(false);
    }
}

impl Drop for PollingController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run<T, F>(
    config: PollingConfig,
    mut status: watch::Receiver<ConnectionState>,
    client: RpcClient<T, F>,
    metrics: Arc<FeedMetrics>,
    active: Arc<watch::Sender<bool>>,
    updates: mpsc::Sender<PollUpdate>,
) where
    T: WsTransport,
    F: FallbackChannel,
{
    loop {
        if !wait_for_outage(&mut status, config.grace).await {
            break;
        }
        info!(interval_ms = config.interval.as_millis() as u64, "socket down, polling started");
        active.send_replace(true);

        let mut ticker = tokio::time::interval(config.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let reopened = loop {
            tokio::select! {
                biased;
                open = async { status.wait_for(|s| s.is_open()).await.is_ok() } => break open,
                _ = async {
                    ticker.tick().await;
                    poll_cycle(&client, &config.calls, &metrics, &updates).await;
                } => {}
            }
        };

        active.send_replace(false);
        if !reopened {
            break;
        }
        info!("socket open, polling stopped");
    }
    active.send_replace(false);
    debug!("status channel closed, polling task exiting");
}

/// Resolves `true` once the status has been non-open for `grace` without interruption,
/// `false` when the status channel closes.
async fn wait_for_outage(status: &mut watch::Receiver<ConnectionState>, grace: Duration) -> bool {
    loop {
        if status.wait_for(|s| !s.is_open()).await.is_err() {
            return false;
        }
        let reopened =
            tokio::time::timeout(grace, async { status.wait_for(|s| s.is_open()).await.is_ok() })
                .await;
        match reopened {
            Err(_) => return true,
            Ok(true) => continue,
            Ok(false) => return false,
        }
    }
}

async fn poll_cycle<T, F>(
    client: &RpcClient<T, F>,
    calls: &[PollCall],
    metrics: &FeedMetrics,
    updates: &mpsc::Sender<PollUpdate>,
) where
    T: WsTransport,
    F: FallbackChannel,
{
    metrics.record_poll_cycle();
    let results = join_all(
        calls
            .iter()
            .map(|call| client.call(&call.method, call.params.clone(), CallOptions::default())),
    )
    .await;

    for (call, result) in calls.iter().zip(results) {
        if let Err(err) = &result {
            debug!(method = %call.method, error = %err, "poll call failed");
        }
        let update = PollUpdate {
            method: call.method.clone(),
            params: call.params.clone(),
            result,
        };
        // A slow or absent consumer must not stall polling.
        match updates.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                metrics.record_poll_update_dropped();
                debug!(method = %update.method, "poll update channel full, update dropped");
            }
            Err(TrySendError::Closed(_)) => {
                metrics.record_poll_update_dropped();
            }
        }
    }
}
