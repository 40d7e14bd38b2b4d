use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::FeedConfig;
use crate::core::{FeedMetrics, FeedResult, PushKind, PushMessage};
use crate::polling::{PollUpdate, PollingController};
use crate::router::{HandlerId, HandlerResult, MessageRouter};
use crate::rpc::{CallOptions, FallbackChannel, HttpFallback, RpcClient, RpcResult};
use crate::tls::install_rustls_crypto_provider;
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;
use crate::ws::{ConnectionHandle, ConnectionSettings};

const POLL_UPDATE_CAPACITY: usize = 256;

/// Everything one dashboard needs to stay current: the socket, the RPC client and the polling
/// fallback, wired from a single [`FeedConfig`].
///
/// Must be built inside a tokio runtime.
pub struct BlockFeed<T: WsTransport = TungsteniteTransport, F: FallbackChannel = HttpFallback> {
    config: FeedConfig,
    metrics: Arc<FeedMetrics>,
    router: Arc<MessageRouter>,
    connection: ConnectionHandle<T>,
    rpc: RpcClient<T, F>,
    polling: PollingController,
    poll_updates: Mutex<Option<mpsc::Receiver<PollUpdate>>>,
}

impl BlockFeed {
    /// tokio-tungstenite socket plus reqwest fallback.
    pub fn new(config: FeedConfig) -> FeedResult<Self> {
        install_rustls_crypto_provider();
        let fallback = HttpFallback::new(config.rpc_url.clone())?;
        Ok(Self::with_transports(
            config,
            TungsteniteTransport::default(),
            fallback,
        ))
    }
}

impl<T: WsTransport, F: FallbackChannel> BlockFeed<T, F> {
    pub fn with_transports(config: FeedConfig, transport: T, fallback: F) -> Self {
        let metrics = Arc::new(FeedMetrics::new());
        let router = Arc::new(MessageRouter::new(metrics.clone()));
        let connection = ConnectionHandle::spawn(
            ConnectionSettings {
                url: config.ws_url.clone(),
                transport,
                buffers: config.buffers,
                reconnect: config.reconnect.policy(),
                keepalive: config.keepalive,
                outbound_capacity: config.outbound_capacity,
                topic_ack_timeout: config.topic_ack_timeout,
            },
            router.clone(),
            metrics.clone(),
        );
        let rpc = RpcClient::new(
            Some(connection.clone()),
            Arc::new(fallback),
            metrics.clone(),
            config.rpc,
            config.offline,
        );

        let (updates_tx, updates_rx) = mpsc::channel(POLL_UPDATE_CAPACITY);
        let polling = if config.offline {
            PollingController::disabled()
        } else {
            PollingController::spawn(
                config.polling.clone(),
                connection.watch_status(),
                rpc.clone(),
                metrics.clone(),
                updates_tx,
            )
        };

        Self {
            config,
            metrics,
            router,
            connection,
            rpc,
            polling,
            poll_updates: Mutex::new(Some(updates_rx)),
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<FeedMetrics> {
        &self.metrics
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn connection(&self) -> &ConnectionHandle<T> {
        &self.connection
    }

    pub fn rpc(&self) -> &RpcClient<T, F> {
        &self.rpc
    }

    pub fn polling(&self) -> &PollingController {
        &self.polling
    }

    /// The poll update stream; `None` after the first call.
    pub fn take_poll_updates(&self) -> Option<mpsc::Receiver<PollUpdate>> {
        self.poll_updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn on<H>(&self, kind: PushKind, handler: H) -> HandlerId
    where
        H: Fn(&PushMessage) -> HandlerResult + Send + Sync + 'static,
    {
        self.router.on(kind, handler)
    }

    pub async fn subscribe(&self, topic: impl Into<String>) -> FeedResult<bool> {
        self.connection.subscribe(topic).await
    }

    pub async fn call(&self, method: &str, params: Value) -> RpcResult<Value> {
        self.rpc.call(method, params, CallOptions::default()).await
    }

    /// Open the socket. Offline feeds stay idle.
    pub async fn start(&self) -> FeedResult<()> {
        if self.config.offline {
            info!(rpc_url = %self.config.rpc_url, "offline mode, socket not started");
            return Ok(());
        }
        info!(url = %self.config.ws_url, chain_mode = ?self.config.chain_mode, "starting feed");
        self.connection.connect().await
    }

    /// Stop polling, cancel in-flight calls and tear the socket down.
    pub async fn shutdown(&self) {
        self.polling.shutdown();
        self.rpc.shutdown();
        self.connection.shutdown().await;
    }
}
