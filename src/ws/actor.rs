//! Connection manager actor.
//!
//! The actor owns the socket state machine, the subscription registry and the socket-side
//! correlation table. Reads happen in a task outside kameo and arrive as epoch-tagged events;
//! writes go through a linked [`WsWriterActor`]. Every state transition bumps the epoch, so
//! timers and socket events created under a superseded connection are dropped on arrival.

use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use kameo::actor::{ActorID, ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::prelude::{Actor, Context, Message as KameoMessage};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::writer::{WriterClose, WriterWrite, WriterWriteBatch, WsWriterActor};
use crate::config::KeepaliveConfig;
use crate::core::{
    ConnectionState, ConnectionStats, DisconnectCause, FeedError, FeedMetrics, FeedResult,
    Inbound, Keepalive, KeepaliveTick, ReconnectPlan, ReconnectPolicy, RpcResponse,
    WebSocketBufferConfig, WsFrame, decode_inbound, encode_request, encode_subscribe,
    encode_unsubscribe, into_ws_frame, now_millis,
};
use crate::router::MessageRouter;
use crate::rpc::AttemptError;
use crate::subscriptions::SubscriptionRegistry;
use crate::transport::WsTransport;

pub type SocketCallResult = Result<Value, AttemptError>;

/// Upper bound on how often abandoned correlation entries are swept while open.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Static settings for one managed connection.
#[derive(Clone)]
pub struct ConnectionSettings<T: WsTransport> {
    pub url: String,
    pub transport: T,
    pub buffers: WebSocketBufferConfig,
    pub reconnect: ReconnectPolicy,
    pub keepalive: KeepaliveConfig,
    /// Socket calls buffered while connecting or reconnecting.
    pub outbound_capacity: usize,
    pub topic_ack_timeout: Duration,
}

pub struct ConnectionArgs<T: WsTransport> {
    pub settings: ConnectionSettings<T>,
    pub router: Arc<MessageRouter>,
    pub metrics: Arc<FeedMetrics>,
    pub status_tx: watch::Sender<ConnectionState>,
}

struct InFlightCall {
    method: String,
    reply: oneshot::Sender<SocketCallResult>,
}

struct TopicRequest {
    topic: String,
    sent_at: Instant,
}

struct QueuedCall {
    method: String,
    params: Value,
    reply: oneshot::Sender<SocketCallResult>,
}

pub struct ConnectionActor<T: WsTransport> {
    url: String,
    transport: T,
    buffers: WebSocketBufferConfig,
    reconnect: ReconnectPolicy,
    keepalive: Keepalive,
    outbound_capacity: usize,
    topic_ack_timeout: Duration,
    router: Arc<MessageRouter>,
    metrics: Arc<FeedMetrics>,
    actor_ref: ActorRef<Self>,
    state: ConnectionState,
    attempt: u32,
    epoch: u64,
    status_tx: watch::Sender<ConnectionState>,
    subscriptions: SubscriptionRegistry,
    next_request_id: u64,
    in_flight: HashMap<u64, InFlightCall>,
    queued: VecDeque<QueuedCall>,
    /// Subscribe/unsubscribe request ids awaiting acknowledgement.
    topic_requests: HashMap<u64, TopicRequest>,
    connect_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    keepalive_task: Option<JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    writer_ref: Option<ActorRef<WsWriterActor<T::Writer>>>,
    opened_at: Option<Instant>,
    last_message_at: Option<Instant>,
    last_disconnect: Option<DisconnectCause>,
}

impl<T: WsTransport> Actor for ConnectionActor<T> {
    type Args = ConnectionArgs<T>;
    type Error = FeedError;

    fn name() -> &'static str {
        "ConnectionActor"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> FeedResult<Self> {
        let ConnectionArgs {
            settings,
            router,
            metrics,
            status_tx,
        } = args;
        let (shutdown_tx, _) = watch::channel(false);
        status_tx.send_replace(ConnectionState::Idle);

        Ok(Self {
            url: settings.url,
            transport: settings.transport,
            buffers: settings.buffers,
            reconnect: settings.reconnect,
            keepalive: Keepalive::new(settings.keepalive),
            outbound_capacity: settings.outbound_capacity,
            topic_ack_timeout: settings.topic_ack_timeout,
            router,
            metrics,
            actor_ref,
            state: ConnectionState::Idle,
            attempt: 0,
            epoch: 0,
            status_tx,
            subscriptions: SubscriptionRegistry::new(),
            next_request_id: 1,
            in_flight: HashMap::new(),
            queued: VecDeque::new(),
            topic_requests: HashMap::new(),
            connect_task: None,
            retry_task: None,
            reader_task: None,
            keepalive_task: None,
            sweep_task: None,
            shutdown_tx,
            writer_ref: None,
            opened_at: None,
            last_message_at: None,
            last_disconnect: None,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: ActorStopReason,
    ) -> FeedResult<()> {
        Self::abort_task(&mut self.connect_task);
        Self::abort_task(&mut self.retry_task);
        self.teardown_io().await;
        self.fail_in_flight(AttemptError::NotConnected);
        self.fail_queued(AttemptError::NotConnected);
        self.transition(ConnectionState::Idle);
        self.publish();
        Ok(())
    }

    async fn on_link_died(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        id: ActorID,
        reason: ActorStopReason,
    ) -> Result<ControlFlow<ActorStopReason>, Self::Error> {
        let current_writer = self
            .writer_ref
            .as_ref()
            .is_some_and(|writer| writer.id() == id);
        if !current_writer || matches!(reason, ActorStopReason::Normal | ActorStopReason::Killed)
        {
            return Ok(ControlFlow::Continue(()));
        }

        warn!(
            connection = %self.url,
            reason = %reason,
            "writer actor died; treating as socket failure"
        );
        // Already gone; teardown must not try to stop it again.
        self.writer_ref = None;
        self.handle_socket_lost(DisconnectCause::WriterStopped {
            reason: reason.to_string(),
        })
        .await;
        Ok(ControlFlow::Continue(()))
    }
}

/// Open the socket. Fails with `AlreadyConnecting` while connecting or open.
pub struct Connect;

/// Caller-initiated close; ends in `Idle`.
pub struct Disconnect;

pub struct Subscribe {
    pub topic: String,
}

pub struct Unsubscribe {
    pub topic: String,
}

/// A JSON-RPC request sent over the socket; the outcome arrives on `reply`.
pub struct SocketCall {
    pub method: String,
    pub params: Value,
    /// Queue the call while connecting or reconnecting instead of refusing it.
    pub wait_for_open: bool,
    pub reply: oneshot::Sender<SocketCallResult>,
}

pub struct GetConnectionStats;

pub(crate) enum ConnectionEvent {
    RetryConnect { epoch: u64 },
    KeepaliveTick { epoch: u64 },
    Sweep { epoch: u64 },
    Frame { epoch: u64, frame: WsFrame },
    Closed { epoch: u64, cause: DisconnectCause },
}

pub(crate) struct ConnectionEstablished<T: WsTransport> {
    epoch: u64,
    reader: T::Reader,
    writer: T::Writer,
}

pub(crate) struct ConnectionFailed {
    epoch: u64,
    error: String,
}

impl<T: WsTransport> KameoMessage<Connect> for ConnectionActor<T> {
    type Reply = FeedResult<()>;

    async fn handle(&mut self, _msg: Connect, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open => {
                Err(FeedError::AlreadyConnecting)
            }
            ConnectionState::Closing => {
                Err(FeedError::InvalidState("connection is closing".to_string()))
            }
            ConnectionState::Idle | ConnectionState::Failed => {
                // A manual connect gets a fresh attempt budget.
                self.attempt = 0;
                self.begin_connect();
                Ok(())
            }
            ConnectionState::Reconnecting => {
                Self::abort_task(&mut self.retry_task);
                self.begin_connect();
                Ok(())
            }
        }
    }
}

impl<T: WsTransport> KameoMessage<Disconnect> for ConnectionActor<T> {
    type Reply = FeedResult<()>;

    async fn handle(
        &mut self,
        _msg: Disconnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.state == ConnectionState::Idle {
            return Ok(());
        }

        self.transition(ConnectionState::Closing);
        self.publish();
        Self::abort_task(&mut self.connect_task);
        Self::abort_task(&mut self.retry_task);
        if let Some(writer) = self.writer_ref.as_ref() {
            if let Err(err) = writer.ask(WriterClose).await {
                debug!(connection = %self.url, error = %err, "close frame not delivered");
            }
        }
        self.teardown_io().await;
        self.fail_in_flight(AttemptError::NotConnected);
        self.fail_queued(AttemptError::NotConnected);
        self.keepalive.reset();
        self.attempt = 0;
        self.last_disconnect = Some(DisconnectCause::CallerRequested);
        self.transition(ConnectionState::Idle);
        self.publish();
        info!(connection = %self.url, "socket closed by caller");
        Ok(())
    }
}

impl<T: WsTransport> KameoMessage<Subscribe> for ConnectionActor<T> {
    type Reply = FeedResult<bool>;

    async fn handle(&mut self, msg: Subscribe, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let changed = self.subscriptions.add(&msg.topic);
        if changed && self.state == ConnectionState::Open {
            let id = self.next_id();
            let frame = into_ws_frame(encode_subscribe(id, &msg.topic)?);
            self.track_topic_request(id, msg.topic);
            if let Err(err) = self.write(frame).await {
                self.handle_socket_lost(DisconnectCause::WriteFailure {
                    error: err.to_string(),
                })
                .await;
            }
        }
        Ok(changed)
    }
}

impl<T: WsTransport> KameoMessage<Unsubscribe> for ConnectionActor<T> {
    type Reply = FeedResult<bool>;

    async fn handle(
        &mut self,
        msg: Unsubscribe,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let changed = self.subscriptions.remove(&msg.topic);
        if changed && self.state == ConnectionState::Open {
            let id = self.next_id();
            let frame = into_ws_frame(encode_unsubscribe(id, &msg.topic)?);
            self.track_topic_request(id, msg.topic);
            if let Err(err) = self.write(frame).await {
                self.handle_socket_lost(DisconnectCause::WriteFailure {
                    error: err.to_string(),
                })
                .await;
            }
        }
        Ok(changed)
    }
}

impl<T: WsTransport> KameoMessage<SocketCall> for ConnectionActor<T> {
    type Reply = ();

    async fn handle(&mut self, msg: SocketCall, _ctx: &mut Context<Self, Self::Reply>) {
        match self.state {
            ConnectionState::Open => {
                if let Err(err) = self.send_call(msg.method, msg.params, msg.reply).await {
                    self.handle_socket_lost(DisconnectCause::WriteFailure {
                        error: err.to_string(),
                    })
                    .await;
                }
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting if msg.wait_for_open => {
                if self.queued.len() >= self.outbound_capacity {
                    self.metrics
                        .record_error("outbound", "socket call queue full");
                    let _ = msg.reply.send(Err(AttemptError::Connection(
                        FeedError::OutboundQueueFull.to_string(),
                    )));
                    return;
                }
                self.queued.push_back(QueuedCall {
                    method: msg.method,
                    params: msg.params,
                    reply: msg.reply,
                });
            }
            _ => {
                let _ = msg.reply.send(Err(AttemptError::NotConnected));
            }
        }
    }
}

impl<T: WsTransport> KameoMessage<GetConnectionStats> for ConnectionActor<T> {
    type Reply = FeedResult<ConnectionStats>;

    async fn handle(
        &mut self,
        _msg: GetConnectionStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.sweep_abandoned();
        Ok(ConnectionStats {
            state: self.state,
            attempt: self.attempt,
            subscriptions: self.subscriptions.len(),
            in_flight_socket_calls: self.in_flight.len(),
            queued_socket_calls: self.queued.len(),
            pending_topic_acks: self.topic_requests.len(),
            outstanding_pings: self.keepalive.outstanding(),
            missed_pongs: self.keepalive.missed(),
            open_for: self.opened_at.map(|at| at.elapsed()),
            last_message_age: self.last_message_at.map(|at| at.elapsed()),
            last_disconnect: self.last_disconnect.clone(),
        })
    }
}

impl<T: WsTransport> KameoMessage<ConnectionEvent> for ConnectionActor<T> {
    type Reply = ();

    async fn handle(&mut self, event: ConnectionEvent, _ctx: &mut Context<Self, Self::Reply>) {
        match event {
            ConnectionEvent::RetryConnect { epoch } => {
                if epoch == self.epoch && self.state == ConnectionState::Reconnecting {
                    self.retry_task = None;
                    self.begin_connect();
                }
            }
            ConnectionEvent::KeepaliveTick { epoch } => {
                if epoch == self.epoch {
                    self.on_keepalive_tick().await;
                }
            }
            ConnectionEvent::Sweep { epoch } => {
                if epoch == self.epoch {
                    self.sweep_abandoned();
                }
            }
            ConnectionEvent::Frame { epoch, frame } => {
                if epoch == self.epoch {
                    self.on_frame(frame).await;
                }
            }
            ConnectionEvent::Closed { epoch, cause } => {
                if epoch == self.epoch {
                    self.handle_socket_lost(cause).await;
                }
            }
        }
    }
}

impl<T: WsTransport> KameoMessage<ConnectionEstablished<T>> for ConnectionActor<T> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ConnectionEstablished<T>,
        _ctx: &mut Context<Self, Self::Reply>,
    ) {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connecting {
            debug!(connection = %self.url, "dropping socket opened for a superseded attempt");
            return;
        }
        self.connect_task = None;
        if let Err(err) = self.on_open(msg.reader, msg.writer).await {
            self.handle_socket_lost(DisconnectCause::WriteFailure {
                error: err.to_string(),
            })
            .await;
        }
    }
}

impl<T: WsTransport> KameoMessage<ConnectionFailed> for ConnectionActor<T> {
    type Reply = ();

    async fn handle(&mut self, msg: ConnectionFailed, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connecting {
            return;
        }
        self.connect_task = None;
        self.metrics.record_connection_failure();
        self.metrics.record_error("connect", &msg.error);
        let cause = DisconnectCause::HandshakeFailed { message: msg.error };
        self.last_disconnect = Some(cause.clone());
        self.schedule_reconnect(&cause);
    }
}

impl<T: WsTransport> ConnectionActor<T> {
    fn transition(&mut self, state: ConnectionState) {
        self.state = state;
        self.epoch = self.epoch.wrapping_add(1);
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.state);
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }

    fn abort_task(task: &mut Option<JoinHandle<()>>) {
        if let Some(task) = task.take() {
            task.abort();
        }
    }

    fn begin_connect(&mut self) {
        self.transition(ConnectionState::Connecting);
        self.publish();

        let epoch = self.epoch;
        let actor_ref = self.actor_ref.clone();
        let transport = self.transport.clone();
        let url = self.url.clone();
        let buffers = self.buffers;
        debug!(connection = %self.url, attempt = self.attempt, "opening socket");

        self.connect_task = Some(tokio::spawn(async move {
            match transport.connect(url, buffers).await {
                Ok((reader, writer)) => {
                    let _ = actor_ref
                        .tell(ConnectionEstablished::<T> {
                            epoch,
                            reader,
                            writer,
                        })
                        .send()
                        .await;
                }
                Err(err) => {
                    let _ = actor_ref
                        .tell(ConnectionFailed {
                            epoch,
                            error: err.to_string(),
                        })
                        .send()
                        .await;
                }
            }
        }));
    }

    /// Open sequence, all in one actor turn: writer, reader, subscription replay, keepalive,
    /// queued calls, then the status update.
    async fn on_open(&mut self, reader: T::Reader, writer: T::Writer) -> FeedResult<()> {
        info!(connection = %self.url, attempt = self.attempt, "socket open");
        self.transition(ConnectionState::Open);
        self.attempt = 0;
        self.opened_at = Some(Instant::now());
        self.last_message_at = None;
        self.keepalive.reset();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = shutdown_tx;

        let writer = WsWriterActor::spawn(WsWriterActor::new(writer, shutdown_rx.clone()));
        self.actor_ref.link(&writer).await;
        self.writer_ref = Some(writer);

        self.spawn_reader(reader, shutdown_rx.clone());
        self.replay_subscriptions().await?;
        self.start_keepalive(shutdown_rx.clone());
        self.start_sweep(shutdown_rx);
        self.flush_queued().await?;
        self.publish();
        Ok(())
    }

    fn spawn_reader(&mut self, reader: T::Reader, mut shutdown_rx: watch::Receiver<bool>) {
        let actor_ref = self.actor_ref.clone();
        let epoch = self.epoch;
        let connection = self.url.clone();
        let mut read = reader;

        self.reader_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow_and_update() { break; }
                    }
                    next = read.next() => {
                        let cause = match next {
                            Some(Ok(WsFrame::Close(frame))) => {
                                debug!(connection = %connection, close = ?frame, "received close frame");
                                DisconnectCause::RemoteClosed
                            }
                            Some(Ok(frame)) => {
                                if actor_ref
                                    .tell(ConnectionEvent::Frame { epoch, frame })
                                    .send()
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                                continue;
                            }
                            Some(Err(err)) => DisconnectCause::ReadFailure { error: err.to_string() },
                            None => DisconnectCause::RemoteClosed,
                        };
                        let _ = actor_ref
                            .tell(ConnectionEvent::Closed { epoch, cause })
                            .send()
                            .await;
                        break;
                    }
                }
            }
        }));
    }

    fn start_keepalive(&mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.keepalive.interval();
        if interval.is_zero() {
            return;
        }
        let actor_ref = self.actor_ref.clone();
        let epoch = self.epoch;

        self.keepalive_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow_and_update() { break; }
                    }
                    _ = ticker.tick() => {
                        if actor_ref
                            .tell(ConnectionEvent::KeepaliveTick { epoch })
                            .send()
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        }));
    }

    fn start_sweep(&mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let period = self.topic_ack_timeout.min(SWEEP_INTERVAL).max(Duration::from_millis(1));
        let actor_ref = self.actor_ref.clone();
        let epoch = self.epoch;

        self.sweep_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow_and_update() { break; }
                    }
                    _ = ticker.tick() => {
                        if actor_ref
                            .tell(ConnectionEvent::Sweep { epoch })
                            .send()
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        }));
    }

    fn track_topic_request(&mut self, id: u64, topic: String) {
        self.topic_requests.insert(
            id,
            TopicRequest {
                topic,
                sent_at: Instant::now(),
            },
        );
    }

    /// Drop socket calls whose caller gave up (timeout or cancel) and topic requests the node
    /// never acknowledged.
    fn sweep_abandoned(&mut self) {
        let before = self.in_flight.len();
        self.in_flight.retain(|_, call| !call.reply.is_closed());
        let dropped_calls = before - self.in_flight.len();

        let timeout = self.topic_ack_timeout;
        let before = self.topic_requests.len();
        self.topic_requests
            .retain(|_, request| request.sent_at.elapsed() < timeout);
        let dropped_topics = before - self.topic_requests.len();

        if dropped_calls > 0 || dropped_topics > 0 {
            debug!(
                connection = %self.url,
                dropped_calls,
                dropped_topics,
                "swept abandoned socket requests"
            );
        }
    }

    async fn replay_subscriptions(&mut self) -> FeedResult<()> {
        if self.subscriptions.is_empty() {
            return Ok(());
        }
        let topics = self.subscriptions.snapshot();
        let mut frames = Vec::with_capacity(topics.len());
        for topic in topics {
            let id = self.next_id();
            frames.push(into_ws_frame(encode_subscribe(id, &topic)?));
            self.track_topic_request(id, topic);
        }
        debug!(connection = %self.url, count = frames.len(), "replaying subscriptions");
        self.write_batch(frames).await
    }

    async fn flush_queued(&mut self) -> FeedResult<()> {
        while let Some(call) = self.queued.pop_front() {
            self.send_call(call.method, call.params, call.reply).await?;
        }
        Ok(())
    }

    async fn send_call(
        &mut self,
        method: String,
        params: Value,
        reply: oneshot::Sender<SocketCallResult>,
    ) -> FeedResult<()> {
        if reply.is_closed() {
            return Ok(());
        }
        let id = self.next_id();
        let payload = match encode_request(id, &method, &params) {
            Ok(payload) => payload,
            Err(err) => {
                let _ = reply.send(Err(AttemptError::Malformed(err.to_string())));
                return Ok(());
            }
        };
        debug!(connection = %self.url, id, method = %method, "socket call");
        self.in_flight.insert(id, InFlightCall { method, reply });
        self.write(into_ws_frame(payload)).await
    }

    async fn write(&mut self, frame: WsFrame) -> FeedResult<()> {
        let Some(writer) = self.writer_ref.as_ref() else {
            return Err(FeedError::InvalidState("no writer".to_string()));
        };
        writer
            .tell(WriterWrite { frame })
            .send()
            .await
            .map_err(|err| FeedError::Actor(err.to_string()))?;
        self.metrics.record_sent();
        Ok(())
    }

    async fn write_batch(&mut self, frames: Vec<WsFrame>) -> FeedResult<()> {
        let Some(writer) = self.writer_ref.as_ref() else {
            return Err(FeedError::InvalidState("no writer".to_string()));
        };
        let count = frames.len();
        writer
            .tell(WriterWriteBatch { frames })
            .send()
            .await
            .map_err(|err| FeedError::Actor(err.to_string()))?;
        for _ in 0..count {
            self.metrics.record_sent();
        }
        Ok(())
    }

    async fn on_keepalive_tick(&mut self) {
        match self.keepalive.on_tick(Instant::now(), now_millis()) {
            Ok(KeepaliveTick::SendPing { timestamp, payload }) => {
                debug!(connection = %self.url, timestamp, "sending keepalive ping");
                if let Err(err) = self.write(into_ws_frame(payload)).await {
                    self.handle_socket_lost(DisconnectCause::WriteFailure {
                        error: err.to_string(),
                    })
                    .await;
                }
            }
            Ok(KeepaliveTick::Dead { missed }) => {
                warn!(connection = %self.url, missed, "keepalive pongs missed; closing socket");
                self.handle_socket_lost(DisconnectCause::PongTimeout { missed })
                    .await;
            }
            Err(err) => {
                warn!(connection = %self.url, error = %err, "keepalive ping not encoded");
            }
        }
    }

    async fn on_frame(&mut self, frame: WsFrame) {
        self.last_message_at = Some(Instant::now());
        self.metrics.record_received();

        if let Some(reply) = Keepalive::protocol_reply(&frame) {
            if let Err(err) = self.write(reply).await {
                self.handle_socket_lost(DisconnectCause::WriteFailure {
                    error: err.to_string(),
                })
                .await;
            }
            return;
        }

        if let Some(payload) = frame.data() {
            self.on_payload(payload);
        }
    }

    fn on_payload(&mut self, payload: &[u8]) {
        match decode_inbound(payload) {
            Err(err) => {
                self.metrics.record_protocol_error();
                self.metrics.record_error("decode", &err.to_string());
                warn!(connection = %self.url, error = %err, "dropping malformed message");
            }
            Ok(Inbound::Pong { timestamp }) => {
                match self.keepalive.on_pong(timestamp, Instant::now()) {
                    Some(rtt) => {
                        debug!(connection = %self.url, rtt_us = rtt.as_micros() as u64, "pong");
                        self.metrics.record_rtt(rtt);
                    }
                    None => debug!(connection = %self.url, timestamp, "unmatched pong"),
                }
            }
            Ok(Inbound::Response(response)) => self.on_response(response),
            Ok(Inbound::Push(push)) => {
                self.router.dispatch(&push);
            }
            Ok(Inbound::Unknown { tag }) => {
                self.metrics.record_unknown_message();
                debug!(connection = %self.url, tag = %tag, "dropping message with unknown type");
            }
        }
    }

    fn on_response(&mut self, response: RpcResponse) {
        if let Some(call) = self.in_flight.remove(&response.id) {
            let outcome = response.outcome.map_err(|err| AttemptError::Remote {
                code: err.code,
                message: err.message,
            });
            if call.reply.send(outcome).is_err() {
                debug!(connection = %self.url, method = %call.method, "socket call caller went away");
            }
            return;
        }

        if let Some(TopicRequest { topic, .. }) = self.topic_requests.remove(&response.id) {
            match response.outcome {
                Ok(_) => debug!(connection = %self.url, topic = %topic, "topic request acknowledged"),
                Err(err) => {
                    warn!(
                        connection = %self.url,
                        topic = %topic,
                        code = err.code,
                        message = %err.message,
                        "topic request rejected"
                    );
                    self.metrics.record_error("subscribe", &err.message);
                }
            }
            return;
        }

        debug!(connection = %self.url, id = response.id, "dropping unmatched response");
    }

    async fn handle_socket_lost(&mut self, cause: DisconnectCause) {
        if !matches!(
            self.state,
            ConnectionState::Open | ConnectionState::Connecting
        ) {
            return;
        }
        self.last_disconnect = Some(cause.clone());
        self.teardown_io().await;
        self.fail_in_flight(AttemptError::Connection(cause.to_string()));
        self.keepalive.reset();
        self.opened_at = None;
        self.schedule_reconnect(&cause);
    }

    fn schedule_reconnect(&mut self, cause: &DisconnectCause) {
        match self.reconnect.plan(self.attempt) {
            ReconnectPlan::Retry { attempt, delay } => {
                self.attempt = attempt;
                self.transition(ConnectionState::Reconnecting);
                self.publish();
                self.metrics.record_reconnect();
                self.log_reconnect_plan("scheduled", cause, Some(delay));

                let epoch = self.epoch;
                let actor_ref = self.actor_ref.clone();
                self.retry_task = Some(tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let _ = actor_ref
                        .tell(ConnectionEvent::RetryConnect { epoch })
                        .send()
                        .await;
                }));
            }
            ReconnectPlan::GiveUp { .. } => {
                self.transition(ConnectionState::Failed);
                self.publish();
                self.log_reconnect_plan("give_up", cause, None);
                self.fail_queued(AttemptError::NotConnected);
            }
        }
    }

    fn log_reconnect_plan(&self, note: &str, cause: &DisconnectCause, delay: Option<Duration>) {
        warn!(
            connection = %self.url,
            note,
            cause = %cause,
            attempt = self.attempt,
            max_attempts = self.reconnect.max_attempts,
            delay_ms = delay.map(|d| d.as_millis() as u64),
            "reconnect plan"
        );
    }

    async fn teardown_io(&mut self) {
        let _ = self.shutdown_tx.send(true);
        Self::abort_task(&mut self.reader_task);
        Self::abort_task(&mut self.keepalive_task);
        Self::abort_task(&mut self.sweep_task);
        if let Some(writer) = self.writer_ref.take() {
            writer.unlink(&self.actor_ref).await;
            let _ = writer.stop_gracefully().await;
            writer.wait_for_shutdown().await;
        }
        self.topic_requests.clear();
    }

    fn fail_in_flight(&mut self, err: AttemptError) {
        for (_, call) in self.in_flight.drain() {
            let _ = call.reply.send(Err(err.clone()));
        }
    }

    fn fail_queued(&mut self, err: AttemptError) {
        for call in self.queued.drain(..) {
            let _ = call.reply.send(Err(err.clone()));
        }
    }
}
