use std::sync::Arc;

use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef};
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use super::actor::{
    Connect, ConnectionActor, ConnectionArgs, ConnectionSettings, Disconnect, GetConnectionStats,
    SocketCall, SocketCallResult, Subscribe, Unsubscribe,
};
use crate::core::{ConnectionState, ConnectionStats, FeedError, FeedMetrics, FeedResult};
use crate::router::MessageRouter;
use crate::rpc::AttemptError;
use crate::transport::WsTransport;

fn map_send_error<M>(err: SendError<M, FeedError>) -> FeedError {
    match err {
        SendError::HandlerError(err) => err,
        other => FeedError::Actor(other.to_string()),
    }
}

/// Cloneable front door to the connection actor.
///
/// Status is mirrored into a `watch` channel, so [`status`](Self::status) never waits on the
/// actor mailbox.
pub struct ConnectionHandle<T: WsTransport> {
    actor: ActorRef<ConnectionActor<T>>,
    status: watch::Receiver<ConnectionState>,
}

impl<T: WsTransport> Clone for ConnectionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
            status: self.status.clone(),
        }
    }
}

impl<T: WsTransport> ConnectionHandle<T> {
    pub fn spawn(
        settings: ConnectionSettings<T>,
        router: Arc<MessageRouter>,
        metrics: Arc<FeedMetrics>,
    ) -> Self {
        let (status_tx, status) = watch::channel(ConnectionState::Idle);
        let actor = ConnectionActor::spawn(ConnectionArgs {
            settings,
            router,
            metrics,
            status_tx,
        });
        Self { actor, status }
    }

    pub fn actor_ref(&self) -> &ActorRef<ConnectionActor<T>> {
        &self.actor
    }

    pub async fn connect(&self) -> FeedResult<()> {
        self.actor.ask(Connect).await.map_err(map_send_error)
    }

    pub async fn disconnect(&self) -> FeedResult<()> {
        self.actor.ask(Disconnect).await.map_err(map_send_error)
    }

    /// Returns `true` when the topic was newly added.
    pub async fn subscribe(&self, topic: impl Into<String>) -> FeedResult<bool> {
        self.actor
            .ask(Subscribe {
                topic: topic.into(),
            })
            .await
            .map_err(map_send_error)
    }

    /// Returns `true` when the topic was present.
    pub async fn unsubscribe(&self, topic: impl Into<String>) -> FeedResult<bool> {
        self.actor
            .ask(Unsubscribe {
                topic: topic.into(),
            })
            .await
            .map_err(map_send_error)
    }

    pub fn status(&self) -> ConnectionState {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    pub async fn stats(&self) -> FeedResult<ConnectionStats> {
        self.actor
            .ask(GetConnectionStats)
            .await
            .map_err(map_send_error)
    }

    /// Issue one JSON-RPC request over the socket and wait for its correlated response.
    ///
    /// With `wait_for_open` the call is buffered while the socket is connecting or
    /// reconnecting; otherwise a socket that is not open refuses with
    /// [`AttemptError::NotConnected`].
    pub async fn call(&self, method: &str, params: &Value, wait_for_open: bool) -> SocketCallResult {
        let (reply, rx) = oneshot::channel();
        let message = SocketCall {
            method: method.to_string(),
            params: params.clone(),
            wait_for_open,
            reply,
        };
        if self.actor.tell(message).send().await.is_err() {
            return Err(AttemptError::NotConnected);
        }
        rx.await.unwrap_or_else(|_| {
            Err(AttemptError::Connection(
                "socket call dropped".to_string(),
            ))
        })
    }

    /// Stop the actor and wait until the socket is torn down.
    pub async fn shutdown(&self) {
        let _ = self.actor.stop_gracefully().await;
        self.actor.wait_for_shutdown().await;
    }
}
