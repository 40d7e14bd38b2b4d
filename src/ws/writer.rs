use futures_util::{Sink, SinkExt};
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage};
use tokio::sync::watch;
use tracing::debug;

use crate::core::{FeedError, FeedResult, WsFrame};

/// Writer actor that owns the transport sink and serializes writes.
///
/// Writes arrive with `tell`; a failed write returns `Err`, which stops the actor. The connection
/// actor is linked to it and treats that stop as a socket failure.
pub struct WsWriterActor<W>
where
    W: Sink<WsFrame, Error = FeedError> + Send + Sync + Unpin + 'static,
{
    writer: W,
    shutdown_rx: watch::Receiver<bool>,
}

impl<W> WsWriterActor<W>
where
    W: Sink<WsFrame, Error = FeedError> + Send + Sync + Unpin + 'static,
{
    pub fn new(writer: W, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            writer,
            shutdown_rx,
        }
    }
}

impl<W> Actor for WsWriterActor<W>
where
    W: Sink<WsFrame, Error = FeedError> + Send + Sync + Unpin + 'static,
{
    type Args = Self;
    type Error = FeedError;

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }

    fn on_panic(
        &mut self,
        _actor_ref: kameo::actor::WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            tracing::error!(error = ?err, "WsWriterActor stopped on failed write");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

#[derive(Clone)]
pub struct WriterWrite {
    pub frame: WsFrame,
}

impl<W> KameoMessage<WriterWrite> for WsWriterActor<W>
where
    W: Sink<WsFrame, Error = FeedError> + Send + Sync + Unpin + 'static,
{
    type Reply = FeedResult<()>;

    async fn handle(
        &mut self,
        msg: WriterWrite,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if *self.shutdown_rx.borrow() {
            return Ok(());
        }
        debug!(target: "feed-writer", "sending frame to wire");
        self.writer.send(msg.frame).await
    }
}

#[derive(Clone)]
pub struct WriterWriteBatch {
    pub frames: Vec<WsFrame>,
}

impl<W> KameoMessage<WriterWriteBatch> for WsWriterActor<W>
where
    W: Sink<WsFrame, Error = FeedError> + Send + Sync + Unpin + 'static,
{
    type Reply = FeedResult<()>;

    async fn handle(
        &mut self,
        msg: WriterWriteBatch,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if *self.shutdown_rx.borrow() {
            return Ok(());
        }
        for frame in msg.frames {
            self.writer.feed(frame).await?;
        }
        self.writer.flush().await
    }
}

/// Send a close frame and close the sink; used on caller-initiated disconnect.
pub struct WriterClose;

impl<W> KameoMessage<WriterClose> for WsWriterActor<W>
where
    W: Sink<WsFrame, Error = FeedError> + Send + Sync + Unpin + 'static,
{
    type Reply = FeedResult<()>;

    async fn handle(
        &mut self,
        _msg: WriterClose,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let _ = self
            .writer
            .send(WsFrame::close(1000, bytes::Bytes::from_static(b"client closing")))
            .await;
        self.writer.close().await
    }
}
