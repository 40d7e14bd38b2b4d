use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::core::{FeedError, WebSocketBufferConfig, WsFrame};

pub mod tungstenite;

pub type WsConnectFuture<R, W> = Pin<Box<dyn Future<Output = Result<(R, W), FeedError>> + Send>>;

/// Transport boundary for socket IO.
///
/// The connection actor owns state and policy; the reader half is drained by a task outside the
/// actor and the writer half is owned by the writer actor. Tests swap in
/// [`MockTransport`](crate::testing::MockTransport).
pub trait WsTransport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = Result<WsFrame, FeedError>> + Send + Unpin + 'static;
    type Writer: Sink<WsFrame, Error = FeedError> + Send + Sync + Unpin + 'static;

    fn connect(
        &self,
        url: String,
        buffers: WebSocketBufferConfig,
    ) -> WsConnectFuture<Self::Reader, Self::Writer>;
}
