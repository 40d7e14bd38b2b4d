//! Realtime chain-state feed: a kameo-managed websocket with keepalive and reconnection, a
//! deduplicating JSON-RPC client with an HTTP fallback, and a polling controller that covers
//! socket outages.

pub mod config;
pub mod core;
pub mod feed;
pub mod polling;
pub mod router;
pub mod rpc;
pub mod subscriptions;
pub mod testing;
pub mod tls;
pub mod transport;
pub mod ws;

pub use config::{FeedConfig, KeepaliveConfig, PollCall, PollingConfig, ReconnectConfig, RpcDefaults};
pub use core::{ConnectionState, FeedError, FeedMetrics, FeedResult, PushKind, PushMessage};
pub use feed::BlockFeed;
pub use polling::{PollUpdate, PollingController};
pub use router::{HandlerId, MessageRouter};
pub use rpc::{CallOptions, PendingCall, RpcClient, RpcError, RpcResult, TransportChoice};
pub use ws::ConnectionHandle;
