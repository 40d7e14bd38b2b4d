use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Convenience result alias for connection-level operations.
pub type FeedResult<T> = Result<T, FeedError>;

/// Error surface of the connection manager and the wire codec.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Already connecting or connected")]
    AlreadyConnecting,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Transport error ({context}): {error}")]
    Transport {
        context: &'static str,
        error: String,
    },

    #[error("Backpressure: outbound queue full")]
    OutboundQueueFull,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Actor error: {0}")]
    Actor(String),
}

/// Lifecycle state of the single managed socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the socket went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    PongTimeout { missed: u32 },
    RemoteClosed,
    ReadFailure { error: String },
    WriteFailure { error: String },
    WriterStopped { reason: String },
    HandshakeFailed { message: String },
    CallerRequested,
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::PongTimeout { missed } => write!(f, "{missed} pongs missed"),
            DisconnectCause::RemoteClosed => f.write_str("remote closed"),
            DisconnectCause::ReadFailure { error } => write!(f, "read failure: {error}"),
            DisconnectCause::WriteFailure { error } => write!(f, "write failure: {error}"),
            DisconnectCause::WriterStopped { reason } => write!(f, "writer stopped: {reason}"),
            DisconnectCause::HandshakeFailed { message } => {
                write!(f, "handshake failed: {message}")
            }
            DisconnectCause::CallerRequested => f.write_str("caller requested"),
        }
    }
}

/// Point-in-time view of the connection actor.
#[derive(Clone, Debug)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub attempt: u32,
    pub subscriptions: usize,
    pub in_flight_socket_calls: usize,
    pub queued_socket_calls: usize,
    /// Subscribe/unsubscribe requests awaiting an acknowledgement.
    pub pending_topic_acks: usize,
    pub outstanding_pings: usize,
    pub missed_pongs: u32,
    /// Time since the current socket opened, if one is open.
    pub open_for: Option<Duration>,
    pub last_message_age: Option<Duration>,
    pub last_disconnect: Option<DisconnectCause>,
}

/// Transport-independent buffer sizing parameters used for websocket configuration.
#[derive(Clone, Copy, Debug)]
pub struct WebSocketBufferConfig {
    pub read_buffer_bytes: usize,
    pub write_buffer_bytes: usize,
    pub max_write_buffer_bytes: usize,
    pub max_message_bytes: usize,
    pub max_frame_bytes: usize,
}

impl Default for WebSocketBufferConfig {
    fn default() -> Self {
        Self {
            read_buffer_bytes: 128 << 10,
            write_buffer_bytes: 64 << 10,
            max_write_buffer_bytes: 256 << 10,
            max_message_bytes: 16 << 20,
            max_frame_bytes: 16 << 20,
        }
    }
}
