pub mod actor;
pub mod handle;
pub mod writer;

pub use actor::{
    Connect, ConnectionActor, ConnectionArgs, ConnectionSettings, Disconnect, GetConnectionStats,
    SocketCall, SocketCallResult, Subscribe, Unsubscribe,
};
pub use handle::ConnectionHandle;
pub use writer::{WriterClose, WriterWrite, WriterWriteBatch, WsWriterActor};
