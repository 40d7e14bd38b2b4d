pub mod backoff;
pub mod circular_buffer;
pub mod envelope;
pub mod frame;
pub mod keepalive;
pub mod metrics;
pub mod types;

pub use backoff::*;
pub use circular_buffer::*;
pub use envelope::*;
pub use frame::*;
pub use keepalive::*;
pub use metrics::*;
pub use types::*;
