//! Core primitives shared by the server and the client.
//!
//! Nothing here knows about games or sockets: timestamps and clock offset,
//! the error taxonomy, and the per-instance event emitter.

pub mod emitter;
pub mod error;
pub mod time;

// Re-export core types
pub use emitter::{Emitter, ListenerId};
pub use error::{SyncError, WireError, CONNECTION_RESET};
pub use time::{ClockOffset, Timestamp};
