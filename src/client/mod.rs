//! Client Layer
//!
//! The client half of the session protocol: a resumable transport per
//! endpoint, a manager that owns those transports, and a game client that
//! keeps a local mirror of one game in step with the server.
//!
//! ## Module Structure
//!
//! - `transport`: Socket lifecycle, handshake, heartbeat, response routing
//! - `connection`: Transports by endpoint, authorization
//! - `mirror`: Local copy of one game
//! - `game`: Mirror bound to a transport, with recovery

pub mod connection;
pub mod game;
pub mod mirror;
pub mod transport;

pub use connection::ConnectionManager;
pub use game::{GameClient, GameUpdate};
pub use mirror::{ClientMirror, NeedsResync};
pub use transport::{
    ConnectionState, RequestFlags, RequestHandle, RequestState, SessionTransport, TransportConfig, TransportError,
    TransportEvent, WeakTransport,
};
