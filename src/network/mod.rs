//! Network Layer
//!
//! Server side of the session transport: the wire protocol, resumable
//! message sessions, JWT authorization, per-game actors and the WebSocket
//! accept loop. Game rules stay in `game/`; this layer only routes.

pub mod auth;
pub mod games;
pub mod protocol;
pub mod server;
pub mod session;

pub use auth::{player_id_for, AuthConfig, AuthError, Identity, TokenClaims, TokenVerifier};
pub use games::{EventFeed, GameHandle, GameRegistry};
pub use protocol::{
    is_terminal_close, ActionBody, Envelope, ErrorBody, EventBody, GameRequest, JoinBody, MessageId,
    MessageType, ResponseBody, Side, PROTOCOL_VERSION,
};
pub use server::{GameServer, GameServerError, ServerConfig};
pub use session::{Inbound, MessageSession, SessionId, SessionManager};
