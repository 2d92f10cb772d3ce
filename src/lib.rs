//! # Tactics Sync
//!
//! Keeps the server and its intermittently connected clients in step for
//! turn-based matches: a resumable ordered transport, a reconciliation
//! engine that patches a stale client from a positional reference, and the
//! undo/truce negotiation between players.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TACTICS SYNC                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Shared primitives                         │
//! │  ├── time.rs     - Millisecond timestamps, clock offset      │
//! │  ├── error.rs    - Error taxonomy and wire form              │
//! │  └── emitter.rs  - Per-instance publish/subscribe            │
//! │                                                              │
//! │  game/           - One game                                  │
//! │  ├── action.rs   - Actions, units, results                   │
//! │  ├── turn.rs     - Turns and unit replay                     │
//! │  ├── state.rs    - TurnLog seam, in-memory GameState         │
//! │  ├── undo.rs     - Undo rules (server and client)            │
//! │  ├── request.rs  - Undo/truce request machine                │
//! │  ├── events.rs   - Event stream                              │
//! │  └── store.rs    - Persistence seam                          │
//! │                                                              │
//! │  sync/           - Reconciliation                            │
//! │  ├── reference.rs- Positional client reference               │
//! │  └── patch.rs    - Patch engine                              │
//! │                                                              │
//! │  network/        - Server side                               │
//! │  ├── protocol.rs - Envelope and bodies                       │
//! │  ├── session.rs  - Message sessions, session registry        │
//! │  ├── auth.rs     - JWT authorization                         │
//! │  ├── games.rs    - Per-game actors                           │
//! │  └── server.rs   - WebSocket server                          │
//! │                                                              │
//! │  client/         - Client side                               │
//! │  ├── transport.rs- Resumable session transport               │
//! │  ├── connection.rs- Transports by endpoint                   │
//! │  ├── mirror.rs   - Local game mirror                         │
//! │  └── game.rs     - Mirror bound to a transport               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Guarantees
//!
//! Within one session every sequenced message is applied exactly once and
//! in order on both sides:
//! - Unacknowledged messages stay in the sender's outbox across sockets
//! - Duplicates are dropped by id, gaps trigger a `sync`
//! - A session the server no longer knows is reset; the client rejoins
//!   from its mirror's reference and the engine sends only what changed

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod client;
pub mod core;
pub mod game;
pub mod network;
pub mod sync;

// Re-export commonly used types
pub use client::{ClientMirror, ConnectionManager, GameClient, SessionTransport, TransportConfig};
pub use core::{SyncError, Timestamp};
pub use game::{Game, GameEvent, GameState, GameStore, MemoryGameStore, PlayerId, Turn, TurnLog};
pub use network::{GameServer, ServerConfig, PROTOCOL_VERSION};
pub use sync::{compute_patch, compute_reference, ClientReference, SyncPatch};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
