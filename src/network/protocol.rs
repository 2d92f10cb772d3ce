//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket. Every frame
//! is one JSON text envelope:
//!
//! ```text
//! {id?, type, body?, ack?, now?}
//! ```
//!
//! `id` is only present on messages that need delivery confirmation
//! (see [`MessageType::is_sequenced`]); `ack` is the highest id the sender
//! has applied from its peer; `now` is the server wall clock.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{SyncError, WireError};
use crate::core::time::Timestamp;
use crate::game::action::{ActionInput, TeamId, Unit};
use crate::game::events::GameEvent;
use crate::game::request::{RequestKind, RequestOutcome};
use crate::game::state::{GameSettings, PlayerId, Team};
use crate::game::turn::TurnId;
use crate::game::{ActionPosition, GameId};
use crate::sync::ClientReference;

/// Protocol version sent in `open` and `session`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Per-direction message counter.
pub type MessageId = u64;

// =============================================================================
// CLOSE CODES
// =============================================================================

/// Server closed an idle connection; reconnect.
pub const CLOSE_IDLE_TIMEOUT: u16 = 4000;
/// Codes at or above this never trigger a reconnect.
pub const CLOSE_TERMINAL_THRESHOLD: u16 = 4100;
/// Server is shutting down.
pub const CLOSE_SHUTDOWN: u16 = 4100;
/// Session evicted for inactivity.
pub const CLOSE_INACTIVE: u16 = 4101;
/// Client sent something unparseable or out of protocol.
pub const CLOSE_MALFORMED: u16 = 4102;

/// Whether a close code forbids reconnecting.
pub fn is_terminal_close(code: u16) -> bool {
    code >= CLOSE_TERMINAL_THRESHOLD
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Which end of the connection sent a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// The player's process.
    Client,
    /// The game server.
    Server,
}

/// Envelope `type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    /// Start a new session.
    Open,
    /// Continue an existing session.
    Resume,
    /// Handshake reply.
    Session,
    /// Heartbeat, ack carrier and resend trigger.
    Sync,
    /// Identify the player.
    Authorize,
    /// Subscribe to a game.
    Join,
    /// Game event.
    Event,
    /// Game request.
    Request,
    /// Reply to an `authorize`, `join` or `request`.
    Response,
    /// Failure not tied to a response route.
    Error,
    /// Submitted actions.
    Action,
}

impl MessageType {
    /// Whether messages of this type sent by `from` carry an id.
    pub fn is_sequenced(self, from: Side) -> bool {
        match from {
            Side::Client => matches!(
                self,
                MessageType::Action | MessageType::Request | MessageType::Join | MessageType::Authorize
            ),
            Side::Server => matches!(self, MessageType::Event | MessageType::Response),
        }
    }

    /// Whether the server answers with a `response`.
    pub fn expects_response(self) -> bool {
        matches!(self, MessageType::Request | MessageType::Join | MessageType::Authorize)
    }
}

/// One frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sequence number, for sequenced types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Highest peer id the sender has applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<MessageId>,
    /// Server wall clock (epoch ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub now: Option<i64>,
}

impl Envelope {
    /// Bodyless envelope.
    pub fn new(kind: MessageType) -> Self {
        Self {
            id: None,
            kind,
            body: None,
            ack: None,
            now: None,
        }
    }

    /// Envelope with a serialized body.
    pub fn with_body<T: Serialize>(kind: MessageType, body: &T) -> Result<Self, SyncError> {
        let mut env = Self::new(kind);
        env.body = Some(serde_json::to_value(body)?);
        Ok(env)
    }

    /// Decode the body.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, SyncError> {
        let body = self.body.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(body)?)
    }

    /// Server time carried by the envelope.
    pub fn server_time(&self) -> Option<Timestamp> {
        self.now.map(Timestamp::from_millis)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// =============================================================================
// HANDSHAKE BODIES
// =============================================================================

/// `open` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenBody {
    /// Client protocol version.
    pub version: u32,
}

/// `resume` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeBody {
    /// Session to continue.
    pub session_id: String,
}

/// `session` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBody {
    /// Session the connection is bound to (may differ from the one resumed).
    pub session_id: String,
    /// Server protocol version.
    pub version: u32,
}

// =============================================================================
// CLIENT -> SERVER BODIES
// =============================================================================

/// `authorize` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeBody {
    /// Identity token.
    pub token: String,
}

/// `authorize` response data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorized {
    /// Player the session now acts as.
    pub player_id: PlayerId,
}

/// `join` body. The response data is a `SyncPatch`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinBody {
    /// Game to subscribe to.
    pub game_id: GameId,
    /// Where the client's mirror is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ClientReference>,
}

/// `action` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionBody {
    /// Target game.
    pub game_id: GameId,
    /// Actions to append.
    pub actions: Vec<ActionInput>,
    /// Turn the client built them for.
    pub turn_id: TurnId,
    /// Actions that turn had at the time.
    pub action_count: usize,
}

impl ActionBody {
    /// Where the client believed the log was.
    pub fn position(&self) -> ActionPosition {
        ActionPosition {
            turn_id: self.turn_id,
            action_count: self.action_count,
        }
    }
}

/// `request` body: `{method, params}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum GameRequest {
    /// Create a game from its seats and options.
    CreateGame(CreateGameParams),
    /// Take a seat in an unstarted game.
    JoinTeam(JoinTeamParams),
    /// Start a seated game with its opening units.
    StartGame(StartGameParams),
    /// Propose an undo or a truce.
    PlayerRequest(PlayerRequestParams),
    /// Accept the pending request.
    AcceptPlayerRequest(RequestRef),
    /// Reject the pending request.
    RejectPlayerRequest(RequestRef),
    /// Withdraw the pending request.
    CancelPlayerRequest(GameRef),
}

impl GameRequest {
    /// Method name, for logs.
    pub fn method(&self) -> &'static str {
        match self {
            GameRequest::CreateGame(_) => "createGame",
            GameRequest::JoinTeam(_) => "joinTeam",
            GameRequest::StartGame(_) => "startGame",
            GameRequest::PlayerRequest(_) => "playerRequest",
            GameRequest::AcceptPlayerRequest(_) => "acceptPlayerRequest",
            GameRequest::RejectPlayerRequest(_) => "rejectPlayerRequest",
            GameRequest::CancelPlayerRequest(_) => "cancelPlayerRequest",
        }
    }

    /// Target game, if the method has one.
    pub fn game_id(&self) -> Option<&str> {
        match self {
            GameRequest::CreateGame(_) => None,
            GameRequest::JoinTeam(p) => Some(&p.game_id),
            GameRequest::StartGame(p) => Some(&p.game_id),
            GameRequest::PlayerRequest(p) => Some(&p.game_id),
            GameRequest::AcceptPlayerRequest(p) | GameRequest::RejectPlayerRequest(p) => Some(&p.game_id),
            GameRequest::CancelPlayerRequest(p) => Some(&p.game_id),
        }
    }
}

/// `createGame` params.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGameParams {
    /// Seats, in turn order.
    pub teams: Vec<Team>,
    /// Options.
    #[serde(default)]
    pub settings: GameSettings,
}

/// `createGame` response data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedGame {
    /// New game id.
    pub game_id: GameId,
}

/// `joinTeam` params.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinTeamParams {
    /// Target game.
    pub game_id: GameId,
    /// Seat to take.
    pub team_id: TeamId,
}

/// `startGame` params.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartGameParams {
    /// Target game.
    pub game_id: GameId,
    /// Opening units.
    pub units: Vec<Unit>,
}

/// `playerRequest` params.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRequestParams {
    /// Target game.
    pub game_id: GameId,
    /// Undo or truce.
    #[serde(rename = "type")]
    pub kind: RequestKind,
}

/// `playerRequest` response data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRequestReply {
    /// Applied at once, or waiting for the other players.
    pub outcome: RequestOutcome,
}

/// Params naming the pending request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRef {
    /// Target game.
    pub game_id: GameId,
    /// `createdAt` of the pending request.
    pub created_at: Timestamp,
}

/// Params naming only a game.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRef {
    /// Target game.
    pub game_id: GameId,
}

// =============================================================================
// SERVER -> CLIENT BODIES
// =============================================================================

/// `event` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBody {
    /// Game the event belongs to.
    pub game_id: GameId,
    /// The event.
    pub event: GameEvent,
}

/// `response` body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    /// Id of the message being answered.
    pub request_id: MessageId,
    /// Result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ResponseBody {
    /// Build from a handler result.
    pub fn from_result(request_id: MessageId, result: Result<Value, SyncError>) -> Self {
        match result {
            Ok(data) => Self {
                request_id,
                data: Some(data),
                error: None,
            },
            Err(e) => Self {
                request_id,
                data: None,
                error: Some(e.to_wire()),
            },
        }
    }

    /// Back into a result.
    pub fn into_result(self) -> Result<Value, SyncError> {
        match self.error {
            Some(error) => Err(error.into()),
            None => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}

/// What an `error` message is about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSource {
    /// Type of the offending message.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Its id, if it had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    /// Game concerned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<GameId>,
}

/// `error` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// What failed.
    pub source: ErrorSource,
    /// Why.
    pub error: WireError,
}

// =============================================================================
// TESTS
// =============================================================================
