//! Game Events
//!
//! The ordered stream every joined session receives and every client mirror
//! applies. Serialized as `{type, data}`.

use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;
use crate::game::action::{Action, TeamId, Unit};
use crate::game::request::PlayerRequest;
use crate::game::state::Team;
use crate::game::turn::{Turn, TurnHeader, TurnId};

/// Why a game ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    /// A team won (rules collaborator decided, or opponents surrendered).
    Victory,
    /// All players agreed to a truce.
    Truce,
    /// Declared a draw by the rules collaborator.
    Draw,
}

/// Actions appended to one turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionBatch {
    /// Turn the actions belong to.
    pub turn_id: TurnId,
    /// Appended actions, in order.
    pub actions: Vec<Action>,
}

/// Game start data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStart {
    /// When the game started.
    pub started_at: Timestamp,
    /// Teams with their players.
    pub teams: Vec<Team>,
    /// Units at the start of turn 0.
    pub units: Vec<Unit>,
}

/// End-of-game data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEnd {
    /// When the game ended.
    pub ended_at: Timestamp,
    /// Winning team, if any.
    pub winner_id: Option<TeamId>,
    /// Why.
    pub reason: EndReason,
}

/// One entry of the event stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum GameEvent {
    /// The game started; turn 0 follows.
    StartGame(GameStart),
    /// A turn started.
    StartTurn(TurnHeader),
    /// Actions were appended to a turn.
    Action(ActionBatch),
    /// A turn was rewound by an undo; replaces it and drops later turns.
    Revert(Turn),
    /// The game ended.
    EndGame(GameEnd),
    /// A player request was created or changed status.
    PlayerRequest(PlayerRequest),
}

impl GameEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            GameEvent::StartGame(_) => "startGame",
            GameEvent::StartTurn(_) => "startTurn",
            GameEvent::Action(_) => "action",
            GameEvent::Revert(_) => "revert",
            GameEvent::EndGame(_) => "endGame",
            GameEvent::PlayerRequest(_) => "playerRequest",
        }
    }
}
