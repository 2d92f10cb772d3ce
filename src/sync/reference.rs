//! Client Position Fingerprint
//!
//! A reference says where a client's mirror is: which turn, when that turn
//! started, its time limit, whether the game ended, and the creation time of
//! every action of the turn. On the wire it is a positional array
//!
//! ```text
//! [turnId, turnStartedAt, turnTimeLimit|null, endedAt|null, ...actionCreatedAt]
//! ```
//!
//! or the string `"creation"` for a game that has not started. The array
//! form only exists at the serde boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::time::Timestamp;
use crate::game::state::TurnLog;
use crate::game::turn::TurnId;

/// Wire sentinel for an unstarted game.
pub const CREATION: &str = "creation";

/// Position within a started game.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<Value>", try_from = "Vec<Value>")]
pub struct Reference {
    /// Current turn.
    pub turn_id: TurnId,
    /// When it started.
    pub turn_started_at: Timestamp,
    /// Its time limit.
    pub turn_time_limit: Option<u32>,
    /// Game end time.
    pub ended_at: Option<Timestamp>,
    /// Creation time of each action of the turn.
    pub actions: Vec<Timestamp>,
}

/// What a client sends to describe its mirror.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Value", try_from = "Value")]
pub enum ClientReference {
    /// Game not started yet.
    Creation,
    /// Somewhere in a started game.
    Position(Reference),
}

/// Malformed reference.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid reference: {0}")]
pub struct ReferenceError(String);

fn timestamp(value: &Value, field: &str) -> Result<Timestamp, ReferenceError> {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ReferenceError(format!("{} is not a timestamp", field)))
}

impl From<Reference> for Vec<Value> {
    fn from(r: Reference) -> Self {
        let mut out = Vec::with_capacity(4 + r.actions.len());
        out.push(Value::from(r.turn_id));
        out.push(Value::from(r.turn_started_at.to_iso()));
        out.push(r.turn_time_limit.map_or(Value::Null, Value::from));
        out.push(r.ended_at.map_or(Value::Null, |t| Value::from(t.to_iso())));
        out.extend(r.actions.into_iter().map(|t| Value::from(t.to_iso())));
        out
    }
}

impl TryFrom<Vec<Value>> for Reference {
    type Error = ReferenceError;

    fn try_from(values: Vec<Value>) -> Result<Self, Self::Error> {
        if values.len() < 4 {
            return Err(ReferenceError(format!("expected at least 4 entries, got {}", values.len())));
        }
        let turn_id = values[0]
            .as_u64()
            .and_then(|id| TurnId::try_from(id).ok())
            .ok_or_else(|| ReferenceError("turnId is not a turn number".into()))?;
        let turn_started_at = timestamp(&values[1], "turnStartedAt")?;
        let turn_time_limit = match &values[2] {
            Value::Null => None,
            v => Some(
                v.as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| ReferenceError("turnTimeLimit is not a number".into()))?,
            ),
        };
        let ended_at = match &values[3] {
            Value::Null => None,
            v => Some(timestamp(v, "endedAt")?),
        };
        let actions = values[4..]
            .iter()
            .map(|v| timestamp(v, "action createdAt"))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            turn_id,
            turn_started_at,
            turn_time_limit,
            ended_at,
            actions,
        })
    }
}

impl From<ClientReference> for Value {
    fn from(r: ClientReference) -> Self {
        match r {
            ClientReference::Creation => Value::from(CREATION),
            ClientReference::Position(reference) => Value::Array(reference.into()),
        }
    }
}

impl TryFrom<Value> for ClientReference {
    type Error = ReferenceError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) if s == CREATION => Ok(ClientReference::Creation),
            Value::Array(values) => Ok(ClientReference::Position(values.try_into()?)),
            other => Err(ReferenceError(format!("unexpected {}", other))),
        }
    }
}

/// The reference a fully caught-up client would hold.
pub fn compute_reference<L: TurnLog>(log: &L) -> ClientReference {
    match log.current_turn() {
        None => ClientReference::Creation,
        Some(turn) => ClientReference::Position(Reference {
            turn_id: turn.id,
            turn_started_at: turn.started_at,
            turn_time_limit: turn.time_limit,
            ended_at: log.ended_at(),
            actions: turn.action_timestamps(),
        }),
    }
}
