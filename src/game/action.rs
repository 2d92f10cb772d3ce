//! Actions and Units
//!
//! An action is what a team did during its turn. The rules collaborator has
//! already resolved it by the time it reaches the turn log: `results` holds
//! the unit deltas, so replaying a turn never needs the rules again.

use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;

/// Team index within a game (0-based, also the turn rotation order).
pub type TeamId = u32;

/// Unit identifier, unique within a game.
pub type UnitId = u32;

/// Tile coordinates `[x, y]`.
pub type Tile = [i32; 2];

/// Facing direction of a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Toward negative y.
    N,
    /// Toward positive x.
    E,
    /// Toward positive y.
    S,
    /// Toward negative x.
    W,
}

/// A unit on the board.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    /// Unit identifier.
    pub id: UnitId,
    /// Owning team.
    pub team_id: TeamId,
    /// Unit type name (opaque to this crate).
    pub kind: String,
    /// Position.
    pub position: Tile,
    /// Facing.
    pub direction: Direction,
    /// Magical-health deficit accumulated so far.
    #[serde(default)]
    pub health_deficit: u32,
    /// Deficit at which the unit is removed.
    pub max_health: u32,
}

impl Unit {
    /// Whether accumulated damage has removed the unit.
    pub fn is_dead(&self) -> bool {
        self.health_deficit >= self.max_health
    }
}

/// Change to one unit caused by an action.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    /// Affected unit.
    pub unit: UnitId,
    /// New position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Tile>,
    /// New facing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    /// New health deficit (absolute, not a delta).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_deficit: Option<u32>,
}

/// What kind of action was taken.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ActionKind {
    /// Select a unit.
    Select,
    /// Move the unit to a tile.
    Move {
        /// Destination.
        target: Tile,
    },
    /// Attack a tile.
    Attack {
        /// Target tile.
        target: Tile,
    },
    /// Use the unit's special attack.
    AttackSpecial,
    /// Change facing.
    Turn {
        /// New facing.
        direction: Direction,
    },
    /// End the turn.
    EndTurn,
    /// Concede the game.
    Surrender,
}

impl ActionKind {
    /// Whether an action of this kind closes its turn.
    pub fn ends_turn(&self) -> bool {
        matches!(self, ActionKind::EndTurn | ActionKind::Surrender)
    }
}

/// A resolved action as stored in a turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// Variant and its payload (flattened `type` tag).
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Acting unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<UnitId>,
    /// Unit deltas.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ActionResult>,
    /// Server time when the action was appended.
    pub created_at: Timestamp,
    /// Auto-skip or forced pass; exempt from undo bookkeeping.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub forced: bool,
}

impl Action {
    /// Build an action with no unit and no results.
    pub fn new(kind: ActionKind, created_at: Timestamp) -> Self {
        Self {
            kind,
            unit: None,
            results: Vec::new(),
            created_at,
            forced: false,
        }
    }

    /// Set the acting unit.
    pub fn with_unit(mut self, unit: UnitId) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Append a result.
    pub fn with_result(mut self, result: ActionResult) -> Self {
        self.results.push(result);
        self
    }

    /// Mark as forced.
    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    /// Whether this action closes the turn it belongs to.
    pub fn ends_turn(&self) -> bool {
        self.kind.ends_turn()
    }
}

/// Action as submitted by a client: no timestamp yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInput {
    /// Variant and payload.
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Acting unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<UnitId>,
    /// Unit deltas computed by the rules collaborator.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ActionResult>,
    /// Forced pass.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub forced: bool,
}

impl ActionInput {
    /// Shorthand for a bare action of the given kind.
    pub fn of(kind: ActionKind) -> Self {
        Self {
            kind,
            unit: None,
            results: Vec::new(),
            forced: false,
        }
    }

    /// Stamp with the server time it was accepted at.
    pub fn stamp(self, created_at: Timestamp) -> Action {
        Action {
            kind: self.kind,
            unit: self.unit,
            results: self.results,
            created_at,
            forced: self.forced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_wire_shape() {
        let action = Action::new(ActionKind::Move { target: [3, 4] }, Timestamp::from_millis(0))
            .with_unit(7)
            .with_result(ActionResult {
                unit: 7,
                position: Some([3, 4]),
                ..Default::default()
            });

        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "move");
        assert_eq!(json["target"], serde_json::json!([3, 4]));
        assert_eq!(json["unit"], 7);
        assert_eq!(json["createdAt"], "1970-01-01T00:00:00.000Z");
        assert!(json.get("forced").is_none());

        let back: Action = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn test_ends_turn() {
        let t = Timestamp::from_millis(0);
        assert!(Action::new(ActionKind::EndTurn, t).ends_turn());
        assert!(Action::new(ActionKind::Surrender, t).ends_turn());
        assert!(!Action::new(ActionKind::AttackSpecial, t).ends_turn());
    }

    #[test]
    fn test_unit_death_threshold() {
        let mut unit = Unit {
            id: 1,
            team_id: 0,
            kind: "Knight".into(),
            position: [0, 0],
            direction: Direction::S,
            health_deficit: 49,
            max_health: 50,
        };
        assert!(!unit.is_dead());
        unit.health_deficit = 50;
        assert!(unit.is_dead());
    }
}
