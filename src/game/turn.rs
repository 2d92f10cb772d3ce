//! Turns and Turn-State Replay
//!
//! Turns store the unit snapshot *at turn start* plus the actions taken.
//! The snapshot of turn N+1 is never sent over the wire; it is derived by
//! replaying turn N's action results over turn N's snapshot.

use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;
use crate::game::action::{Action, ActionKind, TeamId, Unit};

/// Turn number (0-based, contiguous).
pub type TurnId = u32;

/// Counters used by draw detection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawCounts {
    /// Consecutive turns that ended without any attack.
    pub passed_turn_count: u32,
    /// Consecutive turns without a unit being removed.
    pub attack_turn_count: u32,
}

/// One turn of the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    /// Turn number.
    pub id: TurnId,
    /// Team whose turn it is.
    pub team_id: TeamId,
    /// When the turn started.
    pub started_at: Timestamp,
    /// Units at turn start.
    pub units: Vec<Unit>,
    /// Actions taken so far.
    pub actions: Vec<Action>,
    /// Seconds allowed for this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<u32>,
    /// Draw counters at turn start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draw_counts: Option<DrawCounts>,
}

impl Turn {
    /// Whether an `endTurn` or `surrender` was appended.
    pub fn is_ended(&self) -> bool {
        self.actions.last().is_some_and(Action::ends_turn)
    }

    /// Creation timestamps of every action, in order.
    pub fn action_timestamps(&self) -> Vec<Timestamp> {
        self.actions.iter().map(|a| a.created_at).collect()
    }

    /// Deadline for this turn, if limited.
    pub fn deadline(&self) -> Option<Timestamp> {
        self.time_limit
            .map(|secs| self.started_at.offset_millis(i64::from(secs) * 1000))
    }

    /// Unit positions after every action of this turn.
    pub fn units_after(&self) -> Vec<Unit> {
        replay_units(&self.units, &self.actions)
    }

    /// Draw counters for the turn that follows this one.
    pub fn next_draw_counts(&self) -> DrawCounts {
        let counts = self.draw_counts.unwrap_or_default();
        let attacked = self.actions.iter().any(|a| {
            matches!(a.kind, ActionKind::Attack { .. } | ActionKind::AttackSpecial)
        });
        let before = self.units.len();
        let after = self.units_after().len();

        DrawCounts {
            passed_turn_count: if attacked { 0 } else { counts.passed_turn_count + 1 },
            attack_turn_count: if after < before { 0 } else { counts.attack_turn_count + 1 },
        }
    }

    /// Wire form without the unit snapshot.
    pub fn header(&self) -> TurnHeader {
        TurnHeader {
            turn_id: self.id,
            team_id: self.team_id,
            started_at: self.started_at,
            time_limit: self.time_limit,
        }
    }
}

/// The part of a turn announced by a `startTurn` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnHeader {
    /// Turn number.
    pub turn_id: TurnId,
    /// Acting team.
    pub team_id: TeamId,
    /// Start time.
    pub started_at: Timestamp,
    /// Seconds allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<u32>,
}

/// Apply action results over a snapshot.
///
/// Results are absolute values for the fields they carry. A unit whose
/// health deficit reaches its maximum is dropped from the output.
pub fn replay_units(start: &[Unit], actions: &[Action]) -> Vec<Unit> {
    let mut units: Vec<Unit> = start.to_vec();

    for action in actions {
        for result in &action.results {
            if let Some(unit) = units.iter_mut().find(|u| u.id == result.unit) {
                if let Some(position) = result.position {
                    unit.position = position;
                }
                if let Some(direction) = result.direction {
                    unit.direction = direction;
                }
                if let Some(deficit) = result.health_deficit {
                    unit.health_deficit = deficit;
                }
            }
        }
        units.retain(|u| !u.is_dead());
    }

    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::action::{ActionResult, Direction};

    fn unit(id: u32, team_id: u32) -> Unit {
        Unit {
            id,
            team_id,
            kind: "Pyromancer".into(),
            position: [id as i32, team_id as i32],
            direction: Direction::N,
            health_deficit: 0,
            max_health: 30,
        }
    }

    fn turn_with(actions: Vec<Action>) -> Turn {
        Turn {
            id: 0,
            team_id: 0,
            started_at: Timestamp::from_millis(1_000),
            units: vec![unit(1, 0), unit(2, 1)],
            actions,
            time_limit: Some(30),
            draw_counts: None,
        }
    }

    #[test]
    fn test_replay_applies_move_and_drops_dead_units() {
        let t = Timestamp::from_millis(2_000);
        let actions = vec![
            Action::new(ActionKind::Move { target: [5, 5] }, t)
                .with_unit(1)
                .with_result(ActionResult {
                    unit: 1,
                    position: Some([5, 5]),
                    direction: Some(Direction::E),
                    ..Default::default()
                }),
            Action::new(ActionKind::Attack { target: [2, 1] }, t)
                .with_unit(1)
                .with_result(ActionResult {
                    unit: 2,
                    health_deficit: Some(30),
                    ..Default::default()
                }),
        ];

        let units = replay_units(&turn_with(vec![]).units, &actions);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].position, [5, 5]);
        assert_eq!(units[0].direction, Direction::E);
    }

    #[test]
    fn test_turn_end_and_deadline() {
        let mut turn = turn_with(vec![]);
        assert!(!turn.is_ended());
        assert_eq!(turn.deadline(), Some(Timestamp::from_millis(31_000)));

        turn.actions.push(Action::new(ActionKind::EndTurn, Timestamp::from_millis(3_000)));
        assert!(turn.is_ended());
        assert_eq!(turn.action_timestamps(), vec![Timestamp::from_millis(3_000)]);
    }

    #[test]
    fn test_draw_counts_reset_on_attack() {
        let t = Timestamp::from_millis(2_000);
        let quiet = turn_with(vec![Action::new(ActionKind::EndTurn, t)]);
        assert_eq!(
            quiet.next_draw_counts(),
            DrawCounts { passed_turn_count: 1, attack_turn_count: 1 }
        );

        let violent = turn_with(vec![
            Action::new(ActionKind::Attack { target: [2, 1] }, t)
                .with_unit(1)
                .with_result(ActionResult {
                    unit: 2,
                    health_deficit: Some(40),
                    ..Default::default()
                }),
            Action::new(ActionKind::EndTurn, t),
        ]);
        assert_eq!(violent.next_draw_counts(), DrawCounts::default());
    }
}
