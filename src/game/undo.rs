//! Undo Eligibility
//!
//! Decides how far a team may rewind and whether the other players must
//! approve. The server's request machine and the client mirror both call
//! [`undo_pointer`] over the same trailing window of turns, so a client
//! never shows an undo control the server would refuse.
//!
//! Rules, walking backward from the current turn:
//!
//! - During its own turn a team may rewind its own actions freely. In strict
//!   mode only actions younger than [`STRICT_UNDO_WINDOW_MS`] can go.
//! - Otherwise the team rewinds into its most recent turn, reopening it by
//!   removing the `endTurn`. A turn closed by a forced pass is locked.
//! - Rewinding past another team's unforced action needs approval. Turns made
//!   only of forced actions (auto-skips) do not count.
//! - Bots never grant approval, so an undo that needs it is refused when any
//!   opponent is a bot.

use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;
use crate::game::action::TeamId;
use crate::game::state::Team;
use crate::game::turn::{Turn, TurnId};

/// Actions older than this cannot be undone in strict mode.
pub const STRICT_UNDO_WINDOW_MS: i64 = 5_000;

/// Inputs to the eligibility rules besides the turns themselves.
#[derive(Clone, Copy, Debug)]
pub struct UndoContext<'a> {
    /// Teams of the game.
    pub teams: &'a [Team],
    /// Strict undo mode.
    pub strict_undo: bool,
    /// Whether the game has ended.
    pub ended: bool,
}

/// Whether an undo applies immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UndoApproval {
    /// Apply immediately.
    Approve,
    /// Every other player must accept first.
    NeedsApproval,
}

/// Where an undo rewinds to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoPointer {
    /// Turn that becomes current.
    pub turn_id: TurnId,
    /// Number of that turn's actions that are kept.
    pub action_index: usize,
    /// Approval requirement.
    pub approval: UndoApproval,
}

/// Number of trailing turns (current included) the rules look at.
pub fn undo_window(team_count: usize) -> usize {
    team_count.max(1) + 1
}

/// Compute the undo pointer for `team_id`, or `None` if it cannot undo.
///
/// `turns` must be in ascending id order and end with the current turn.
pub fn undo_pointer(
    ctx: &UndoContext<'_>,
    turns: &[Turn],
    team_id: TeamId,
    now: Timestamp,
) -> Option<UndoPointer> {
    if ctx.ended {
        return None;
    }
    let current = turns.last()?;

    if current.team_id == team_id {
        if let Some(pointer) = own_turn_pointer(ctx, current, now) {
            return Some(pointer);
        }
    }

    // Rewind into this team's most recent closed turn.
    let (position, previous) = turns
        .iter()
        .enumerate()
        .rev()
        .skip(1)
        .find(|(_, turn)| turn.team_id == team_id)?;

    let closing = previous.actions.last()?;
    if closing.forced {
        return None;
    }
    if ctx.strict_undo && now.millis_since(closing.created_at) >= STRICT_UNDO_WINDOW_MS {
        return None;
    }

    let others_acted = turns[position + 1..]
        .iter()
        .any(|turn| turn.actions.iter().any(|a| !a.forced));

    let approval = if others_acted {
        if has_bot_opponent(ctx.teams, team_id) {
            return None;
        }
        UndoApproval::NeedsApproval
    } else {
        UndoApproval::Approve
    };

    Some(UndoPointer {
        turn_id: previous.id,
        action_index: previous.actions.len() - 1,
        approval,
    })
}

/// Shorthand: can `team_id` undo at all?
pub fn can_undo(ctx: &UndoContext<'_>, turns: &[Turn], team_id: TeamId, now: Timestamp) -> bool {
    undo_pointer(ctx, turns, team_id, now).is_some()
}

fn own_turn_pointer(ctx: &UndoContext<'_>, current: &Turn, now: Timestamp) -> Option<UndoPointer> {
    if !current.actions.iter().any(|a| !a.forced) {
        return None;
    }

    let keep = if ctx.strict_undo {
        let keep = current
            .actions
            .iter()
            .take_while(|a| now.millis_since(a.created_at) >= STRICT_UNDO_WINDOW_MS)
            .count();
        if keep == current.actions.len() {
            return None;
        }
        keep
    } else {
        0
    };

    Some(UndoPointer {
        turn_id: current.id,
        action_index: keep,
        approval: UndoApproval::Approve,
    })
}

fn has_bot_opponent(teams: &[Team], team_id: TeamId) -> bool {
    let own_player = teams
        .iter()
        .find(|t| t.id == team_id)
        .and_then(|t| t.player_id.as_ref());

    teams
        .iter()
        .filter(|t| t.id != team_id)
        .filter(|t| own_player.is_none() || t.player_id.as_ref() != own_player)
        .any(|t| t.bot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::action::{Action, ActionKind};

    fn teams(bot: bool) -> Vec<Team> {
        vec![Team::human(0, "alice"), {
            let mut t = Team::human(1, "bob");
            t.bot = bot;
            t
        }]
    }

    fn turn(id: TurnId, team_id: TeamId, actions: Vec<Action>) -> Turn {
        Turn {
            id,
            team_id,
            started_at: Timestamp::from_millis(0),
            units: Vec::new(),
            actions,
            time_limit: None,
            draw_counts: None,
        }
    }

    fn at(ms: i64, kind: ActionKind) -> Action {
        Action::new(kind, Timestamp::from_millis(ms))
    }

    fn ctx(teams: &[Team], strict: bool) -> UndoContext<'_> {
        UndoContext { teams, strict_undo: strict, ended: false }
    }

    #[test]
    fn test_previous_team_may_undo_into_empty_turn() {
        let teams = teams(false);
        let turns = vec![
            turn(0, 0, vec![at(1_000, ActionKind::AttackSpecial), at(2_000, ActionKind::EndTurn)]),
            turn(1, 1, vec![]),
        ];

        let pointer = undo_pointer(&ctx(&teams, false), &turns, 0, Timestamp::from_millis(3_000));
        assert_eq!(
            pointer,
            Some(UndoPointer { turn_id: 0, action_index: 1, approval: UndoApproval::Approve })
        );
    }

    #[test]
    fn test_opponent_action_requires_approval() {
        let teams = teams(false);
        let turns = vec![
            turn(0, 0, vec![at(1_000, ActionKind::EndTurn)]),
            turn(1, 1, vec![at(2_000, ActionKind::Select)]),
        ];

        let pointer = undo_pointer(&ctx(&teams, false), &turns, 0, Timestamp::from_millis(3_000));
        assert_eq!(pointer.map(|p| p.approval), Some(UndoApproval::NeedsApproval));
    }

    #[test]
    fn test_forced_actions_are_exempt() {
        let teams = teams(false);
        let turns = vec![
            turn(0, 0, vec![at(1_000, ActionKind::EndTurn)]),
            turn(1, 1, vec![at(2_000, ActionKind::EndTurn).forced()]),
            turn(2, 0, vec![]),
        ];

        // Own turn with nothing done: rewind into turn 0 across the auto-skip.
        let pointer = undo_pointer(&ctx(&teams, false), &turns, 0, Timestamp::from_millis(3_000));
        assert_eq!(
            pointer,
            Some(UndoPointer { turn_id: 0, action_index: 0, approval: UndoApproval::Approve })
        );
    }

    #[test]
    fn test_forced_pass_locks_the_turn() {
        let teams = teams(false);
        let turns = vec![
            turn(0, 0, vec![at(1_000, ActionKind::EndTurn).forced()]),
            turn(1, 1, vec![]),
        ];
        assert!(!can_undo(&ctx(&teams, false), &turns, 0, Timestamp::from_millis(1_500)));
    }

    #[test]
    fn test_bots_never_approve() {
        let teams = teams(true);
        let turns = vec![
            turn(0, 0, vec![at(1_000, ActionKind::EndTurn)]),
            turn(1, 1, vec![at(2_000, ActionKind::Select)]),
        ];
        assert!(!can_undo(&ctx(&teams, false), &turns, 0, Timestamp::from_millis(3_000)));
    }

    #[test]
    fn test_own_turn_undo() {
        let teams = teams(false);
        let turns = vec![turn(0, 0, vec![
            at(1_000, ActionKind::Select),
            at(9_000, ActionKind::Move { target: [1, 1] }),
        ])];

        let loose = undo_pointer(&ctx(&teams, false), &turns, 0, Timestamp::from_millis(10_000));
        assert_eq!(loose.map(|p| p.action_index), Some(0));

        // Strict: only the move is younger than the window.
        let strict = undo_pointer(&ctx(&teams, true), &turns, 0, Timestamp::from_millis(10_000));
        assert_eq!(strict.map(|p| p.action_index), Some(1));

        // Strict, everything too old: nothing to undo, and no earlier turn.
        let late = undo_pointer(&ctx(&teams, true), &turns, 0, Timestamp::from_millis(20_000));
        assert_eq!(late, None);
    }

    #[test]
    fn test_strict_end_turn_window() {
        let teams = teams(false);
        let turns = vec![
            turn(0, 0, vec![at(1_000, ActionKind::EndTurn)]),
            turn(1, 1, vec![]),
        ];
        assert!(can_undo(&ctx(&teams, true), &turns, 0, Timestamp::from_millis(5_999)));
        assert!(!can_undo(&ctx(&teams, true), &turns, 0, Timestamp::from_millis(6_000)));
    }

    #[test]
    fn test_ended_game_cannot_undo() {
        let teams = teams(false);
        let turns = vec![turn(0, 0, vec![at(1_000, ActionKind::Select)])];
        let ended = UndoContext { teams: &teams, strict_undo: false, ended: true };
        assert!(!can_undo(&ended, &turns, 0, Timestamp::from_millis(1_500)));
    }
}
