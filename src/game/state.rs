//! Turn Log
//!
//! The authoritative, append-only history of a game. [`TurnLog`] is the
//! seam the request machine and the reconciliation engine program against;
//! [`GameState`] is the in-memory implementation used by the server.
//!
//! Rule evaluation is not done here. Submitted actions already carry their
//! results; the log only checks whose turn it is, sequences and timestamps
//! the actions, and rolls turns over.

use std::borrow::Cow;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::error::SyncError;
use crate::core::time::Timestamp;
use crate::game::action::{Action, ActionInput, ActionKind, TeamId, Unit};
use crate::game::events::{ActionBatch, EndReason, GameEnd, GameEvent, GameStart};
use crate::game::turn::{Turn, TurnId};
use crate::game::undo::{undo_window, UndoContext, UndoPointer};

/// Player identifier (derived from the authenticated subject).
pub type PlayerId = String;

/// Trailing turns hidden from observers of a rated game in progress.
pub const OBSERVER_DELAY: usize = 2;

// =============================================================================
// TEAMS & SETTINGS
// =============================================================================

/// A seat in the game.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    /// Team index; also the turn rotation order.
    pub id: TeamId,
    /// Player controlling the team, once joined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<PlayerId>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Controlled by a bot.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bot: bool,
}

impl Team {
    /// A team controlled by a human player.
    pub fn human(id: TeamId, player_id: impl Into<PlayerId>) -> Self {
        Self {
            id,
            player_id: Some(player_id.into()),
            name: None,
            bot: false,
        }
    }

    /// A team controlled by a bot.
    pub fn bot(id: TeamId, name: impl Into<String>) -> Self {
        Self {
            id,
            player_id: None,
            name: Some(name.into()),
            bot: true,
        }
    }
}

/// Per-game options fixed at creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSettings {
    /// Rated game (enables truce, hides recent turns from observers).
    #[serde(default)]
    pub rated: bool,
    /// Strict undo mode.
    #[serde(default)]
    pub strict_undo: bool,
    /// Seconds per turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_time_limit: Option<u32>,
}

// =============================================================================
// TURN LOG SEAM
// =============================================================================

/// What the rest of the crate needs from the owner of a game's turns.
pub trait TurnLog {
    /// Teams in rotation order.
    fn teams(&self) -> &[Team];

    /// Options.
    fn settings(&self) -> &GameSettings;

    /// When turn 0 started.
    fn started_at(&self) -> Option<Timestamp>;

    /// Look up a turn by id.
    fn turn(&self, id: TurnId) -> Option<&Turn>;

    /// The turn in progress (or the last one, once ended).
    fn current_turn(&self) -> Option<&Turn>;

    /// Up to `count` trailing turns, ascending, current last.
    fn recent_turns(&self, count: usize) -> &[Turn];

    /// End data, once ended.
    fn ended(&self) -> Option<&GameEnd>;

    /// Append actions for `team_id`'s current turn.
    fn submit_action(
        &mut self,
        team_id: TeamId,
        actions: Vec<ActionInput>,
        now: Timestamp,
    ) -> Result<Vec<GameEvent>, SyncError>;

    /// Rewind to `pointer`.
    fn undo(&mut self, pointer: UndoPointer, now: Timestamp) -> Result<Vec<GameEvent>, SyncError>;

    /// End the game.
    fn end(&mut self, reason: EndReason, winner_id: Option<TeamId>, now: Timestamp) -> Vec<GameEvent>;

    /// The log as `player` may see it (`None` for anonymous observers).
    fn view_for(&self, player: Option<&str>) -> Cow<'_, Self>
    where
        Self: Clone;

    /// Current turn id.
    fn current_turn_id(&self) -> Option<TurnId> {
        self.current_turn().map(|t| t.id)
    }

    /// Current team id.
    fn current_team_id(&self) -> Option<TeamId> {
        self.current_turn().map(|t| t.team_id)
    }

    /// Start time of the current turn.
    fn turn_started_at(&self) -> Option<Timestamp> {
        self.current_turn().map(|t| t.started_at)
    }

    /// Actions of the current turn.
    fn actions(&self) -> &[Action] {
        self.current_turn().map(|t| t.actions.as_slice()).unwrap_or(&[])
    }

    /// End time.
    fn ended_at(&self) -> Option<Timestamp> {
        self.ended().map(|e| e.ended_at)
    }

    /// Winning team.
    fn winner_id(&self) -> Option<TeamId> {
        self.ended().and_then(|e| e.winner_id)
    }

    /// Whether `player` controls any team.
    fn is_participant(&self, player: &str) -> bool {
        self.teams().iter().any(|t| t.player_id.as_deref() == Some(player))
    }

    /// Whether `player` (or an anonymous observer) sees the log delayed.
    fn is_delayed_for(&self, player: Option<&str>) -> bool {
        self.settings().rated && self.ended().is_none() && player.map_or(true, |p| !self.is_participant(p))
    }

    /// Team `player` acts for: the current team if theirs, else their first.
    fn team_of(&self, player: &str) -> Option<TeamId> {
        let owns = |t: &&Team| t.player_id.as_deref() == Some(player);
        let current = self.current_team_id();
        self.teams()
            .iter()
            .filter(owns)
            .find(|t| Some(t.id) == current)
            .or_else(|| self.teams().iter().find(owns))
            .map(|t| t.id)
    }

    /// Distinct human players.
    fn players(&self) -> BTreeSet<&str> {
        self.teams()
            .iter()
            .filter_map(|t| t.player_id.as_deref())
            .collect()
    }

    /// Turns the undo rules look at.
    fn undo_turns(&self) -> &[Turn] {
        self.recent_turns(undo_window(self.teams().len()))
    }

    /// Undo rule inputs.
    fn undo_context(&self) -> UndoContext<'_> {
        UndoContext {
            teams: self.teams(),
            strict_undo: self.settings().strict_undo,
            ended: self.ended().is_some(),
        }
    }
}

// =============================================================================
// IN-MEMORY TURN LOG
// =============================================================================

/// In-memory turn log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    teams: Vec<Team>,
    settings: GameSettings,
    started_at: Option<Timestamp>,
    turns: Vec<Turn>,
    ended: Option<GameEnd>,
}

impl GameState {
    /// Create an unstarted game.
    pub fn new(teams: Vec<Team>, settings: GameSettings) -> Self {
        Self {
            teams,
            settings,
            started_at: None,
            turns: Vec::new(),
            ended: None,
        }
    }

    /// Whether turn 0 exists.
    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// All turns.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Seat a player on an open team.
    pub fn seat_player(&mut self, team_id: TeamId, player: &str) -> Result<(), SyncError> {
        if self.is_started() {
            return Err(SyncError::conflict("Game already started"));
        }
        let team = self
            .teams
            .iter_mut()
            .find(|t| t.id == team_id)
            .ok_or_else(|| SyncError::not_found("No such team"))?;
        if team.player_id.is_some() || team.bot {
            return Err(SyncError::conflict("Team is taken"));
        }
        team.player_id = Some(player.to_string());
        Ok(())
    }

    /// Start the game with the given opening units.
    pub fn start(&mut self, units: Vec<Unit>, now: Timestamp) -> Result<Vec<GameEvent>, SyncError> {
        if self.is_started() {
            return Err(SyncError::conflict("Game already started"));
        }
        if self.teams.len() < 2 {
            return Err(SyncError::conflict("Not enough teams"));
        }
        if self.teams.iter().any(|t| t.player_id.is_none() && !t.bot) {
            return Err(SyncError::conflict("Not all teams are seated"));
        }

        self.started_at = Some(now);
        let first = Turn {
            id: 0,
            team_id: self.teams[0].id,
            started_at: now,
            units: units.clone(),
            actions: Vec::new(),
            time_limit: self.settings.turn_time_limit,
            draw_counts: None,
        };
        let header = first.header();
        self.turns.push(first);

        Ok(vec![
            GameEvent::StartGame(GameStart {
                started_at: now,
                teams: self.teams.clone(),
                units,
            }),
            GameEvent::StartTurn(header),
        ])
    }

    /// Pass the current turn because its time ran out.
    pub fn pass_turn_on_timeout(&mut self, now: Timestamp) -> Result<Vec<GameEvent>, SyncError> {
        let team_id = self
            .current_team_id()
            .ok_or_else(|| SyncError::conflict("Game has not started"))?;
        let mut pass = ActionInput::of(ActionKind::EndTurn);
        pass.forced = true;
        self.submit_action(team_id, vec![pass], now)
    }

    fn next_created_at(&self, now: Timestamp) -> Timestamp {
        // Positional diffs compare timestamps, so they must be strictly increasing.
        match self.turns.last().and_then(|t| t.actions.last()) {
            Some(last) if last.created_at >= now => last.created_at.offset_millis(1),
            _ => now,
        }
    }

    fn start_next_turn(&mut self, now: Timestamp) -> GameEvent {
        let (next_id, next_team, units, draw_counts) = {
            let last = &self.turns[self.turns.len() - 1];
            let index = self
                .teams
                .iter()
                .position(|t| t.id == last.team_id)
                .unwrap_or(0);
            let next_team = self.teams[(index + 1) % self.teams.len()].id;
            (last.id + 1, next_team, last.units_after(), last.next_draw_counts())
        };

        let turn = Turn {
            id: next_id,
            team_id: next_team,
            started_at: now,
            units,
            actions: Vec::new(),
            time_limit: self.settings.turn_time_limit,
            draw_counts: Some(draw_counts),
        };
        let header = turn.header();
        self.turns.push(turn);
        GameEvent::StartTurn(header)
    }

    fn surrender_winner(&self, loser: TeamId) -> Option<TeamId> {
        let mut others = self.teams.iter().filter(|t| t.id != loser);
        match (others.next(), others.next()) {
            (Some(winner), None) => Some(winner.id),
            _ => None,
        }
    }
}

impl TurnLog for GameState {
    fn teams(&self) -> &[Team] {
        &self.teams
    }

    fn settings(&self) -> &GameSettings {
        &self.settings
    }

    fn started_at(&self) -> Option<Timestamp> {
        self.started_at
    }

    fn turn(&self, id: TurnId) -> Option<&Turn> {
        self.turns.get(id as usize).filter(|t| t.id == id)
    }

    fn current_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }

    fn recent_turns(&self, count: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(count);
        &self.turns[start..]
    }

    fn ended(&self) -> Option<&GameEnd> {
        self.ended.as_ref()
    }

    fn submit_action(
        &mut self,
        team_id: TeamId,
        actions: Vec<ActionInput>,
        now: Timestamp,
    ) -> Result<Vec<GameEvent>, SyncError> {
        if self.ended.is_some() {
            return Err(SyncError::conflict("Game already ended"));
        }
        let current = self
            .turns
            .last()
            .ok_or_else(|| SyncError::conflict("Game has not started"))?;
        if current.team_id != team_id {
            return Err(SyncError::conflict("Not your turn"));
        }
        if actions.is_empty() {
            return Err(SyncError::protocol("No actions submitted"));
        }
        if actions[..actions.len() - 1].iter().any(|a| a.kind.ends_turn()) {
            return Err(SyncError::protocol("Actions follow the end of the turn"));
        }

        let turn_id = current.id;
        let mut appended = Vec::with_capacity(actions.len());
        let mut closing = None;

        for input in actions {
            let action = input.stamp(self.next_created_at(now));
            let ends = action.ends_turn();
            let surrender = matches!(action.kind, ActionKind::Surrender);
            let idx = self.turns.len() - 1;
            self.turns[idx].actions.push(action.clone());
            appended.push(action);
            if ends {
                closing = Some(surrender);
            }
        }

        let mut events = vec![GameEvent::Action(ActionBatch { turn_id, actions: appended })];

        match closing {
            Some(true) => {
                let winner = self.surrender_winner(team_id);
                events.extend(self.end(EndReason::Victory, winner, now));
            }
            Some(false) => events.push(self.start_next_turn(now)),
            None => {}
        }

        Ok(events)
    }

    fn undo(&mut self, pointer: UndoPointer, now: Timestamp) -> Result<Vec<GameEvent>, SyncError> {
        if self.ended.is_some() {
            return Err(SyncError::conflict("Game already ended"));
        }
        let current_id = self
            .current_turn_id()
            .ok_or_else(|| SyncError::conflict("Game has not started"))?;
        let target = self
            .turn(pointer.turn_id)
            .ok_or_else(|| SyncError::not_found("Undo target turn no longer exists"))?;
        if pointer.action_index > target.actions.len() {
            return Err(SyncError::conflict("Undo target is out of range"));
        }

        self.turns.truncate(pointer.turn_id as usize + 1);
        let turn = &mut self.turns[pointer.turn_id as usize];
        turn.actions.truncate(pointer.action_index);
        if pointer.turn_id != current_id {
            // Reopened turns get a fresh clock.
            turn.started_at = now;
        }

        Ok(vec![GameEvent::Revert(turn.clone())])
    }

    fn end(&mut self, reason: EndReason, winner_id: Option<TeamId>, now: Timestamp) -> Vec<GameEvent> {
        if self.ended.is_some() {
            return Vec::new();
        }
        let end = GameEnd {
            ended_at: now,
            winner_id,
            reason,
        };
        self.ended = Some(end);
        vec![GameEvent::EndGame(end)]
    }

    fn view_for(&self, player: Option<&str>) -> Cow<'_, Self> {
        // The first turn stays visible so the view never moves backwards.
        let visible = self.turns.len().saturating_sub(OBSERVER_DELAY).max(1);

        if !self.is_delayed_for(player) || visible >= self.turns.len() {
            return Cow::Borrowed(self);
        }

        let mut view = self.clone();
        view.turns.truncate(visible);
        Cow::Owned(view)
    }
}
