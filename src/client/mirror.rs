//! Client Mirror
//!
//! Local copy of one game, kept current from the event stream. A snapshot
//! is only needed after connecting; from then on every event is applied in
//! order. The mirror keeps the teams, the game options and a bounded window
//! of trailing turns: exactly what the undo rules look at.
//!
//! Unit positions of a turn are never sent. A `startTurn` derives them by
//! replaying the previous turn's action results over its snapshot.

use thiserror::Error;

use crate::core::time::Timestamp;
use crate::game::action::{TeamId, Unit};
use crate::game::events::{GameEnd, GameEvent};
use crate::game::request::PlayerRequest;
use crate::game::state::{GameSettings, Team};
use crate::game::turn::{Turn, TurnHeader, TurnId};
use crate::game::undo::{undo_pointer, undo_window, UndoContext, UndoPointer};
use crate::game::ActionPosition;
use crate::sync::{ClientReference, Reference, SyncPatch};

/// The mirror can no longer follow the event stream and must rejoin
/// without a reference.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("mirror needs a resync: {0}")]
pub struct NeedsResync(pub String);

impl NeedsResync {
    fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Local view of one game.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientMirror {
    teams: Vec<Team>,
    settings: GameSettings,
    started_at: Option<Timestamp>,
    start_units: Vec<Unit>,
    turns: Vec<Turn>,
    ended: Option<GameEnd>,
    request: Option<PlayerRequest>,
}

impl ClientMirror {
    /// Empty mirror; populated by the first patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Teams.
    pub fn teams(&self) -> &[Team] {
        &self.teams
    }

    /// Options.
    pub fn settings(&self) -> &GameSettings {
        &self.settings
    }

    /// Game start time.
    pub fn started_at(&self) -> Option<Timestamp> {
        self.started_at
    }

    /// Trailing turns, oldest first, ending with the current one.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Current turn.
    pub fn current_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Current units: the turn's snapshot with its actions replayed.
    pub fn units(&self) -> Vec<Unit> {
        self.current_turn().map(Turn::units_after).unwrap_or_default()
    }

    /// End data.
    pub fn ended(&self) -> Option<&GameEnd> {
        self.ended.as_ref()
    }

    /// Latest player request, settled or not.
    pub fn player_request(&self) -> Option<&PlayerRequest> {
        self.request.as_ref()
    }

    /// Team `player` plays, preferring the one whose turn it is.
    pub fn team_of(&self, player: &str) -> Option<TeamId> {
        let current = self.current_turn().map(|t| t.team_id);
        let owned = || self.teams.iter().filter(|t| t.player_id.as_deref() == Some(player));
        owned()
            .find(|t| Some(t.id) == current)
            .or_else(|| owned().next())
            .map(|t| t.id)
    }

    /// Where the mirror is, in the form sent with `join`.
    pub fn reference(&self) -> ClientReference {
        match self.current_turn() {
            None => ClientReference::Creation,
            Some(turn) => ClientReference::Position(Reference {
                turn_id: turn.id,
                turn_started_at: turn.started_at,
                turn_time_limit: turn.time_limit,
                ended_at: self.ended.map(|e| e.ended_at),
                actions: turn.action_timestamps(),
            }),
        }
    }

    /// Position to stamp on submitted actions.
    pub fn position(&self) -> Option<ActionPosition> {
        self.current_turn().map(|turn| ActionPosition {
            turn_id: turn.id,
            action_count: turn.actions.len(),
        })
    }

    /// Whether actions built at `position` were never applied: the mirror
    /// is still exactly there.
    pub fn is_at(&self, position: ActionPosition) -> bool {
        self.position() == Some(position)
    }

    // -------------------------------------------------------------------------
    // UNDO
    // -------------------------------------------------------------------------

    fn undo_context(&self) -> UndoContext<'_> {
        UndoContext {
            teams: &self.teams,
            strict_undo: self.settings.strict_undo,
            ended: self.ended.is_some(),
        }
    }

    /// Where an undo by `team_id` would rewind to, judged at server time `now`.
    pub fn undo_pointer(&self, team_id: TeamId, now: Timestamp) -> Option<UndoPointer> {
        undo_pointer(&self.undo_context(), &self.turns, team_id, now)
    }

    /// Whether `team_id` may undo at server time `now`.
    pub fn can_undo(&self, team_id: TeamId, now: Timestamp) -> bool {
        self.undo_pointer(team_id, now).is_some()
    }

    // -------------------------------------------------------------------------
    // APPLY
    // -------------------------------------------------------------------------

    /// Apply a join response.
    ///
    /// Returns the events it carried, for re-emission. Fails when the
    /// mirror does not end up at the patch's reference, which is how a
    /// coarse patch for a far-behind client shows up.
    pub fn apply_patch(&mut self, patch: &SyncPatch) -> Result<Vec<GameEvent>, NeedsResync> {
        if let Some(state) = &patch.state {
            if state.is_snapshot() {
                self.teams = state.teams.clone().unwrap_or_default();
                if let Some(settings) = &state.settings {
                    self.settings = settings.clone();
                }
                self.started_at = state.started_at;
                self.ended = state.game_end();
                self.turns = patch.recent_turns.clone().unwrap_or_default();
                self.turns.extend(state.current_turn());
                if let Some(first) = self.turns.first().filter(|t| t.id == 0) {
                    self.start_units = first.units.clone();
                }
                self.trim();
            } else {
                if state.turn_time_limit.is_some() || state.actions.is_some() {
                    let turn = self
                        .turns
                        .last_mut()
                        .ok_or_else(|| NeedsResync::new("patch for a game the mirror has not started"))?;
                    if state.turn_time_limit.is_some() {
                        turn.time_limit = state.turn_time_limit;
                    }
                    if let Some(actions) = &state.actions {
                        let keep = state.actions_from.unwrap_or(0);
                        if keep > turn.actions.len() {
                            return Err(NeedsResync::new("action suffix starts past the mirror's actions"));
                        }
                        turn.actions.truncate(keep);
                        turn.actions.extend_from_slice(actions);
                    }
                }
                if state.ended_at.is_some() {
                    self.ended = state.game_end();
                }
            }
        }

        // A non-empty patch always carries the pending request, if any.
        if !patch.is_empty() {
            self.request = patch.state.as_ref().and_then(|s| s.player_request.clone());
        }

        let events = patch.events.clone().unwrap_or_default();
        for event in &events {
            self.apply_event(event)?;
        }

        if self.reference() != patch.reference {
            return Err(NeedsResync::new("reference mismatch after patch"));
        }
        Ok(events)
    }

    /// Apply one event from the stream.
    pub fn apply_event(&mut self, event: &GameEvent) -> Result<(), NeedsResync> {
        match event {
            GameEvent::StartGame(start) => {
                self.teams = start.teams.clone();
                self.started_at = Some(start.started_at);
                self.start_units = start.units.clone();
                self.turns.clear();
                self.ended = None;
            }
            GameEvent::StartTurn(header) => self.start_turn(header)?,
            GameEvent::Action(batch) => {
                let turn = self
                    .turns
                    .iter_mut()
                    .find(|t| t.id == batch.turn_id)
                    .ok_or_else(|| NeedsResync::new(format!("actions for unknown turn {}", batch.turn_id)))?;
                let last = turn.actions.last().map(|a| a.created_at);
                turn.actions.extend(
                    batch
                        .actions
                        .iter()
                        .filter(|a| last.map_or(true, |last| a.created_at > last))
                        .cloned(),
                );
            }
            GameEvent::Revert(turn) => {
                self.turns.retain(|t| t.id < turn.id);
                self.turns.push(turn.clone());
            }
            GameEvent::EndGame(end) => self.ended = Some(*end),
            GameEvent::PlayerRequest(request) => self.request = Some(request.clone()),
        }
        Ok(())
    }

    fn start_turn(&mut self, header: &TurnHeader) -> Result<(), NeedsResync> {
        let (units, draw_counts) = if header.turn_id == 0 {
            (self.start_units.clone(), None)
        } else {
            let previous = self
                .turn(header.turn_id - 1)
                .ok_or_else(|| NeedsResync::new(format!("turn {} is missing", header.turn_id - 1)))?;
            (previous.units_after(), Some(previous.next_draw_counts()))
        };

        self.turns.retain(|t| t.id < header.turn_id);
        self.turns.push(Turn {
            id: header.turn_id,
            team_id: header.team_id,
            started_at: header.started_at,
            units,
            actions: Vec::new(),
            time_limit: header.time_limit,
            draw_counts,
        });
        self.trim();

        let player = self
            .teams
            .iter()
            .find(|t| t.id == header.team_id)
            .and_then(|t| t.player_id.as_deref());
        if self
            .request
            .as_ref()
            .is_some_and(|r| !r.is_pending() && Some(r.created_by.as_str()) == player)
        {
            self.request = None;
        }
        Ok(())
    }

    fn turn(&self, id: TurnId) -> Option<&Turn> {
        self.turns.iter().find(|t| t.id == id)
    }

    fn trim(&mut self) {
        let window = undo_window(self.teams.len());
        let excess = self.turns.len().saturating_sub(window);
        self.turns.drain(..excess);
    }
}
