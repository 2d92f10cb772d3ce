//! Game Module
//!
//! Everything that lives inside one game: the turn log, the undo rules and
//! the player request machine, bundled in the [`Game`] aggregate.
//!
//! ## Module Structure
//!
//! - `action`: Actions, units and their wire form
//! - `turn`: Turns and turn-state replay
//! - `state`: `TurnLog` seam and the in-memory `GameState`
//! - `undo`: Undo eligibility shared by server and client
//! - `request`: Undo/truce negotiation
//! - `events`: The event stream
//! - `store`: Persistence seam

pub mod action;
pub mod events;
pub mod request;
pub mod state;
pub mod store;
pub mod turn;
pub mod undo;

use serde::{Deserialize, Serialize};

use crate::core::error::SyncError;
use crate::core::time::Timestamp;

// Re-export key types
pub use action::{Action, ActionInput, ActionKind, ActionResult, Direction, TeamId, Unit, UnitId};
pub use events::{ActionBatch, EndReason, GameEnd, GameEvent, GameStart};
pub use request::{PlayerRequest, PlayerRequests, RequestKind, RequestOutcome, RequestStatus};
pub use state::{GameSettings, GameState, PlayerId, Team, TurnLog};
pub use store::{GameStore, MemoryGameStore};
pub use turn::{Turn, TurnHeader, TurnId};
pub use undo::{can_undo, undo_pointer, UndoApproval, UndoPointer};

/// Game identifier.
pub type GameId = String;

/// Where the client believed the log was when it submitted actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPosition {
    /// Turn the actions were built for.
    pub turn_id: TurnId,
    /// Number of actions the turn had at the time.
    pub action_count: usize,
}

/// One game: its log and its request book.
///
/// Every mutation returns the events it produced, request bookkeeping
/// included, in the order clients must apply them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game<L: TurnLog = GameState> {
    /// Identifier.
    pub id: GameId,
    log: L,
    requests: PlayerRequests,
}

impl<L: TurnLog> Game<L> {
    /// Wrap a log.
    pub fn new(id: impl Into<GameId>, log: L) -> Self {
        Self {
            id: id.into(),
            log,
            requests: PlayerRequests::new(),
        }
    }

    /// The turn log.
    pub fn log(&self) -> &L {
        &self.log
    }

    /// The request book.
    pub fn requests(&self) -> &PlayerRequests {
        &self.requests
    }

    /// Pending request, if any.
    pub fn player_request(&self) -> Option<&PlayerRequest> {
        self.requests.pending()
    }

    /// Append actions on behalf of `player`.
    ///
    /// With a `position`, the submission is refused unless the log is still
    /// exactly there, so a resent batch is never appended twice.
    pub fn submit_action(
        &mut self,
        player: &str,
        actions: Vec<ActionInput>,
        position: Option<ActionPosition>,
        now: Timestamp,
    ) -> Result<Vec<GameEvent>, SyncError> {
        let team_id = self
            .log
            .team_of(player)
            .ok_or_else(|| SyncError::unauthorized("Not a participant"))?;
        if let Some(expected) = position {
            let actual = ActionPosition {
                turn_id: self.log.current_turn_id().unwrap_or_default(),
                action_count: self.log.actions().len(),
            };
            if actual != expected {
                return Err(SyncError::conflict("Action is out of date"));
            }
        }
        let events = self.log.submit_action(team_id, actions, now)?;
        Ok(self.observe(events))
    }

    /// Propose an undo or truce.
    pub fn submit_player_request(
        &mut self,
        player: &str,
        kind: RequestKind,
        now: Timestamp,
    ) -> Result<(RequestOutcome, Vec<GameEvent>), SyncError> {
        let (outcome, events) = self.requests.submit(&mut self.log, player, kind, now)?;
        Ok((outcome, self.observe(events)))
    }

    /// Accept the pending request.
    pub fn accept_player_request(
        &mut self,
        player: &str,
        created_at: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<GameEvent>, SyncError> {
        let events = self.requests.accept(&mut self.log, player, created_at, now)?;
        Ok(self.observe(events))
    }

    /// Reject the pending request.
    pub fn reject_player_request(
        &mut self,
        player: &str,
        created_at: Timestamp,
    ) -> Result<Vec<GameEvent>, SyncError> {
        self.requests.reject(&self.log, player, created_at)
    }

    /// Withdraw the pending request.
    pub fn cancel_player_request(&mut self, player: &str) -> Result<Vec<GameEvent>, SyncError> {
        self.requests.cancel(player)
    }

    /// End the game.
    pub fn end(&mut self, reason: EndReason, winner_id: Option<TeamId>, now: Timestamp) -> Vec<GameEvent> {
        let events = self.log.end(reason, winner_id, now);
        self.observe(events)
    }

    fn observe(&mut self, mut events: Vec<GameEvent>) -> Vec<GameEvent> {
        let follow_up = self.requests.observe(&self.log, &events);
        events.extend(follow_up);
        events
    }
}

impl Game<GameState> {
    /// Seat `player` on `team_id`.
    pub fn join(&mut self, team_id: TeamId, player: &str) -> Result<(), SyncError> {
        self.log.seat_player(team_id, player)
    }

    /// Start the game.
    pub fn start(&mut self, units: Vec<Unit>, now: Timestamp) -> Result<Vec<GameEvent>, SyncError> {
        let events = self.log.start(units, now)?;
        Ok(self.observe(events))
    }

    /// Force-pass an expired turn.
    pub fn pass_turn_on_timeout(&mut self, now: Timestamp) -> Result<Vec<GameEvent>, SyncError> {
        let events = self.log.pass_turn_on_timeout(now)?;
        Ok(self.observe(events))
    }

    /// Deadline of the current turn, if any and the game is running.
    pub fn turn_deadline(&self) -> Option<Timestamp> {
        if self.log.ended().is_some() {
            return None;
        }
        self.log.current_turn().and_then(Turn::deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn started() -> Game {
        let mut game = Game::new(
            "g1",
            GameState::new(
                vec![Team::human(0, "alice"), Team::human(1, "bob")],
                GameSettings { turn_time_limit: Some(30), ..Default::default() },
            ),
        );
        game.start(Vec::new(), ts(0)).unwrap();
        game
    }

    #[test]
    fn test_resent_action_is_not_appended_twice() {
        let mut game = started();
        let position = Some(ActionPosition { turn_id: 0, action_count: 0 });

        game.submit_action("alice", vec![ActionInput::of(ActionKind::Select)], position, ts(1_000))
            .unwrap();
        let err = game
            .submit_action("alice", vec![ActionInput::of(ActionKind::Select)], position, ts(1_500))
            .unwrap_err();

        assert_eq!(err, SyncError::conflict("Action is out of date"));
        assert_eq!(game.log().actions().len(), 1);
    }

    #[test]
    fn test_outsider_cannot_act() {
        let mut game = started();
        let err = game
            .submit_action("mallory", vec![ActionInput::of(ActionKind::EndTurn)], None, ts(1_000))
            .unwrap_err();
        assert_eq!(err.code(), 403);
    }

    #[test]
    fn test_start_turn_lifts_cooldown_through_aggregate() {
        let mut game = started();
        game.submit_action("alice", vec![ActionInput::of(ActionKind::EndTurn)], None, ts(1_000))
            .unwrap();
        game.submit_action("bob", vec![ActionInput::of(ActionKind::Select)], None, ts(2_000))
            .unwrap();

        let (outcome, _) = game.submit_player_request("alice", RequestKind::Undo, ts(3_000)).unwrap();
        assert_eq!(outcome, RequestOutcome::NeedsApproval);
        let created_at = game.player_request().map(|r| r.created_at).unwrap();
        game.reject_player_request("bob", created_at).unwrap();
        assert!(game.requests().is_rejected("alice", RequestKind::Undo));

        game.submit_action("bob", vec![ActionInput::of(ActionKind::EndTurn)], None, ts(4_000))
            .unwrap();
        assert!(!game.requests().is_rejected("alice", RequestKind::Undo));
    }

    #[test]
    fn test_timeout_and_deadline() {
        let mut game = started();
        assert_eq!(game.turn_deadline(), Some(ts(30_000)));
        game.pass_turn_on_timeout(ts(30_000)).unwrap();
        assert_eq!(game.log().current_team_id(), Some(1));
        assert_eq!(game.turn_deadline(), Some(ts(60_000)));

        game.end(EndReason::Draw, None, ts(40_000));
        assert_eq!(game.turn_deadline(), None);
    }
}
