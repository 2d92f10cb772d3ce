//! Player Request State Machine
//!
//! Undo and truce proposals that need every other player's consent.
//!
//! ```text
//! none ──submit──► pending ──accept (all players)──► completed
//!                     │
//!                     ├──reject──► rejected   (records a cooldown)
//!                     └──cancel──► cancelled
//! ```
//!
//! At most one request is pending per game. A rejection blocks the creator
//! from submitting the same kind again until their team's next turn starts.
//! Every transition is reported as a `playerRequest` event; a rejection is an
//! outcome, not an error.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::error::SyncError;
use crate::core::time::Timestamp;
use crate::game::action::TeamId;
use crate::game::events::{EndReason, GameEvent};
use crate::game::state::{PlayerId, TurnLog};
use crate::game::undo::{undo_pointer, UndoApproval, UndoPointer};

// =============================================================================
// TYPES
// =============================================================================

/// What is being proposed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestKind {
    /// Rewind the log.
    Undo,
    /// End the game without a winner.
    Truce,
}

impl RequestKind {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Undo => "undo",
            RequestKind::Truce => "truce",
        }
    }
}

/// Lifecycle state of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestStatus {
    /// Waiting for acceptances.
    Pending,
    /// Everyone accepted; the effect was applied.
    Completed,
    /// Another player said no.
    Rejected,
    /// Withdrawn by the creator, or invalidated.
    Cancelled,
}

/// A proposal and who has agreed to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRequest {
    /// Kind of proposal.
    #[serde(rename = "type")]
    pub kind: RequestKind,
    /// Current state.
    pub status: RequestStatus,
    /// Proposing player.
    pub created_by: PlayerId,
    /// Submission time; identifies the request in accept/reject calls.
    pub created_at: Timestamp,
    /// Players that agreed so far (the creator included).
    pub accepted: BTreeSet<PlayerId>,
    /// Team the creator acted for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
    /// Player that rejected it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_by: Option<PlayerId>,
}

impl PlayerRequest {
    /// Whether still open.
    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }
}

/// Result of a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestOutcome {
    /// The effect was applied right away.
    Approve,
    /// A pending request now waits for the other players.
    NeedsApproval,
}

enum Validation {
    Deny(&'static str),
    Approve(Option<UndoPointer>),
    NeedsApproval(Option<UndoPointer>),
}

// =============================================================================
// REQUEST BOOK
// =============================================================================

/// Per-game request state: the latest request plus rejection cooldowns.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRequests {
    current: Option<PlayerRequest>,
    /// `"playerId:type"` → rejecting player.
    rejected: BTreeMap<String, PlayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    undo_pointer: Option<UndoPointer>,
}

fn cooldown_key(player: &str, kind: RequestKind) -> String {
    format!("{}:{}", player, kind.as_str())
}

impl PlayerRequests {
    /// Empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest request, whatever its status.
    pub fn current(&self) -> Option<&PlayerRequest> {
        self.current.as_ref()
    }

    /// The pending request, if any.
    pub fn pending(&self) -> Option<&PlayerRequest> {
        self.current.as_ref().filter(|r| r.is_pending())
    }

    /// Whether `player` is in cooldown for `kind`.
    pub fn is_rejected(&self, player: &str, kind: RequestKind) -> bool {
        self.rejected.contains_key(&cooldown_key(player, kind))
    }

    /// Propose an undo or a truce.
    pub fn submit<L: TurnLog>(
        &mut self,
        log: &mut L,
        player: &str,
        kind: RequestKind,
        now: Timestamp,
    ) -> Result<(RequestOutcome, Vec<GameEvent>), SyncError> {
        if self.pending().is_some() {
            return Err(SyncError::conflict("A request is already pending"));
        }
        let team_id = log
            .team_of(player)
            .ok_or_else(|| SyncError::unauthorized("Not a participant"))?;
        if self.is_rejected(player, kind) {
            return Err(SyncError::conflict(format!("{} already rejected", kind.as_str())));
        }

        let validation = match kind {
            RequestKind::Undo => Self::validate_undo(log, team_id, now),
            RequestKind::Truce => Self::validate_truce(log),
        };

        match validation {
            Validation::Deny(reason) => Err(SyncError::conflict(reason)),
            Validation::Approve(pointer) => {
                debug!(player, kind = kind.as_str(), "request auto-approved");
                let events = Self::apply_effect(log, kind, pointer, now)?;
                Ok((RequestOutcome::Approve, events))
            }
            Validation::NeedsApproval(pointer) => {
                self.undo_pointer = pointer;
                self.current = Some(PlayerRequest {
                    kind,
                    status: RequestStatus::Pending,
                    created_by: player.to_string(),
                    created_at: now,
                    accepted: BTreeSet::from([player.to_string()]),
                    team_id: Some(team_id),
                    rejected_by: None,
                });

                // Only one distinct player (hot-seat): nobody else to ask.
                if self.is_unanimous(log) {
                    return Ok((RequestOutcome::Approve, self.complete(log, now)));
                }
                Ok((RequestOutcome::NeedsApproval, self.snapshot_event()))
            }
        }
    }

    /// Agree to the pending request identified by `created_at`.
    pub fn accept<L: TurnLog>(
        &mut self,
        log: &mut L,
        player: &str,
        created_at: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<GameEvent>, SyncError> {
        self.check_pending(created_at)?;
        if !log.is_participant(player) {
            return Err(SyncError::unauthorized("Not a participant"));
        }

        if let Some(request) = self.current.as_mut() {
            request.accepted.insert(player.to_string());
        }
        if self.is_unanimous(log) {
            return Ok(self.complete(log, now));
        }
        Ok(self.snapshot_event())
    }

    /// Refuse the pending request identified by `created_at`.
    pub fn reject<L: TurnLog>(
        &mut self,
        log: &L,
        player: &str,
        created_at: Timestamp,
    ) -> Result<Vec<GameEvent>, SyncError> {
        self.check_pending(created_at)?;
        if !log.is_participant(player) {
            return Err(SyncError::unauthorized("Not a participant"));
        }

        let Some(request) = self.current.as_mut() else {
            return Err(SyncError::not_found("No pending request"));
        };
        if request.created_by == player {
            return Err(SyncError::conflict("Cannot reject your own request"));
        }
        request.status = RequestStatus::Rejected;
        request.rejected_by = Some(player.to_string());
        self.rejected
            .insert(cooldown_key(&request.created_by, request.kind), player.to_string());
        self.undo_pointer = None;

        Ok(self.snapshot_event())
    }

    /// Withdraw the pending request.
    pub fn cancel(&mut self, player: &str) -> Result<Vec<GameEvent>, SyncError> {
        let Some(request) = self.current.as_mut().filter(|r| r.is_pending()) else {
            return Err(SyncError::not_found("No pending request"));
        };
        if request.created_by != player {
            return Err(SyncError::unauthorized("Only the creator can cancel a request"));
        }
        request.status = RequestStatus::Cancelled;
        self.undo_pointer = None;

        Ok(self.snapshot_event())
    }

    /// Follow-up bookkeeping for events produced by the log.
    ///
    /// A starting turn lifts the cooldowns of that team's player and clears
    /// their settled request. A game end cancels whatever is pending.
    pub fn observe<L: TurnLog>(&mut self, log: &L, events: &[GameEvent]) -> Vec<GameEvent> {
        let mut follow_up = Vec::new();

        for event in events {
            match event {
                GameEvent::StartTurn(header) => {
                    let Some(player) = log
                        .teams()
                        .iter()
                        .find(|t| t.id == header.team_id)
                        .and_then(|t| t.player_id.clone())
                    else {
                        continue;
                    };
                    let prefix = format!("{}:", player);
                    self.rejected.retain(|key, _| !key.starts_with(&prefix));
                    if self
                        .current
                        .as_ref()
                        .is_some_and(|r| !r.is_pending() && r.created_by == player)
                    {
                        self.current = None;
                    }
                }
                GameEvent::EndGame(_) => {
                    if let Some(request) = self.current.as_mut().filter(|r| r.is_pending()) {
                        request.status = RequestStatus::Cancelled;
                        self.undo_pointer = None;
                        follow_up.extend(self.snapshot_event());
                    }
                }
                _ => {}
            }
        }

        follow_up
    }

    // -------------------------------------------------------------------------

    fn validate_undo<L: TurnLog>(log: &L, team_id: TeamId, now: Timestamp) -> Validation {
        match undo_pointer(&log.undo_context(), log.undo_turns(), team_id, now) {
            None => Validation::Deny("Undo is not allowed"),
            Some(p) if p.approval == UndoApproval::Approve => Validation::Approve(Some(p)),
            Some(p) => Validation::NeedsApproval(Some(p)),
        }
    }

    fn validate_truce<L: TurnLog>(log: &L) -> Validation {
        if !log.settings().rated {
            return Validation::Deny("Truce is only available in rated games");
        }
        if log.ended().is_some() {
            return Validation::Deny("Game already ended");
        }
        if log.teams().iter().any(|t| t.bot) {
            return Validation::Deny("Bots do not accept truces");
        }
        Validation::NeedsApproval(None)
    }

    fn apply_effect<L: TurnLog>(
        log: &mut L,
        kind: RequestKind,
        pointer: Option<UndoPointer>,
        now: Timestamp,
    ) -> Result<Vec<GameEvent>, SyncError> {
        match kind {
            RequestKind::Undo => {
                let pointer = pointer.ok_or_else(|| SyncError::conflict("Undo is not allowed"))?;
                log.undo(pointer, now)
            }
            RequestKind::Truce => Ok(log.end(EndReason::Truce, None, now)),
        }
    }

    fn check_pending(&self, created_at: Timestamp) -> Result<(), SyncError> {
        let request = self
            .pending()
            .ok_or_else(|| SyncError::not_found("No pending request"))?;
        if request.created_at != created_at {
            return Err(SyncError::conflict("Request has changed"));
        }
        Ok(())
    }

    fn is_unanimous<L: TurnLog>(&self, log: &L) -> bool {
        self.pending().is_some_and(|request| {
            log.players()
                .iter()
                .all(|p| request.accepted.contains(*p))
        })
    }

    fn complete<L: TurnLog>(&mut self, log: &mut L, now: Timestamp) -> Vec<GameEvent> {
        let Some(kind) = self.pending().map(|r| r.kind) else {
            return Vec::new();
        };
        let pointer = self.undo_pointer.take();

        if kind == RequestKind::Undo && !self.undo_target_holds(log, pointer, now) {
            debug!("undo target moved while pending, cancelling");
            if let Some(request) = self.current.as_mut() {
                request.status = RequestStatus::Cancelled;
            }
            return self.snapshot_event();
        }

        match Self::apply_effect(log, kind, pointer, now) {
            Ok(mut effects) => {
                if let Some(request) = self.current.as_mut() {
                    request.status = RequestStatus::Completed;
                }
                let mut events = self.snapshot_event();
                events.append(&mut effects);
                events
            }
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "request effect failed, cancelling");
                if let Some(request) = self.current.as_mut() {
                    request.status = RequestStatus::Cancelled;
                }
                self.snapshot_event()
            }
        }
    }

    /// Whether the requester's undo would still land where it was approved.
    fn undo_target_holds<L: TurnLog>(&self, log: &L, pointer: Option<UndoPointer>, now: Timestamp) -> bool {
        let Some(team_id) = self.pending().and_then(|r| r.team_id) else {
            return false;
        };
        let fresh = undo_pointer(&log.undo_context(), log.undo_turns(), team_id, now);
        matches!(
            (fresh, pointer),
            (Some(a), Some(b)) if a.turn_id == b.turn_id && a.action_index == b.action_index
        )
    }

    fn snapshot_event(&self) -> Vec<GameEvent> {
        self.current
            .iter()
            .map(|r| GameEvent::PlayerRequest(r.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::action::{ActionInput, ActionKind};
    use crate::game::state::{GameSettings, GameState, Team};

    fn ts(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn game(settings: GameSettings) -> GameState {
        let mut game = GameState::new(vec![Team::human(0, "alice"), Team::human(1, "bob")], settings);
        game.start(Vec::new(), ts(1_000)).unwrap();
        game
    }

    fn end_turn(game: &mut GameState, team: TeamId, at: i64) -> Vec<GameEvent> {
        game.submit_action(team, vec![ActionInput::of(ActionKind::EndTurn)], ts(at))
            .unwrap()
    }

    #[test]
    fn test_undo_into_empty_turn_then_needs_approval() {
        let mut game = game(GameSettings::default());
        let mut requests = PlayerRequests::new();
        end_turn(&mut game, 0, 2_000);

        // Bob has not acted: alice's undo applies right away.
        let mut scratch = game.clone();
        let (outcome, events) = requests.submit(&mut scratch, "alice", RequestKind::Undo, ts(3_000)).unwrap();
        assert_eq!(outcome, RequestOutcome::Approve);
        assert!(matches!(events[0], GameEvent::Revert(_)));
        assert!(requests.pending().is_none());

        // After one unforced action by bob, the same request needs approval.
        game.submit_action(1, vec![ActionInput::of(ActionKind::Select)], ts(3_000))
            .unwrap();
        let (outcome, events) = requests.submit(&mut game, "alice", RequestKind::Undo, ts(4_000)).unwrap();
        assert_eq!(outcome, RequestOutcome::NeedsApproval);
        assert!(matches!(&events[0], GameEvent::PlayerRequest(r) if r.is_pending()));
        assert_eq!(game.current_turn_id(), Some(1));
    }

    #[test]
    fn test_accept_applies_undo_once() {
        let mut game = game(GameSettings::default());
        let mut requests = PlayerRequests::new();
        end_turn(&mut game, 0, 2_000);
        game.submit_action(1, vec![ActionInput::of(ActionKind::Select)], ts(3_000))
            .unwrap();

        requests.submit(&mut game, "alice", RequestKind::Undo, ts(4_000)).unwrap();
        assert_eq!(
            requests.accept(&mut game, "bob", ts(9_999), ts(5_000)),
            Err(SyncError::conflict("Request has changed"))
        );

        let events = requests.accept(&mut game, "bob", ts(4_000), ts(5_000)).unwrap();
        assert!(matches!(&events[0], GameEvent::PlayerRequest(r) if r.status == RequestStatus::Completed));
        assert!(matches!(&events[1], GameEvent::Revert(turn) if turn.id == 0));
        assert_eq!(game.current_turn_id(), Some(0));

        // Settled: a second accept finds nothing.
        let err = requests.accept(&mut game, "bob", ts(4_000), ts(6_000)).unwrap_err();
        assert_eq!(err.code(), 404);
    }

    #[test]
    fn test_accept_cancels_when_undo_target_moved() {
        let mut game = game(GameSettings::default());
        let mut requests = PlayerRequests::new();
        end_turn(&mut game, 0, 2_000);
        game.submit_action(1, vec![ActionInput::of(ActionKind::Select)], ts(3_000))
            .unwrap();
        requests.submit(&mut game, "alice", RequestKind::Undo, ts(4_000)).unwrap();

        // Play moves on: alice's most recent turn is now turn 2.
        end_turn(&mut game, 1, 4_500);
        end_turn(&mut game, 0, 5_000);

        let events = requests.accept(&mut game, "bob", ts(4_000), ts(6_000)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], GameEvent::PlayerRequest(r) if r.status == RequestStatus::Cancelled));
        assert_eq!(game.current_turn_id(), Some(3));
        assert!(requests.pending().is_none());
    }

    #[test]
    fn test_rejection_cooldown_lifts_on_next_turn() {
        let mut game = game(GameSettings::default());
        let mut requests = PlayerRequests::new();
        end_turn(&mut game, 0, 2_000);
        game.submit_action(1, vec![ActionInput::of(ActionKind::Select)], ts(3_000))
            .unwrap();

        requests.submit(&mut game, "alice", RequestKind::Undo, ts(4_000)).unwrap();
        let events = requests.reject(&game, "bob", ts(4_000)).unwrap();
        assert!(matches!(&events[0], GameEvent::PlayerRequest(r) if r.rejected_by.as_deref() == Some("bob")));
        assert!(requests.is_rejected("alice", RequestKind::Undo));

        let err = requests.submit(&mut game, "alice", RequestKind::Undo, ts(5_000)).unwrap_err();
        assert_eq!(err, SyncError::conflict("undo already rejected"));

        // Bob ends his turn; alice's turn starts and her cooldown lifts.
        let events = end_turn(&mut game, 1, 6_000);
        requests.observe(&game, &events);
        assert!(!requests.is_rejected("alice", RequestKind::Undo));
        assert!(requests.current().is_none());

        // Still eligible, and bob's turn had an unforced action.
        let (outcome, _) = requests.submit(&mut game, "alice", RequestKind::Undo, ts(7_000)).unwrap();
        assert_eq!(outcome, RequestOutcome::NeedsApproval);
    }

    #[test]
    fn test_reject_and_cancel_permissions() {
        let mut game = game(GameSettings { rated: true, ..Default::default() });
        let mut requests = PlayerRequests::new();

        requests.submit(&mut game, "alice", RequestKind::Truce, ts(2_000)).unwrap();
        assert_eq!(
            requests.submit(&mut game, "bob", RequestKind::Truce, ts(2_500)),
            Err(SyncError::conflict("A request is already pending"))
        );
        assert_eq!(requests.reject(&game, "alice", ts(2_000)).unwrap_err().code(), 409);
        assert_eq!(requests.reject(&game, "mallory", ts(2_000)).unwrap_err().code(), 403);
        assert_eq!(requests.cancel("bob").unwrap_err().code(), 403);

        let events = requests.cancel("alice").unwrap();
        assert!(matches!(&events[0], GameEvent::PlayerRequest(r) if r.status == RequestStatus::Cancelled));
        assert!(requests.pending().is_none());
    }

    #[test]
    fn test_truce_rules() {
        let mut unrated = game(GameSettings::default());
        let mut requests = PlayerRequests::new();
        assert_eq!(
            requests.submit(&mut unrated, "alice", RequestKind::Truce, ts(2_000)).unwrap_err().code(),
            409
        );
        assert_eq!(
            requests.submit(&mut unrated, "mallory", RequestKind::Truce, ts(2_000)).unwrap_err().code(),
            403
        );

        let mut rated = game(GameSettings { rated: true, ..Default::default() });
        let (outcome, _) = requests.submit(&mut rated, "alice", RequestKind::Truce, ts(2_000)).unwrap();
        assert_eq!(outcome, RequestOutcome::NeedsApproval);

        let events = requests.accept(&mut rated, "bob", ts(2_000), ts(3_000)).unwrap();
        assert!(events.iter().any(|e| matches!(e, GameEvent::EndGame(end) if end.reason == EndReason::Truce)));
        assert!(rated.ended().is_some());
    }

    #[test]
    fn test_single_player_request_completes_immediately() {
        let mut game = GameState::new(
            vec![Team::human(0, "alice"), Team::human(1, "alice")],
            GameSettings { rated: true, ..Default::default() },
        );
        game.start(Vec::new(), ts(0)).unwrap();
        let mut requests = PlayerRequests::new();

        let (outcome, events) = requests.submit(&mut game, "alice", RequestKind::Truce, ts(1_000)).unwrap();
        assert_eq!(outcome, RequestOutcome::Approve);
        assert!(events.iter().any(|e| matches!(e, GameEvent::EndGame(_))));
    }

    #[test]
    fn test_game_end_cancels_pending() {
        let mut game = game(GameSettings { rated: true, ..Default::default() });
        let mut requests = PlayerRequests::new();
        requests.submit(&mut game, "alice", RequestKind::Truce, ts(2_000)).unwrap();

        let events = game.end(EndReason::Victory, Some(1), ts(3_000));
        let follow_up = requests.observe(&game, &events);
        assert!(matches!(&follow_up[0], GameEvent::PlayerRequest(r) if r.status == RequestStatus::Cancelled));
    }

    #[test]
    fn test_request_wire_shape() {
        let request = PlayerRequest {
            kind: RequestKind::Undo,
            status: RequestStatus::Pending,
            created_by: "alice".into(),
            created_at: ts(0),
            accepted: BTreeSet::from(["alice".to_string()]),
            team_id: Some(0),
            rejected_by: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "undo");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["createdBy"], "alice");
        assert_eq!(json["accepted"], serde_json::json!(["alice"]));
    }
}
