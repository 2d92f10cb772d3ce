//! Reconciliation Engine
//!
//! [`compute_patch`] turns a client's reference into the smallest patch that
//! brings its mirror to the server's current position. Paths, cheapest first:
//!
//! 1. reference equals the current one: empty patch
//! 2. same turn: the differing action suffix, or a replacement list
//! 3. a few turns behind: one `startTurn` per missed turn plus its actions
//! 4. no reference or `creation`: full or start-of-game state
//! 5. too far behind, or on a turn that no longer exists: coarse fields
//!    only, and the client rejoins from scratch
//!
//! The log is filtered for the requesting player before any of this runs, so
//! observers of rated games never see more than `view_for` allows.
//! [`delayed_feed`] applies the same diff to the live feed those observers
//! receive.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;
use crate::game::action::{Action, TeamId, Unit};
use crate::game::events::{ActionBatch, EndReason, GameEnd, GameEvent};
use crate::game::request::PlayerRequest;
use crate::game::state::{GameSettings, Team, TurnLog};
use crate::game::turn::{DrawCounts, Turn, TurnId};
use crate::game::undo::undo_window;
use crate::game::Game;
use crate::sync::reference::{compute_reference, ClientReference, Reference};

/// Clients more than this many turns behind get a coarse patch.
pub const MAX_TURN_DIFF: TurnId = 10;

/// State fields of a patch. Every field is optional; absent means unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchState {
    /// Teams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teams: Option<Vec<Team>>,
    /// Game options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<GameSettings>,
    /// Game start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// Current turn id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<TurnId>,
    /// Current team.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
    /// Current turn start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_started_at: Option<Timestamp>,
    /// Current turn time limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_time_limit: Option<u32>,
    /// Units at the start of the current turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<Vec<Unit>>,
    /// Draw counters at the start of the current turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draw_counts: Option<DrawCounts>,
    /// Replacement actions for the current turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Action>>,
    /// Index `actions` replaces from; absent means the whole list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions_from: Option<usize>,
    /// Game end time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<Timestamp>,
    /// Winning team.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<TeamId>,
    /// Why the game ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    /// Pending request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_request: Option<PlayerRequest>,
}

impl PatchState {
    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        *self == PatchState::default()
    }

    /// Whether this replaces the whole mirror.
    pub fn is_snapshot(&self) -> bool {
        self.teams.is_some()
    }

    /// End data, when the patch carries it.
    pub fn game_end(&self) -> Option<GameEnd> {
        Some(GameEnd {
            ended_at: self.ended_at?,
            winner_id: self.winner_id,
            reason: self.end_reason.unwrap_or(EndReason::Victory),
        })
    }

    /// The current turn described by the snapshot fields.
    pub fn current_turn(&self) -> Option<Turn> {
        Some(Turn {
            id: self.turn_id?,
            team_id: self.team_id?,
            started_at: self.turn_started_at?,
            units: self.units.clone().unwrap_or_default(),
            actions: self.actions.clone().unwrap_or_default(),
            time_limit: self.turn_time_limit,
            draw_counts: self.draw_counts,
        })
    }

    fn set_end(&mut self, end: Option<&GameEnd>) {
        if let Some(end) = end {
            self.ended_at = Some(end.ended_at);
            self.winner_id = end.winner_id;
            self.end_reason = Some(end.reason);
        }
    }
}

/// Everything a client needs to move from its reference to `reference`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPatch {
    /// Changed state fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PatchState>,
    /// Events to apply after `state`, in order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<GameEvent>>,
    /// The reference the client holds once the patch is applied.
    pub reference: ClientReference,
    /// Turns preceding the current one, oldest first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_turns: Option<Vec<Turn>>,
}

impl SyncPatch {
    fn new(reference: ClientReference, state: PatchState, events: Vec<GameEvent>) -> Self {
        Self {
            state: (!state.is_empty()).then_some(state),
            events: (!events.is_empty()).then_some(events),
            reference,
            recent_turns: None,
        }
    }

    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.events.is_none() && self.recent_turns.is_none()
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Compute the patch for `player` (or an anonymous observer) holding `reference`.
pub fn compute_patch<L>(game: &Game<L>, reference: Option<&ClientReference>, player: Option<&str>) -> SyncPatch
where
    L: TurnLog + Clone,
{
    let view = game.log().view_for(player);
    let log = &*view;
    let request = game.player_request();
    let current = compute_reference(log);

    match reference {
        None => full_patch(log, request, current),
        Some(r) if *r == current => SyncPatch::new(current, PatchState::default(), Vec::new()),
        Some(ClientReference::Creation) => creation_patch(log, request, current),
        Some(ClientReference::Position(r)) => diff_patch(log, request, r, current),
    }
}

fn current_turn_state<L: TurnLog>(log: &L, state: &mut PatchState) {
    if let Some(turn) = log.current_turn() {
        state.turn_id = Some(turn.id);
        state.team_id = Some(turn.team_id);
        state.turn_started_at = Some(turn.started_at);
        state.turn_time_limit = turn.time_limit;
        state.units = Some(turn.units.clone());
        state.draw_counts = turn.draw_counts;
        state.actions = Some(turn.actions.clone());
    }
}

fn recent_turns<L: TurnLog>(log: &L) -> Option<Vec<Turn>> {
    let window = log.recent_turns(undo_window(log.teams().len()));
    let previous = &window[..window.len().saturating_sub(1)];
    (!previous.is_empty()).then(|| previous.to_vec())
}

fn full_patch<L: TurnLog>(log: &L, request: Option<&PlayerRequest>, current: ClientReference) -> SyncPatch {
    let mut state = PatchState {
        teams: Some(log.teams().to_vec()),
        settings: Some(log.settings().clone()),
        started_at: log.started_at(),
        player_request: request.cloned(),
        ..Default::default()
    };
    current_turn_state(log, &mut state);
    state.set_end(log.ended());

    let mut patch = SyncPatch::new(current, state, Vec::new());
    patch.recent_turns = recent_turns(log);
    patch
}

fn creation_patch<L: TurnLog>(log: &L, request: Option<&PlayerRequest>, current: ClientReference) -> SyncPatch {
    // The client saw the lobby, so only what changed at start is sent.
    let mut state = PatchState {
        teams: Some(log.teams().to_vec()),
        started_at: log.started_at(),
        player_request: request.cloned(),
        ..Default::default()
    };
    current_turn_state(log, &mut state);
    state.set_end(log.ended());

    let mut patch = SyncPatch::new(current, state, Vec::new());
    patch.recent_turns = recent_turns(log);
    patch
}

fn coarse_patch<L: TurnLog>(log: &L, current: ClientReference) -> SyncPatch {
    let mut state = PatchState {
        turn_time_limit: log.current_turn().and_then(|t| t.time_limit),
        ..Default::default()
    };
    state.set_end(log.ended());
    SyncPatch::new(current, state, Vec::new())
}

/// Index of the first position where the two lists differ.
fn divergence(client: &[Timestamp], server: &[Timestamp]) -> usize {
    client
        .iter()
        .zip(server)
        .take_while(|(a, b)| a == b)
        .count()
}

fn diff_patch<L: TurnLog>(
    log: &L,
    request: Option<&PlayerRequest>,
    remembered: &Reference,
    current: ClientReference,
) -> SyncPatch {
    let Some(turn) = log.current_turn() else {
        return coarse_patch(log, current);
    };
    // An undo may have removed the client's turn altogether.
    let Some(old) = log.turn(remembered.turn_id).filter(|_| remembered.turn_id <= turn.id) else {
        return coarse_patch(log, current);
    };
    if turn.id - remembered.turn_id > MAX_TURN_DIFF {
        return coarse_patch(log, current);
    }

    let mut state = PatchState {
        player_request: request.cloned(),
        ..Default::default()
    };
    let mut events = Vec::new();

    if remembered.turn_id < turn.id {
        catch_up_turn(old, remembered, &mut events);
        start_turns(log, remembered.turn_id + 1..=turn.id, &mut events);
    } else if remembered.turn_started_at != turn.started_at {
        events.push(GameEvent::Revert(turn.clone()));
    } else {
        if remembered.turn_time_limit != turn.time_limit {
            state.turn_time_limit = turn.time_limit;
        }

        let server = turn.action_timestamps();
        let d = divergence(&remembered.actions, &server);
        if d == remembered.actions.len() {
            if d < server.len() {
                events.push(GameEvent::Action(ActionBatch {
                    turn_id: turn.id,
                    actions: turn.actions[d..].to_vec(),
                }));
            }
        } else {
            // The client holds actions the server does not.
            state.actions = Some(turn.actions[d..].to_vec());
            state.actions_from = (d > 0).then_some(d);
        }
    }

    push_end(log, remembered.ended_at, &mut events);
    SyncPatch::new(current, state, events)
}

/// One `startTurn` per turn in `ids`, each followed by its actions.
fn start_turns<L: TurnLog>(log: &L, ids: RangeInclusive<TurnId>, events: &mut Vec<GameEvent>) {
    for id in ids {
        let Some(turn) = log.turn(id) else { continue };
        events.push(GameEvent::StartTurn(turn.header()));
        if !turn.actions.is_empty() {
            events.push(GameEvent::Action(ActionBatch {
                turn_id: turn.id,
                actions: turn.actions.clone(),
            }));
        }
    }
}

fn push_end<L: TurnLog>(log: &L, known: Option<Timestamp>, events: &mut Vec<GameEvent>) {
    if let Some(end) = log.ended() {
        if known != Some(end.ended_at) {
            events.push(GameEvent::EndGame(*end));
        }
    }
}

/// Events bringing the client's remembered turn to its final server form.
fn catch_up_turn(old: &Turn, remembered: &Reference, events: &mut Vec<GameEvent>) {
    let server = old.action_timestamps();
    let prefix = remembered.turn_started_at == old.started_at
        && divergence(&remembered.actions, &server) == remembered.actions.len();

    if !prefix {
        events.push(GameEvent::Revert(old.clone()));
    } else if remembered.actions.len() < server.len() {
        events.push(GameEvent::Action(ActionBatch {
            turn_id: old.id,
            actions: old.actions[remembered.actions.len()..].to_vec(),
        }));
    }
}

// =============================================================================
// DELAYED FEED
// =============================================================================

/// Events moving a live observer feed from `since` to what `view_for(None)`
/// shows now, and the reference the feed holds afterwards.
///
/// There is no coarse fallback here: a view rewound by an undo is carried by
/// a `revert` of its current turn.
pub fn delayed_feed<L>(log: &L, since: &ClientReference) -> (Vec<GameEvent>, ClientReference)
where
    L: TurnLog + Clone,
{
    let view = log.view_for(None);
    let log = &*view;
    let current = compute_reference(log);
    let mut events = Vec::new();
    if *since == current {
        return (events, current);
    }

    let known_end = match since {
        ClientReference::Creation => None,
        ClientReference::Position(r) => r.ended_at,
    };
    if let Some(turn) = log.current_turn() {
        match since {
            ClientReference::Creation => start_turns(log, 0..=turn.id, &mut events),
            ClientReference::Position(r) => match log.turn(r.turn_id).filter(|_| r.turn_id <= turn.id) {
                None => events.push(GameEvent::Revert(turn.clone())),
                Some(old) => {
                    catch_up_turn(old, r, &mut events);
                    start_turns(log, r.turn_id + 1..=turn.id, &mut events);
                }
            },
        }
    }
    push_end(log, known_end, &mut events);

    (events, current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::action::{ActionInput, ActionKind};
    use crate::game::state::GameState;
    use crate::game::RequestKind;

    fn ts(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn game(settings: GameSettings) -> Game {
        let mut game = Game::new(
            "g1",
            GameState::new(vec![Team::human(0, "alice"), Team::human(1, "bob")], settings),
        );
        game.start(Vec::new(), ts(1_000)).unwrap();
        game
    }

    fn act(game: &mut Game, player: &str, kind: ActionKind, at: i64) {
        game.submit_action(player, vec![ActionInput::of(kind)], None, ts(at))
            .unwrap();
    }

    fn position(game: &Game) -> Reference {
        match compute_reference(game.log()) {
            ClientReference::Position(r) => r,
            ClientReference::Creation => panic!("game not started"),
        }
    }

    fn event_names(patch: &SyncPatch) -> Vec<&'static str> {
        patch
            .events
            .iter()
            .flatten()
            .map(GameEvent::name)
            .collect()
    }

    #[test]
    fn test_equal_reference_is_empty_and_idempotent() {
        let mut game = game(GameSettings::default());
        act(&mut game, "alice", ActionKind::Select, 2_000);
        let reference = compute_reference(game.log());

        let first = compute_patch(&game, Some(&reference), Some("alice"));
        let second = compute_patch(&game, Some(&reference), Some("alice"));
        assert!(first.is_empty());
        assert_eq!(first, second);
        assert_eq!(first.reference, reference);
    }

    #[test]
    fn test_same_turn_suffix() {
        let mut game = game(GameSettings::default());
        act(&mut game, "alice", ActionKind::Select, 2_000);
        let before = compute_reference(game.log());
        act(&mut game, "alice", ActionKind::Move { target: [1, 0] }, 3_000);

        let patch = compute_patch(&game, Some(&before), Some("alice"));
        assert!(patch.state.is_none());
        let events = patch.events.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], GameEvent::Action(b) if b.actions.len() == 1 && b.turn_id == 0));
    }

    #[test]
    fn test_divergent_actions_replace_list() {
        let mut game = game(GameSettings::default());
        act(&mut game, "alice", ActionKind::Select, 2_000);

        let mut client = position(&game);
        client.actions = vec![ts(1_999)];
        let patch = compute_patch(&game, Some(&ClientReference::Position(client)), Some("alice"));
        let state = patch.state.unwrap();
        assert_eq!(state.actions.map(|a| a.len()), Some(1));
        assert_eq!(state.actions_from, None);
        assert!(patch.events.is_none());
    }

    #[test]
    fn test_late_divergence_sends_only_the_suffix() {
        let mut game = game(GameSettings::default());
        for at in [2_000, 3_000, 4_000, 5_000] {
            act(&mut game, "alice", ActionKind::Select, at);
        }

        // Client holds [a, b, x]; server has [a, b, c, d].
        let mut client = position(&game);
        client.actions = vec![ts(2_000), ts(3_000), ts(3_500)];
        let patch = compute_patch(&game, Some(&ClientReference::Position(client)), Some("alice"));

        let state = patch.state.unwrap();
        assert_eq!(state.actions_from, Some(2));
        let sent: Vec<_> = state.actions.unwrap().iter().map(|a| a.created_at).collect();
        assert_eq!(sent, vec![ts(4_000), ts(5_000)]);
        assert!(patch.events.is_none());
    }

    #[test]
    fn test_two_turns_behind() {
        let mut game = game(GameSettings::default());
        let before = compute_reference(game.log());
        act(&mut game, "alice", ActionKind::EndTurn, 2_000);
        act(&mut game, "bob", ActionKind::Select, 3_000);
        act(&mut game, "bob", ActionKind::EndTurn, 4_000);

        let patch = compute_patch(&game, Some(&before), Some("alice"));
        assert_eq!(event_names(&patch), vec!["action", "startTurn", "action", "startTurn"]);
        assert_eq!(patch.reference, compute_reference(game.log()));
    }

    #[test]
    fn test_far_behind_is_coarse() {
        let mut game = game(GameSettings { turn_time_limit: Some(60), ..Default::default() });
        let before = compute_reference(game.log());
        for i in 0..12 {
            let player = if i % 2 == 0 { "alice" } else { "bob" };
            act(&mut game, player, ActionKind::EndTurn, 2_000 + i);
        }

        let patch = compute_patch(&game, Some(&before), Some("alice"));
        assert!(patch.events.is_none());
        assert_eq!(patch.state.and_then(|s| s.turn_time_limit), Some(60));
    }

    #[test]
    fn test_turn_removed_by_undo_is_coarse() {
        let mut game = game(GameSettings { turn_time_limit: Some(60), ..Default::default() });
        act(&mut game, "alice", ActionKind::EndTurn, 2_000);
        let client = compute_reference(game.log());

        game.submit_player_request("alice", RequestKind::Undo, ts(3_000)).unwrap();
        assert_eq!(game.log().current_turn_id(), Some(0));

        let patch = compute_patch(&game, Some(&client), Some("bob"));
        assert!(patch.events.is_none());
        let state = patch.state.unwrap();
        assert_eq!(state.turn_time_limit, Some(60));
        assert!(state.actions.is_none());
    }

    #[test]
    fn test_rewritten_turn_is_reverted() {
        let mut game = game(GameSettings::default());
        act(&mut game, "alice", ActionKind::Select, 1_500);
        let client = compute_reference(game.log());
        act(&mut game, "alice", ActionKind::EndTurn, 2_000);

        // Turn 0 is reopened with a fresh clock, then played again.
        game.submit_player_request("alice", RequestKind::Undo, ts(3_000)).unwrap();
        act(&mut game, "alice", ActionKind::EndTurn, 4_000);
        act(&mut game, "bob", ActionKind::Select, 5_000);

        let patch = compute_patch(&game, Some(&client), Some("bob"));
        assert_eq!(event_names(&patch), vec!["revert", "startTurn", "action"]);
    }

    #[test]
    fn test_draw_counts_ride_with_the_snapshot() {
        let mut game = game(GameSettings::default());
        act(&mut game, "alice", ActionKind::EndTurn, 2_000);

        let state = compute_patch(&game, None, Some("alice")).state.unwrap();
        assert!(state.draw_counts.is_some());
        assert_eq!(state.current_turn().as_ref(), game.log().current_turn());
    }

    #[test]
    fn test_delayed_feed_holds_back_hidden_turns() {
        let mut game = game(GameSettings { rated: true, ..Default::default() });
        let mut since = compute_reference(&*game.log().view_for(None));

        let mut names = Vec::new();
        for (i, player) in ["alice", "bob", "alice"].into_iter().enumerate() {
            act(&mut game, player, ActionKind::EndTurn, 2_000 + i as i64 * 1_000);
            let (events, reference) = delayed_feed(game.log(), &since);
            names.push(events.iter().map(GameEvent::name).collect::<Vec<_>>());
            since = reference;
        }

        // A turn is revealed once two more have started after it.
        assert_eq!(names, vec![vec!["action"], vec![], vec!["startTurn", "action"]]);
        assert_eq!(since, compute_reference(&*game.log().view_for(None)));

        // Play hidden from observers produces nothing.
        act(&mut game, "bob", ActionKind::Select, 6_000);
        let (events, _) = delayed_feed(game.log(), &since);
        assert!(events.is_empty());

        // The end reveals everything at once.
        act(&mut game, "bob", ActionKind::Surrender, 7_000);
        let (events, reference) = delayed_feed(game.log(), &since);
        assert_eq!(
            events.iter().map(GameEvent::name).collect::<Vec<_>>(),
            vec!["startTurn", "action", "startTurn", "action", "endGame"]
        );
        assert_eq!(reference, compute_reference(game.log()));
    }

    #[test]
    fn test_full_and_creation_paths() {
        let mut game = game(GameSettings { rated: true, ..Default::default() });
        act(&mut game, "alice", ActionKind::EndTurn, 2_000);
        game.submit_player_request("bob", RequestKind::Truce, ts(2_500)).unwrap();

        let full = compute_patch(&game, None, Some("alice"));
        let state = full.state.clone().unwrap();
        assert!(state.settings.is_some());
        assert_eq!(state.turn_id, Some(1));
        assert!(state.player_request.is_some());
        assert_eq!(full.recent_turns.as_ref().map(Vec::len), Some(1));

        let creation = compute_patch(&game, Some(&ClientReference::Creation), Some("alice"));
        let state = creation.state.unwrap();
        assert!(state.settings.is_none());
        assert_eq!(state.started_at, Some(ts(1_000)));
    }

    #[test]
    fn test_unstarted_game_reference_is_creation() {
        let game: Game = Game::new(
            "lobby",
            GameState::new(vec![Team::human(0, "alice"), Team::human(1, "bob")], GameSettings::default()),
        );
        let patch = compute_patch(&game, None, None);
        assert_eq!(patch.reference, ClientReference::Creation);
        assert!(compute_patch(&game, Some(&ClientReference::Creation), None).is_empty());
    }

    #[test]
    fn test_end_game_is_an_event() {
        let mut game = game(GameSettings::default());
        let before = compute_reference(game.log());
        act(&mut game, "alice", ActionKind::Surrender, 2_000);

        let patch = compute_patch(&game, Some(&before), Some("bob"));
        assert_eq!(event_names(&patch), vec!["action", "endGame"]);
    }
}
