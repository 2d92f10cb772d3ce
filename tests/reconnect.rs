// Reconnect convergence through the public engine API.
//
// A client drops while an action is unacknowledged, the match moves on
// without it, and it rejoins with the reference its mirror holds. These
// tests drive the server-side game and the client mirror directly, the way
// the game actor and GameClient do over a live connection.

use tactics_sync::client::ClientMirror;
use tactics_sync::game::{ActionInput, ActionKind, ActionPosition, Game, GameSettings, GameState, Team, TurnLog};
use tactics_sync::{compute_patch, compute_reference, GameEvent, Timestamp};

fn ts(ms: i64) -> Timestamp {
    Timestamp::from_millis(ms)
}

fn new_game() -> Game {
    let mut game = Game::new(
        "reconnect",
        GameState::new(vec![Team::human(0, "alice"), Team::human(1, "bob")], GameSettings::default()),
    );
    game.start(Vec::new(), ts(0)).unwrap();
    game
}

fn joined(game: &Game, player: &str) -> ClientMirror {
    let mut mirror = ClientMirror::new();
    mirror.apply_patch(&compute_patch(game, None, Some(player))).unwrap();
    mirror
}

fn one(kind: ActionKind) -> Vec<ActionInput> {
    vec![ActionInput::of(kind)]
}

fn start_turns(events: &[GameEvent]) -> usize {
    events.iter().filter(|e| matches!(e, GameEvent::StartTurn(_))).count()
}

/// The unacked action reached the server before the drop: the rejoin patch
/// carries it, and resending it changes nothing.
#[test]
fn applied_action_is_not_duplicated_on_resend() {
    let mut game = new_game();
    let mut alice = joined(&game, "alice");
    let sent_at = alice.position().unwrap();

    // Alice's end of turn lands, then bob plays his whole turn.
    game.submit_action("alice", one(ActionKind::EndTurn), Some(sent_at), ts(1_000)).unwrap();
    game.submit_action("bob", one(ActionKind::Select), None, ts(2_000)).unwrap();
    game.submit_action("bob", one(ActionKind::EndTurn), None, ts(3_000)).unwrap();

    let patch = compute_patch(&game, Some(&alice.reference()), Some("alice"));
    let events = patch.events.clone().unwrap_or_default();
    assert_eq!(start_turns(&events), 2);
    assert!(events.iter().any(|e| matches!(e, GameEvent::Action(_))));

    alice.apply_patch(&patch).unwrap();
    assert_eq!(alice.reference(), compute_reference(game.log()));

    // The mirror moved past the outbox entry, so it is not resent. Even if it
    // were, the position check refuses it.
    assert!(!alice.is_at(sent_at));
    let resent = game.submit_action("alice", one(ActionKind::EndTurn), Some(sent_at), ts(4_000));
    assert_eq!(resent.unwrap_err().code(), 409);
    assert_eq!(game.log().current_turn_id(), Some(2));
    assert!(game.log().actions().is_empty());
}

/// The unacked action never arrived: the mirror is still where it was
/// built, so the resend goes through exactly once.
#[test]
fn lost_action_is_applied_once_on_resend() {
    let mut game = new_game();
    let mut alice = joined(&game, "alice");
    let mut bob = joined(&game, "bob");
    let sent_at = alice.position().unwrap();

    let patch = compute_patch(&game, Some(&alice.reference()), Some("alice"));
    assert!(patch.is_empty());
    alice.apply_patch(&patch).unwrap();
    assert!(alice.is_at(sent_at));

    let events = game
        .submit_action("alice", one(ActionKind::Select), Some(sent_at), ts(1_000))
        .unwrap();
    let again = game.submit_action("alice", one(ActionKind::Select), Some(sent_at), ts(1_001));
    assert!(again.is_err());
    assert_eq!(game.log().actions().len(), 1);

    for event in &events {
        alice.apply_event(event).unwrap();
        bob.apply_event(event).unwrap();
    }
    assert_eq!(alice.reference(), compute_reference(game.log()));
    assert_eq!(bob.turns(), alice.turns());
    assert_eq!(
        alice.position(),
        Some(ActionPosition {
            turn_id: 0,
            action_count: 1
        })
    );
}

/// A rejoin far behind gets only coarse fields; the mirror asks for a full
/// snapshot and converges from it.
#[test]
fn far_behind_rejoin_falls_back_to_snapshot() {
    let mut game = new_game();
    let mut bob = joined(&game, "bob");
    let stale = bob.reference();

    for i in 0..12 {
        let player = if i % 2 == 0 { "alice" } else { "bob" };
        game.submit_action(player, one(ActionKind::EndTurn), None, ts(1_000 * (i + 1)))
            .unwrap();
    }

    let coarse = compute_patch(&game, Some(&stale), Some("bob"));
    assert!(bob.apply_patch(&coarse).is_err());

    let mut fresh = ClientMirror::new();
    fresh.apply_patch(&compute_patch(&game, None, Some("bob"))).unwrap();
    assert_eq!(fresh.reference(), compute_reference(game.log()));
    assert_eq!(fresh.current_turn().map(|t| t.id), Some(12));
}
