//! Game Actors
//!
//! Every live game is owned by one tokio task. Sessions talk to it through
//! a [`GameHandle`]: commands go in over `mpsc`, replies come back over
//! `oneshot`, and every event the game produces is broadcast to the
//! sessions joined to it. A join computes its patch and subscribes to the
//! broadcast inside the actor, so no event can fall between the two.
//!
//! Observers of a rated game in progress see the log two turns late. Each
//! broadcast batch carries their rendition alongside the full one, and an
//! [`EventFeed`] picks the one meant for its session.
//!
//! The actor also owns the turn clock: when the current turn's deadline
//! passes it force-passes the turn.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

use crate::core::error::SyncError;
use crate::core::time::Timestamp;
use crate::game::action::ActionInput;
use crate::game::events::GameEvent;
use crate::game::state::{GameState, PlayerId, TurnLog};
use crate::game::store::GameStore;
use crate::game::turn::TurnId;
use crate::game::{ActionPosition, Game, GameId};
use crate::network::protocol::{CreateGameParams, GameRequest, PlayerRequestReply};
use crate::sync::{compute_patch, compute_reference, delayed_feed, ClientReference, SyncPatch};

/// Capacity of a game's command queue.
const COMMAND_QUEUE: usize = 64;

/// Commits a slow session may fall behind by before it has to rejoin.
const EVENT_BUFFER: usize = 256;

/// Reply to a join: the patch and the live event feed that follows it.
pub type JoinReply = (SyncPatch, EventFeed);

/// One commit as each audience receives it.
#[derive(Debug)]
struct FeedBatch {
    events: Vec<GameEvent>,
    delayed: Option<DelayedBatch>,
}

/// What observers of a rated game receive instead, and who is exempt.
#[derive(Debug)]
struct DelayedBatch {
    events: Vec<GameEvent>,
    participants: BTreeSet<PlayerId>,
}

/// A session's live feed of one game.
#[derive(Debug)]
pub struct EventFeed {
    player: Option<PlayerId>,
    batches: broadcast::Receiver<Arc<FeedBatch>>,
    queued: VecDeque<GameEvent>,
}

impl EventFeed {
    /// Next event meant for this feed's player.
    ///
    /// `Lagged` counts commits, not events.
    pub async fn recv(&mut self) -> Result<GameEvent, RecvError> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Ok(event);
            }
            let batch = self.batches.recv().await?;
            let events = match &batch.delayed {
                Some(delayed) if !self.player.as_ref().is_some_and(|p| delayed.participants.contains(p)) => {
                    &delayed.events
                }
                _ => &batch.events,
            };
            self.queued.extend(events.iter().cloned());
        }
    }
}

/// Command for a game actor.
pub enum GameCommand {
    /// Compute a patch for `reference` and subscribe to events.
    Join {
        /// Authorized player, if any; observers may join.
        player: Option<PlayerId>,
        /// The client's reference.
        reference: Option<ClientReference>,
        /// Reply channel.
        reply: oneshot::Sender<Result<JoinReply, SyncError>>,
    },
    /// Append actions.
    Action {
        /// Acting player.
        player: PlayerId,
        /// Actions to append.
        actions: Vec<ActionInput>,
        /// Where the client believed the log was.
        position: Option<ActionPosition>,
        /// Reply channel.
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    /// Handle a game request.
    Request {
        /// Requesting player.
        player: PlayerId,
        /// The request.
        request: GameRequest,
        /// Reply channel.
        reply: oneshot::Sender<Result<Value, SyncError>>,
    },
}

/// Handle to a running game actor.
#[derive(Clone, Debug)]
pub struct GameHandle {
    id: GameId,
    commands: mpsc::Sender<GameCommand>,
}

impl GameHandle {
    /// Game id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Join the game.
    pub async fn join(
        &self,
        player: Option<PlayerId>,
        reference: Option<ClientReference>,
    ) -> Result<JoinReply, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.call(GameCommand::Join { player, reference, reply }, rx).await
    }

    /// Submit actions.
    pub async fn submit_action(
        &self,
        player: PlayerId,
        actions: Vec<ActionInput>,
        position: Option<ActionPosition>,
    ) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.call(
            GameCommand::Action {
                player,
                actions,
                position,
                reply,
            },
            rx,
        )
        .await
    }

    /// Handle a game request.
    pub async fn request(&self, player: PlayerId, request: GameRequest) -> Result<Value, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.call(GameCommand::Request { player, request, reply }, rx).await
    }

    async fn call<T>(
        &self,
        command: GameCommand,
        rx: oneshot::Receiver<Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::not_found("Game is closed"))?;
        rx.await.map_err(|_| SyncError::not_found("Game is closed"))?
    }
}

// =============================================================================
// ACTOR
// =============================================================================

struct GameActor {
    game: Game,
    store: Arc<dyn GameStore>,
    events: broadcast::Sender<Arc<FeedBatch>>,
    commands: mpsc::Receiver<GameCommand>,
    /// Where the delayed observer feed currently is.
    observer_reference: ClientReference,
    /// Turn whose forced pass failed; its deadline is not retried.
    stalled_turn: Option<TurnId>,
}

impl GameActor {
    fn spawn(game: Game, store: Arc<dyn GameStore>) -> GameHandle {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let handle = GameHandle {
            id: game.id.clone(),
            commands: tx,
        };
        let observer_reference = compute_reference(&*game.log().view_for(None));
        let actor = GameActor {
            game,
            store,
            events,
            commands,
            observer_reference,
            stalled_turn: None,
        };
        tokio::spawn(actor.run());
        handle
    }

    async fn run(mut self) {
        debug!(game_id = %self.game.id, "game actor started");

        loop {
            let deadline = self
                .game
                .turn_deadline()
                .filter(|_| self.stalled_turn != self.game.log().current_turn_id());
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sleep_until(deadline) => self.on_deadline(),
            }
        }

        debug!(game_id = %self.game.id, "game actor stopped");
    }

    fn handle(&mut self, command: GameCommand) {
        match command {
            GameCommand::Join {
                player,
                reference,
                reply,
            } => {
                let patch = compute_patch(&self.game, reference.as_ref(), player.as_deref());
                let feed = EventFeed {
                    player,
                    batches: self.events.subscribe(),
                    queued: VecDeque::new(),
                };
                let _ = reply.send(Ok((patch, feed)));
            }
            GameCommand::Action {
                player,
                actions,
                position,
                reply,
            } => {
                let result = self
                    .game
                    .submit_action(&player, actions, position, Timestamp::now())
                    .map(|events| self.commit(events));
                let _ = reply.send(result);
            }
            GameCommand::Request { player, request, reply } => {
                let result = self.handle_request(&player, request);
                let _ = reply.send(result);
            }
        }
    }

    fn handle_request(&mut self, player: &str, request: GameRequest) -> Result<Value, SyncError> {
        let now = Timestamp::now();
        match request {
            GameRequest::CreateGame(_) => Err(SyncError::protocol("createGame is not addressed to a game")),
            GameRequest::JoinTeam(params) => {
                self.game.join(params.team_id, player)?;
                self.save();
                Ok(Value::Null)
            }
            GameRequest::StartGame(params) => {
                let events = self.game.start(params.units, now)?;
                info!(game_id = %self.game.id, "game started");
                self.commit(events);
                Ok(Value::Null)
            }
            GameRequest::PlayerRequest(params) => {
                let (outcome, events) = self.game.submit_player_request(player, params.kind, now)?;
                self.commit(events);
                Ok(serde_json::to_value(PlayerRequestReply { outcome })?)
            }
            GameRequest::AcceptPlayerRequest(params) => {
                let events = self.game.accept_player_request(player, params.created_at, now)?;
                self.commit(events);
                Ok(Value::Null)
            }
            GameRequest::RejectPlayerRequest(params) => {
                let events = self.game.reject_player_request(player, params.created_at)?;
                self.commit(events);
                Ok(Value::Null)
            }
            GameRequest::CancelPlayerRequest(_) => {
                let events = self.game.cancel_player_request(player)?;
                self.commit(events);
                Ok(Value::Null)
            }
        }
    }

    fn on_deadline(&mut self) {
        match self.game.pass_turn_on_timeout(Timestamp::now()) {
            Ok(events) => {
                debug!(game_id = %self.game.id, "turn passed on timeout");
                self.commit(events);
            }
            Err(e) => {
                warn!(game_id = %self.game.id, "forced pass failed: {}", e);
                self.stalled_turn = self.game.log().current_turn_id();
            }
        }
    }

    /// Persist, then broadcast.
    fn commit(&mut self, events: Vec<GameEvent>) {
        if events.is_empty() {
            return;
        }
        self.save();
        let delayed = self.delayed_batch(&events);
        // No joined session is fine.
        let _ = self.events.send(Arc::new(FeedBatch { events, delayed }));
    }

    /// Observer rendition of `events`: request and start events as they are,
    /// turn events replaced by the catch-up of the delayed view.
    fn delayed_batch(&mut self, events: &[GameEvent]) -> Option<DelayedBatch> {
        let log = self.game.log();
        if !log.settings().rated {
            return None;
        }
        let (catch_up, reference) = delayed_feed(log, &self.observer_reference);
        let participants = log.players().into_iter().map(str::to_string).collect();

        let mut delayed = Vec::with_capacity(events.len());
        let mut catch_up = Some(catch_up);
        for event in events {
            match event {
                GameEvent::StartGame(_) | GameEvent::PlayerRequest(_) => delayed.push(event.clone()),
                _ => delayed.extend(catch_up.take().into_iter().flatten()),
            }
        }
        delayed.extend(catch_up.into_iter().flatten());

        self.observer_reference = reference;
        Some(DelayedBatch {
            events: delayed,
            participants,
        })
    }

    fn save(&self) {
        if let Err(e) = self.store.save(&self.game) {
            error!(game_id = %self.game.id, "failed to save game: {}", e);
        }
    }
}

async fn sleep_until(deadline: Option<Timestamp>) {
    match deadline {
        Some(deadline) => {
            let wait = deadline.millis_since(Timestamp::now()).max(0);
            tokio::time::sleep(Duration::from_millis(wait as u64)).await;
        }
        None => std::future::pending().await,
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Live game actors by id, loaded from the store on first use.
pub struct GameRegistry {
    store: Arc<dyn GameStore>,
    games: RwLock<BTreeMap<GameId, GameHandle>>,
}

impl GameRegistry {
    /// Registry over `store`.
    pub fn new(store: Arc<dyn GameStore>) -> Self {
        Self {
            store,
            games: RwLock::new(BTreeMap::new()),
        }
    }

    /// Handle to a game, starting its actor if needed.
    pub async fn get(&self, id: &str) -> Result<GameHandle, SyncError> {
        if let Some(handle) = self.games.read().await.get(id) {
            return Ok(handle.clone());
        }

        let mut games = self.games.write().await;
        if let Some(handle) = games.get(id) {
            return Ok(handle.clone());
        }
        let game = self
            .store
            .load(id)
            .map_err(|e| {
                error!(game_id = id, "failed to load game: {}", e);
                SyncError::not_found("Game is unavailable")
            })?
            .ok_or_else(|| SyncError::not_found("No such game"))?;

        let handle = GameActor::spawn(game, self.store.clone());
        games.insert(id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Create a game and start its actor.
    pub async fn create(&self, params: CreateGameParams) -> Result<GameId, SyncError> {
        if params.teams.len() < 2 {
            return Err(SyncError::protocol("A game needs at least two teams"));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let game = Game::new(id.clone(), GameState::new(params.teams, params.settings));
        self.store.save(&game).map_err(|e| {
            error!(game_id = %id, "failed to save game: {}", e);
            SyncError::conflict("Game could not be created")
        })?;

        let handle = GameActor::spawn(game, self.store.clone());
        self.games.write().await.insert(id.clone(), handle);
        info!(game_id = %id, "game created");
        Ok(id)
    }

    /// Number of live actors.
    pub async fn len(&self) -> usize {
        self.games.read().await.len()
    }

    /// Whether no actor is live.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientMirror;
    use crate::game::action::ActionKind;
    use crate::game::request::{RequestKind, RequestOutcome};
    use crate::game::state::{GameSettings, Team};
    use crate::game::store::MemoryGameStore;
    use crate::network::protocol::{JoinTeamParams, PlayerRequestParams, StartGameParams};

    fn registry() -> (GameRegistry, Arc<MemoryGameStore>) {
        let store = Arc::new(MemoryGameStore::new());
        (GameRegistry::new(store.clone()), store)
    }

    async fn started(registry: &GameRegistry, settings: GameSettings) -> GameHandle {
        let id = registry
            .create(CreateGameParams {
                teams: vec![Team::human(0, "alice"), Team::human(1, "bob")],
                settings,
            })
            .await
            .unwrap();
        let handle = registry.get(&id).await.unwrap();
        handle
            .request(
                "alice".into(),
                GameRequest::StartGame(StartGameParams {
                    game_id: id.clone(),
                    units: Vec::new(),
                }),
            )
            .await
            .unwrap();
        handle
    }

    #[tokio::test]
    async fn test_create_and_unknown_game() {
        let (registry, store) = registry();
        let err = registry.get("missing").await.unwrap_err();
        assert_eq!(err.code(), 404);

        let handle = started(&registry, GameSettings::default()).await;
        assert_eq!(store.len(), 1);
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(handle.id()).await.is_ok());
    }

    #[tokio::test]
    async fn test_join_then_events_follow_patch() {
        let (registry, _) = registry();
        let handle = started(&registry, GameSettings::default()).await;

        let (patch, mut events) = handle.join(Some("alice".into()), None).await.unwrap();
        assert!(patch.state.is_some());

        handle
            .submit_action("alice".into(), vec![ActionInput::of(ActionKind::EndTurn)], None)
            .await
            .unwrap();

        assert!(matches!(events.recv().await.unwrap(), GameEvent::Action(_)));
        assert!(matches!(events.recv().await.unwrap(), GameEvent::StartTurn(h) if h.turn_id == 1));
    }

    #[tokio::test]
    async fn test_rated_observer_feed_lags_two_turns() {
        let (registry, _) = registry();
        let handle = started(&registry, GameSettings { rated: true, ..Default::default() }).await;
        let (patch, mut watcher) = handle.join(None, None).await.unwrap();
        let (_, mut alice) = handle.join(Some("alice".into()), None).await.unwrap();

        for player in ["alice", "bob", "alice"] {
            handle
                .submit_action(player.into(), vec![ActionInput::of(ActionKind::EndTurn)], None)
                .await
                .unwrap();
        }
        handle
            .submit_action("bob".into(), vec![ActionInput::of(ActionKind::Select)], None)
            .await
            .unwrap();

        let mut starts = Vec::new();
        while starts.len() < 3 {
            if let GameEvent::StartTurn(header) = alice.recv().await.unwrap() {
                starts.push(header.turn_id);
            }
        }
        assert_eq!(starts, vec![1, 2, 3]);

        let mut mirror = ClientMirror::new();
        mirror.apply_patch(&patch).unwrap();
        let mut seen = Vec::new();
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(100), watcher.recv()).await {
            mirror.apply_event(&event).unwrap();
            seen.push(event.name());
        }
        assert_eq!(seen, vec!["action", "startTurn", "action"]);
        assert_eq!(mirror.current_turn().map(|t| t.id), Some(1));
    }

    #[tokio::test]
    async fn test_request_flow_through_actor() {
        let (registry, _) = registry();
        let handle = started(&registry, GameSettings { rated: true, ..Default::default() }).await;
        let id = handle.id().to_string();

        let reply = handle
            .request(
                "alice".into(),
                GameRequest::PlayerRequest(PlayerRequestParams {
                    game_id: id.clone(),
                    kind: RequestKind::Truce,
                }),
            )
            .await
            .unwrap();
        let reply: PlayerRequestReply = serde_json::from_value(reply).unwrap();
        assert_eq!(reply.outcome, RequestOutcome::NeedsApproval);

        let err = handle
            .request(
                "bob".into(),
                GameRequest::JoinTeam(JoinTeamParams { game_id: id, team_id: 1 }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), 409);
    }

    #[tokio::test]
    async fn test_turn_deadline_forces_pass() {
        let (registry, store) = registry();
        let handle = started(
            &registry,
            GameSettings {
                turn_time_limit: Some(1),
                ..Default::default()
            },
        )
        .await;
        let (_, mut events) = handle.join(None, None).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            GameEvent::Action(batch) => assert!(batch.actions[0].forced),
            other => panic!("unexpected event {other:?}"),
        }
        let saved = store.load(handle.id()).unwrap().unwrap();
        assert!(saved.log().turns().len() >= 2);
    }
}
