//! Game Client
//!
//! Binds a transport to a [`ClientMirror`] for one game: joins, applies the
//! event stream, submits actions and player requests, and recovers when the
//! connection comes back.
//!
//! Recovery:
//! - resume: nothing to do, the transport resends its outbox and the
//!   server's event feed continues;
//! - reset: rejoin from the mirror's reference, then resend an unacked
//!   action only if the mirror shows it was never applied;
//! - mirror out of step (or a lagging feed): rejoin for a fresh snapshot.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::client::mirror::ClientMirror;
use crate::client::transport::{RequestFlags, SessionTransport, TransportEvent, WeakTransport};
use crate::core::emitter::{Emitter, ListenerId};
use crate::core::error::SyncError;
use crate::game::action::{ActionInput, TeamId, Unit};
use crate::game::events::GameEvent;
use crate::game::request::{RequestKind, RequestOutcome};
use crate::game::state::{GameSettings, Team};
use crate::game::undo::UndoPointer;
use crate::game::GameId;
use crate::network::protocol::{
    ActionBody, CreateGameParams, CreatedGame, Envelope, GameRef, GameRequest, JoinBody, JoinTeamParams,
    MessageType, PlayerRequestParams, PlayerRequestReply, RequestRef, StartGameParams,
};
use crate::sync::{ClientReference, SyncPatch};

/// What a [`GameClient`] announces.
#[derive(Clone, Debug)]
pub enum GameUpdate {
    /// An event was applied to the mirror.
    Event(GameEvent),
    /// A join response was applied; the mirror matches the server.
    Synced,
    /// The server refused a submitted action.
    ActionRejected(SyncError),
}

struct MirrorState {
    mirror: ClientMirror,
    /// A snapshot has been applied at least once.
    synced: bool,
    /// A join is in flight; its patch covers every event until the response.
    joining: bool,
}

struct GameInner {
    game_id: GameId,
    transport: WeakTransport,
    state: Mutex<MirrorState>,
    updates: Emitter<GameUpdate>,
}

type JoinDone = oneshot::Sender<Result<(), SyncError>>;

/// One joined game.
pub struct GameClient {
    inner: Arc<GameInner>,
    transport: SessionTransport,
    listener: ListenerId,
}

impl GameClient {
    /// Create a game on the server. The session must be authorized.
    pub async fn create_game(
        transport: &SessionTransport,
        teams: Vec<Team>,
        settings: GameSettings,
    ) -> Result<GameId, SyncError> {
        let request = GameRequest::CreateGame(CreateGameParams { teams, settings });
        let created: CreatedGame = call(transport, &request).await?;
        Ok(created.game_id)
    }

    /// Join `game_id` and wait for the first snapshot.
    pub async fn join(transport: &SessionTransport, game_id: impl Into<GameId>) -> Result<Self, SyncError> {
        let inner = Arc::new(GameInner {
            game_id: game_id.into(),
            transport: transport.downgrade(),
            state: Mutex::new(MirrorState {
                mirror: ClientMirror::new(),
                synced: false,
                joining: false,
            }),
            updates: Emitter::new(),
        });

        let weak = Arc::downgrade(&inner);
        let listener = transport.events().on(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_transport_event(event);
            }
        });
        let client = Self {
            inner,
            transport: transport.clone(),
            listener,
        };

        let (done, joined) = oneshot::channel();
        client.inner.rejoin(None, Vec::new(), Some(done))?;
        joined.await.unwrap_or(Err(SyncError::ConnectionReset))?;
        Ok(client)
    }

    /// Game id.
    pub fn game_id(&self) -> &str {
        &self.inner.game_id
    }

    /// Listener registry.
    pub fn updates(&self) -> &Emitter<GameUpdate> {
        &self.inner.updates
    }

    /// Copy of the mirror.
    pub fn mirror(&self) -> ClientMirror {
        self.inner.lock().mirror.clone()
    }

    /// Whether the mirror is caught up and no join is in flight.
    pub fn is_synced(&self) -> bool {
        let state = self.inner.lock();
        state.synced && !state.joining
    }

    /// Whether `player` may undo now.
    pub fn can_undo(&self, player: &str) -> bool {
        self.undo_pointer(player).is_some()
    }

    /// Where an undo by `player` would rewind to.
    pub fn undo_pointer(&self, player: &str) -> Option<UndoPointer> {
        let now = self.transport.server_time();
        let state = self.inner.lock();
        let team = state.mirror.team_of(player)?;
        state.mirror.undo_pointer(team, now)
    }

    // -------------------------------------------------------------------------
    // COMMANDS
    // -------------------------------------------------------------------------

    /// Submit actions for the current turn.
    ///
    /// The result arrives as events; a refusal as
    /// [`GameUpdate::ActionRejected`].
    pub fn submit_actions(&self, actions: Vec<ActionInput>) -> Result<(), SyncError> {
        let position = self
            .inner
            .lock()
            .mirror
            .position()
            .ok_or_else(|| SyncError::conflict("Game has not started"))?;
        let body = ActionBody {
            game_id: self.inner.game_id.clone(),
            actions,
            turn_id: position.turn_id,
            action_count: position.action_count,
        };
        self.transport.send_body(MessageType::Action, &body)?;
        Ok(())
    }

    /// Take a seat.
    pub async fn join_team(&self, team_id: TeamId) -> Result<(), SyncError> {
        let request = GameRequest::JoinTeam(JoinTeamParams {
            game_id: self.inner.game_id.clone(),
            team_id,
        });
        call::<Value>(&self.transport, &request).await?;
        Ok(())
    }

    /// Start the game with its opening units.
    pub async fn start(&self, units: Vec<Unit>) -> Result<(), SyncError> {
        let request = GameRequest::StartGame(StartGameParams {
            game_id: self.inner.game_id.clone(),
            units,
        });
        call::<Value>(&self.transport, &request).await?;
        Ok(())
    }

    /// Propose an undo.
    pub async fn request_undo(&self) -> Result<RequestOutcome, SyncError> {
        self.player_request(RequestKind::Undo).await
    }

    /// Propose a truce.
    pub async fn request_truce(&self) -> Result<RequestOutcome, SyncError> {
        self.player_request(RequestKind::Truce).await
    }

    /// Propose an undo or a truce.
    pub async fn player_request(&self, kind: RequestKind) -> Result<RequestOutcome, SyncError> {
        let request = GameRequest::PlayerRequest(PlayerRequestParams {
            game_id: self.inner.game_id.clone(),
            kind,
        });
        let reply: PlayerRequestReply = call(&self.transport, &request).await?;
        Ok(reply.outcome)
    }

    /// Accept the pending request.
    pub async fn accept_request(&self) -> Result<(), SyncError> {
        let request = GameRequest::AcceptPlayerRequest(self.pending_ref()?);
        call::<Value>(&self.transport, &request).await?;
        Ok(())
    }

    /// Reject the pending request.
    pub async fn reject_request(&self) -> Result<(), SyncError> {
        let request = GameRequest::RejectPlayerRequest(self.pending_ref()?);
        call::<Value>(&self.transport, &request).await?;
        Ok(())
    }

    /// Withdraw own pending request.
    pub async fn cancel_request(&self) -> Result<(), SyncError> {
        let request = GameRequest::CancelPlayerRequest(GameRef {
            game_id: self.inner.game_id.clone(),
        });
        call::<Value>(&self.transport, &request).await?;
        Ok(())
    }

    fn pending_ref(&self) -> Result<RequestRef, SyncError> {
        let state = self.inner.lock();
        let request = state
            .mirror
            .player_request()
            .filter(|r| r.is_pending())
            .ok_or_else(|| SyncError::not_found("No pending request"))?;
        Ok(RequestRef {
            game_id: self.inner.game_id.clone(),
            created_at: request.created_at,
        })
    }
}

impl Drop for GameClient {
    fn drop(&mut self) {
        self.transport.events().off(self.listener);
    }
}

async fn call<T: DeserializeOwned>(transport: &SessionTransport, request: &GameRequest) -> Result<T, SyncError> {
    transport
        .request(MessageType::Request, request, RequestFlags::default())?
        .wait_as()
        .await
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl GameInner {
    fn lock(&self) -> MutexGuard<'_, MirrorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_transport_event(self: &Arc<Self>, event: &TransportEvent) {
        match event {
            TransportEvent::Event(body) if body.game_id == self.game_id => self.on_game_event(&body.event),
            TransportEvent::Error(body) if body.source.game_id.as_deref() == Some(self.game_id.as_str()) => {
                let error = SyncError::from(body.error.clone());
                if body.source.kind == MessageType::Action {
                    debug!(game_id = %self.game_id, "action rejected: {}", error);
                    self.updates.emit(&GameUpdate::ActionRejected(error));
                } else {
                    info!(game_id = %self.game_id, "{}", error);
                    self.rejoin_from_mirror(Vec::new());
                }
            }
            TransportEvent::Reset { stale_outbox } => {
                let stale = stale_actions(stale_outbox, &self.game_id);
                self.rejoin_from_mirror(stale);
            }
            _ => {}
        }
    }

    fn on_game_event(self: &Arc<Self>, event: &GameEvent) {
        let applied = {
            let mut state = self.lock();
            if state.joining || !state.synced {
                return;
            }
            state.mirror.apply_event(event)
        };
        match applied {
            Ok(()) => self.updates.emit(&GameUpdate::Event(event.clone())),
            Err(e) => {
                info!(game_id = %self.game_id, "{}", e);
                self.lock().synced = false;
                self.rejoin_or_warn(None, Vec::new());
            }
        }
    }

    fn rejoin_from_mirror(self: &Arc<Self>, stale: Vec<ActionBody>) {
        let reference = {
            let state = self.lock();
            state.synced.then(|| state.mirror.reference())
        };
        self.rejoin_or_warn(reference, stale);
    }

    fn rejoin_or_warn(self: &Arc<Self>, reference: Option<ClientReference>, stale: Vec<ActionBody>) {
        if let Err(e) = self.rejoin(reference, stale, None) {
            warn!(game_id = %self.game_id, "cannot rejoin: {}", e);
        }
    }

    fn rejoin(
        self: &Arc<Self>,
        reference: Option<ClientReference>,
        stale: Vec<ActionBody>,
        done: Option<JoinDone>,
    ) -> Result<(), SyncError> {
        let transport = self.transport.upgrade().ok_or(SyncError::ConnectionReset)?;
        self.lock().joining = true;

        let body = JoinBody {
            game_id: self.game_id.clone(),
            reference,
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let queued = transport.request_with(MessageType::Join, &body, move |result| {
            if let Some(inner) = weak.upgrade() {
                inner.on_joined(result, stale, done);
            }
        });
        if queued.is_err() {
            self.lock().joining = false;
        }
        Ok(queued?)
    }

    fn on_joined(self: &Arc<Self>, result: Result<Value, SyncError>, stale: Vec<ActionBody>, done: Option<JoinDone>) {
        let finish = |outcome: Result<(), SyncError>| {
            if let Some(done) = done {
                let _ = done.send(outcome);
            }
        };

        let patch = match result.and_then(|value| Ok(serde_json::from_value::<SyncPatch>(value)?)) {
            Ok(patch) => patch,
            // A reset rejoins on its own; a terminal close ends everything.
            Err(SyncError::ConnectionReset) => return finish(Err(SyncError::ConnectionReset)),
            Err(e) => {
                self.lock().joining = false;
                warn!(game_id = %self.game_id, "join failed: {}", e);
                return finish(Err(e));
            }
        };

        let applied = {
            let mut state = self.lock();
            state.joining = false;
            let applied = state.mirror.apply_patch(&patch);
            state.synced = applied.is_ok();
            applied
        };

        match applied {
            Ok(events) => {
                for event in events {
                    self.updates.emit(&GameUpdate::Event(event));
                }
                self.updates.emit(&GameUpdate::Synced);
                self.resend_stale(stale);
                finish(Ok(()));
            }
            Err(e) => {
                info!(game_id = %self.game_id, "{}, rejoining for a snapshot", e);
                if let Err(e) = self.rejoin(None, stale, None) {
                    finish(Err(e));
                    return;
                }
                // The snapshot rejoin completes on its own.
                finish(Ok(()));
            }
        }
    }

    /// Resend actions lost in a reset that the mirror shows were never applied.
    fn resend_stale(&self, stale: Vec<ActionBody>) {
        if stale.is_empty() {
            return;
        }
        let Some(transport) = self.transport.upgrade() else { return };
        let position = self.lock().mirror.position();

        for body in stale {
            if Some(body.position()) != position {
                debug!(game_id = %self.game_id, turn_id = body.turn_id, "dropping stale action");
                continue;
            }
            info!(game_id = %self.game_id, turn_id = body.turn_id, "resending action lost in reset");
            if let Err(e) = transport.send_body(MessageType::Action, &body) {
                warn!(game_id = %self.game_id, "cannot resend action: {}", e);
            }
        }
    }
}

/// Action bodies for `game_id` among a reset's stale outbox.
fn stale_actions(outbox: &[Envelope], game_id: &str) -> Vec<ActionBody> {
    outbox
        .iter()
        .filter(|env| env.kind == MessageType::Action)
        .filter_map(|env| env.body_as::<ActionBody>().ok())
        .filter(|body| body.game_id == game_id)
        .collect()
}
