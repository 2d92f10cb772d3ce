//! Message Sessions
//!
//! A session is the resumable identity of one client connection, independent
//! of how many sockets it spans. [`MessageSession`] holds the per-direction
//! counters, the outbox of unacknowledged messages and the response routes.
//! It does no I/O; the client transport and the server both drive one.
//!
//! Inbound ordering: a sequenced message with `id == last_received + 1` is
//! applied, a lower id is a duplicate and is dropped, a higher id means
//! something was lost and the receiver asks for a resend with `sync`.
//!
//! The server keeps its sessions in a [`SessionManager`] so a reconnecting
//! client can resume where it left off.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::time::Timestamp;
use crate::game::state::PlayerId;
use crate::game::GameId;
use crate::network::auth::Identity;
use crate::network::protocol::{Envelope, MessageId, MessageType, Side};

/// Unique session identifier.
pub type SessionId = String;

/// How an inbound message relates to what was already applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Next in sequence: apply it.
    Apply,
    /// Already applied: drop it.
    Duplicate,
    /// Messages are missing before it: drop it and send `sync`.
    Gap,
    /// Not sequenced (handshake, `sync`, `error`, ...): apply it.
    Unsequenced,
}

/// Counters, outbox and response routes of one session, for one side.
#[derive(Debug)]
pub struct MessageSession<R = ()> {
    side: Side,
    session_id: Option<SessionId>,
    last_sent_id: MessageId,
    last_received_id: MessageId,
    outbox: VecDeque<Envelope>,
    routes: BTreeMap<MessageId, R>,
}

impl<R> MessageSession<R> {
    /// Fresh session for `side`.
    pub fn new(side: Side) -> Self {
        Self {
            side,
            session_id: None,
            last_sent_id: 0,
            last_received_id: 0,
            outbox: VecDeque::new(),
            routes: BTreeMap::new(),
        }
    }

    /// Session id, once identified.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Bind to a session id without touching counters.
    pub fn set_session_id(&mut self, id: impl Into<SessionId>) {
        self.session_id = Some(id.into());
    }

    /// Id of the last sequenced message sent.
    pub fn last_sent_id(&self) -> MessageId {
        self.last_sent_id
    }

    /// Id of the last sequenced message applied.
    pub fn last_received_id(&self) -> MessageId {
        self.last_received_id
    }

    /// Unacknowledged messages, oldest first.
    pub fn outbox(&self) -> impl Iterator<Item = &Envelope> {
        self.outbox.iter()
    }

    /// Number of unacknowledged messages.
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Number or open response routes.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Stamp an outbound message.
    ///
    /// Sequenced types get the next id and a copy goes to the outbox. Every
    /// message carries the current ack.
    pub fn prepare(&mut self, mut env: Envelope) -> Envelope {
        if env.kind.is_sequenced(self.side) {
            self.last_sent_id += 1;
            env.id = Some(self.last_sent_id);
        } else {
            env.id = None;
        }
        env.ack = Some(self.last_received_id);
        if self.side == Side::Server {
            env.now = Some(Timestamp::now().as_millis());
        }
        if env.id.is_some() {
            self.outbox.push_back(env.clone());
        }
        env
    }

    /// Prepare a sequenced message and remember `route` for its response.
    pub fn prepare_with_route(&mut self, env: Envelope, route: R) -> Envelope {
        let env = self.prepare(env);
        if let Some(id) = env.id {
            self.routes.insert(id, route);
        }
        env
    }

    /// Bare `sync` carrying the current ack.
    pub fn sync_message(&mut self) -> Envelope {
        self.prepare(Envelope::new(MessageType::Sync))
    }

    /// Classify an inbound message without changing state.
    pub fn classify(&self, env: &Envelope) -> Inbound {
        let peer = match self.side {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        };
        if !env.kind.is_sequenced(peer) {
            return Inbound::Unsequenced;
        }
        let Some(id) = env.id else {
            return Inbound::Unsequenced;
        };
        let expected = self.last_received_id + 1;
        if id < expected {
            Inbound::Duplicate
        } else if id > expected {
            Inbound::Gap
        } else {
            Inbound::Apply
        }
    }

    /// Account for an inbound message: prune by its ack, then classify it
    /// and advance the counter if it is applied.
    pub fn receive(&mut self, env: &Envelope) -> Inbound {
        if let Some(ack) = env.ack {
            self.prune(ack);
        }
        let inbound = self.classify(env);
        if inbound == Inbound::Apply {
            if let Some(id) = env.id {
                self.last_received_id = id;
            }
        }
        inbound
    }

    /// Drop outbox entries with `id <= ack`.
    pub fn prune(&mut self, ack: MessageId) {
        while self
            .outbox
            .front()
            .and_then(|e| e.id)
            .is_some_and(|id| id <= ack)
        {
            self.outbox.pop_front();
        }
    }

    /// Outbox entries with `id > after`, restamped with the current ack.
    pub fn pending_after(&self, after: MessageId) -> Vec<Envelope> {
        self.outbox
            .iter()
            .filter(|e| e.id.is_some_and(|id| id > after))
            .cloned()
            .map(|mut e| {
                e.ack = Some(self.last_received_id);
                e
            })
            .collect()
    }

    /// Take the route waiting for a response to `request_id`.
    pub fn take_route(&mut self, request_id: MessageId) -> Option<R> {
        self.routes.remove(&request_id)
    }

    /// Take every open route, leaving counters and outbox alone.
    pub fn drain_routes(&mut self) -> Vec<R> {
        std::mem::take(&mut self.routes).into_values().collect()
    }

    /// Start over under a new session id.
    ///
    /// Returns the stale outbox and the open routes so the caller can decide
    /// what to resend and what to reject.
    pub fn reset(&mut self, session_id: impl Into<SessionId>) -> (Vec<Envelope>, Vec<R>) {
        let stale = std::mem::take(&mut self.outbox).into_iter().collect();
        let routes = std::mem::take(&mut self.routes).into_values().collect();
        self.session_id = Some(session_id.into());
        self.last_sent_id = 0;
        self.last_received_id = 0;
        (stale, routes)
    }
}

// =============================================================================
// SERVER SESSIONS
// =============================================================================

/// Server-side state of one client session.
pub struct ServerSession {
    /// Id given to the client.
    pub id: SessionId,
    /// Counters and outbox.
    pub messages: MessageSession,
    /// Identity granted by the last `authorize`.
    pub identity: Option<Identity>,
    /// Games this session receives events for.
    pub games: BTreeSet<GameId>,
    /// Writer of the current connection, if any.
    connection: Option<mpsc::UnboundedSender<Envelope>>,
    /// Event forwarders, one per joined game.
    forwarders: BTreeMap<GameId, JoinHandle<()>>,
    /// Last inbound message of any kind.
    pub last_seen: Instant,
    /// Last inbound sequenced message.
    pub last_active: Instant,
}

impl ServerSession {
    fn new(id: SessionId) -> Self {
        let mut messages = MessageSession::new(Side::Server);
        messages.set_session_id(id.clone());
        Self {
            id,
            messages,
            identity: None,
            games: BTreeSet::new(),
            connection: None,
            forwarders: BTreeMap::new(),
            last_seen: Instant::now(),
            last_active: Instant::now(),
        }
    }

    /// Player the session acts as, unless its identity has lapsed.
    pub fn player(&self, now: Timestamp) -> Option<PlayerId> {
        self.identity
            .as_ref()
            .filter(|identity| !identity.is_expired(now))
            .map(|identity| identity.player_id.clone())
    }

    /// Stamp and send a message. Sequenced messages stay in the outbox while
    /// no connection is attached and go out on resume.
    pub fn send(&mut self, env: Envelope) {
        let env = self.messages.prepare(env);
        self.write(env);
    }

    /// Write without stamping.
    fn write(&mut self, env: Envelope) {
        if let Some(connection) = &self.connection {
            if connection.send(env).is_err() {
                self.connection = None;
            }
        }
    }

    /// Attach a connection and resend everything the client has not acked.
    pub fn attach(&mut self, connection: mpsc::UnboundedSender<Envelope>) {
        self.connection = Some(connection);
        self.last_seen = Instant::now();
    }

    /// Resend the outbox after `ack`.
    pub fn resend(&mut self, ack: MessageId) {
        self.messages.prune(ack);
        for env in self.messages.pending_after(ack) {
            self.write(env);
        }
    }

    /// Detach `connection` if it is still the attached one.
    pub fn detach(&mut self, connection: &mpsc::UnboundedSender<Envelope>) {
        if self
            .connection
            .as_ref()
            .is_some_and(|current| current.same_channel(connection))
        {
            self.connection = None;
        }
        self.last_seen = Instant::now();
    }

    /// Record an inbound message.
    pub fn touch(&mut self, sequenced: bool) {
        self.last_seen = Instant::now();
        if sequenced {
            self.last_active = self.last_seen;
        }
    }

    /// Whether a connection is attached.
    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| !c.is_closed())
    }

    /// Keep an event forwarder alive as long as the session. A rejoin
    /// replaces the previous forwarder of that game.
    pub fn add_forwarder(&mut self, game_id: GameId, handle: JoinHandle<()>) {
        self.games.insert(game_id.clone());
        if let Some(previous) = self.forwarders.insert(game_id, handle) {
            previous.abort();
        }
    }

    /// Stop receiving events for a game.
    pub fn remove_forwarder(&mut self, game_id: &str) {
        self.games.remove(game_id);
        if let Some(forwarder) = self.forwarders.remove(game_id) {
            forwarder.abort();
        }
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        for forwarder in self.forwarders.values() {
            forwarder.abort();
        }
    }
}

/// Shared handle to a server session.
pub type SharedSession = Arc<Mutex<ServerSession>>;

/// Registry of server sessions by id.
pub struct SessionManager {
    sessions: RwLock<BTreeMap<SessionId, SharedSession>>,
}

impl SessionManager {
    /// Create new session manager.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a new session.
    pub async fn create_session(&self) -> SharedSession {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Mutex::new(ServerSession::new(id.clone())));

        let mut sessions = self.sessions.write().await;
        sessions.insert(id, session.clone());

        session
    }

    /// Get a session by ID.
    pub async fn get_session(&self, id: &str) -> Option<SharedSession> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned()
    }

    /// Resume `id` if it exists, otherwise create a new session.
    pub async fn resume_or_create(&self, id: Option<&str>) -> (SharedSession, bool) {
        if let Some(id) = id {
            if let Some(session) = self.get_session(id).await {
                return (session, true);
            }
            debug!(session_id = id, "unknown session, starting a new one");
        }
        (self.create_session().await, false)
    }

    /// Remove a session.
    pub async fn remove_session(&self, id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(id);
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    /// Remove detached sessions idle for longer than `ttl`.
    pub async fn cleanup(&self, ttl: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut to_remove = Vec::new();

        for (id, session) in sessions.iter() {
            let s = session.lock().await;
            if !s.is_connected() && s.last_seen.elapsed() > ttl {
                to_remove.push(id.clone());
            }
        }

        for id in &to_remove {
            sessions.remove(id);
        }
        to_remove.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
