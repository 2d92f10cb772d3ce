//! WebSocket Game Server
//!
//! Async WebSocket server for turn-based matches. Every connection starts
//! with an `open`/`resume` handshake binding it to a [`ServerSession`]; the
//! session outlives the socket so a reconnecting client resumes where it
//! left off. Game logic runs in per-game actors (see `games`).
//!
//! [`ServerSession`]: crate::network::session::ServerSession

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::{interval, sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::core::error::SyncError;
use crate::core::time::Timestamp;
use crate::game::state::PlayerId;
use crate::game::store::GameStore;
use crate::game::GameId;
use crate::network::auth::TokenVerifier;
use crate::network::games::{EventFeed, GameRegistry};
use crate::network::protocol::{
    ActionBody, AuthorizeBody, Authorized, CreatedGame, Envelope, ErrorBody, ErrorSource, EventBody,
    GameRequest, JoinBody, MessageId, MessageType, OpenBody, ResponseBody, ResumeBody, SessionBody,
    CLOSE_IDLE_TIMEOUT, CLOSE_INACTIVE, CLOSE_MALFORMED, CLOSE_SHUTDOWN, PROTOCOL_VERSION,
};
use crate::network::session::{Inbound, ServerSession, SessionId, SessionManager, SharedSession};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// A connection that receives nothing for this long is closed (4000).
    pub idle_timeout: Duration,
    /// A session that joined no game and sent nothing but heartbeats for
    /// this long is evicted (4101).
    pub inactivity_timeout: Duration,
    /// Detached sessions are dropped after this long.
    pub session_ttl: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(3600),
            session_ttl: Duration::from_secs(300),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            bind_addr: std::env::var("SYNC_BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("SYNC_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            idle_timeout: secs("SYNC_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            inactivity_timeout: secs("SYNC_INACTIVITY_TIMEOUT_SECS", defaults.inactivity_timeout),
            session_ttl: secs("SYNC_SESSION_TTL_SECS", defaults.session_ttl),
            version: defaults.version,
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,
}

/// Connected client state.
struct ConnectedClient {
    /// Session bound by the handshake.
    session_id: Option<SessionId>,
    /// Connection time.
    connected_at: Instant,
}

/// Why the server closes a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CloseReason {
    code: u16,
    reason: &'static str,
}

impl CloseReason {
    const fn new(code: u16, reason: &'static str) -> Self {
        Self { code, reason }
    }

    fn frame(self) -> CloseFrame<'static> {
        CloseFrame {
            code: CloseCode::from(self.code),
            reason: self.reason.into(),
        }
    }
}

/// Everything a connection task needs.
#[derive(Clone)]
struct Shared {
    config: ServerConfig,
    verifier: Arc<TokenVerifier>,
    sessions: Arc<SessionManager>,
    games: Arc<GameRegistry>,
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
}

/// The game server.
pub struct GameServer {
    shared: Shared,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig, verifier: TokenVerifier, store: Arc<dyn GameStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shared: Shared {
                config,
                verifier: Arc::new(verifier),
                sessions: Arc::new(SessionManager::new()),
                games: Arc::new(GameRegistry::new(store)),
                clients: Arc::new(RwLock::new(BTreeMap::new())),
            },
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server listening on {}", listener.local_addr()?);

        let cleanup_sessions = self.shared.sessions.clone();
        let session_ttl = self.shared.config.session_ttl;

        // Spawn cleanup task
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_sessions, session_ttl).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.shared.clients.read().await.len();
                            if clients_count >= self.shared.config.max_connections {
                                warn!("{}, rejecting {}", GameServerError::ConnectionLimitReached, addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let shared = self.shared.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            shared.clients.write().await.insert(
                addr,
                ConnectedClient {
                    session_id: None,
                    connected_at: Instant::now(),
                },
            );

            shared.serve_connection(ws_stream, addr, shutdown_rx).await;

            if let Some(client) = shared.clients.write().await.remove(&addr) {
                info!(
                    session_id = client.session_id.as_deref().unwrap_or("-"),
                    "Client {} cleaned up after {:?}",
                    addr,
                    client.connected_at.elapsed()
                );
            }
        });
    }

    /// Drop detached sessions whose client never came back.
    async fn run_cleanup_loop(sessions: Arc<SessionManager>, ttl: Duration) {
        let mut interval = interval(ttl.clamp(Duration::from_secs(1), Duration::from_secs(60)));

        loop {
            interval.tick().await;

            let removed = sessions.cleanup(ttl).await;
            if removed > 0 {
                info!("Removed {} expired sessions", removed);
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.shared.clients.read().await.len()
    }

    /// Get session count, attached or not.
    pub async fn session_count(&self) -> usize {
        self.shared.sessions.session_count().await
    }

    /// Get live game count.
    pub async fn game_count(&self) -> usize {
        self.shared.games.len().await
    }
}

// =============================================================================
// CONNECTIONS
// =============================================================================

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

impl Shared {
    async fn serve_connection(&self, ws_stream: WsStream, addr: SocketAddr, mut shutdown_rx: broadcast::Receiver<()>) {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        // Spawn message sender task; it hands the sink back once every
        // sender is gone so the close frame can go out after the queue.
        let writer = tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                let text = match env.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            ws_sender
        });

        let mut session: Option<SharedSession> = None;
        let idle = sleep(self.config.idle_timeout);
        tokio::pin!(idle);
        let mut inactivity = interval(self.config.idle_timeout);
        inactivity.tick().await;

        let close = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    idle.as_mut().reset(tokio::time::Instant::now() + self.config.idle_timeout);
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(_))) => {
                            break Some(CloseReason::new(CLOSE_MALFORMED, "Binary frames are not supported"));
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Client {} disconnected", addr);
                            break None;
                        }
                        Some(Err(e)) => {
                            debug!("WebSocket error for {}: {}", addr, e);
                            break None;
                        }
                        Some(Ok(_)) => continue,
                    };

                    let env = match Envelope::from_json(&text) {
                        Ok(env) => env,
                        Err(e) => {
                            debug!("Invalid message from {}: {}", addr, e);
                            break Some(CloseReason::new(CLOSE_MALFORMED, "Invalid message format"));
                        }
                    };

                    let result = match &session {
                        None => match self.handshake(env, &tx).await {
                            Ok(bound) => {
                                let id = bound.lock().await.id.clone();
                                if let Some(client) = self.clients.write().await.get_mut(&addr) {
                                    client.session_id = Some(id);
                                }
                                session = Some(bound);
                                Ok(())
                            }
                            Err(close) => Err(close),
                        },
                        Some(session) => self.handle_message(session, env).await,
                    };
                    if let Err(close) = result {
                        break Some(close);
                    }
                }
                _ = &mut idle => {
                    break Some(CloseReason::new(CLOSE_IDLE_TIMEOUT, "Idle timeout"));
                }
                _ = inactivity.tick() => {
                    if let Some(session) = &session {
                        let s = session.lock().await;
                        if s.games.is_empty() && s.last_active.elapsed() > self.config.inactivity_timeout {
                            break Some(CloseReason::new(CLOSE_INACTIVE, "Evicted for inactivity"));
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    break Some(CloseReason::new(CLOSE_SHUTDOWN, "Server shutting down"));
                }
            }
        };

        if let Some(session) = &session {
            let mut s = session.lock().await;
            s.detach(&tx);
            if close.is_some_and(|c| c.code == CLOSE_INACTIVE) {
                let id = s.id.clone();
                drop(s);
                self.sessions.remove_session(&id).await;
            }
        }
        drop(tx);

        if let Ok(mut ws_sender) = writer.await {
            if let Some(close) = close {
                debug!(code = close.code, "closing {}: {}", addr, close.reason);
                let _ = ws_sender.send(Message::Close(Some(close.frame()))).await;
            }
            let _ = ws_sender.close().await;
        }
    }

    /// Bind the connection to a new or resumed session.
    async fn handshake(
        &self,
        env: Envelope,
        tx: &mpsc::UnboundedSender<Envelope>,
    ) -> Result<SharedSession, CloseReason> {
        let malformed = CloseReason::new(CLOSE_MALFORMED, "Expected open or resume");
        let session = match env.kind {
            MessageType::Open => {
                let body: OpenBody = env.body_as().map_err(|_| malformed)?;
                if body.version != PROTOCOL_VERSION {
                    return Err(CloseReason::new(CLOSE_MALFORMED, "Unsupported protocol version"));
                }
                self.sessions.create_session().await
            }
            MessageType::Resume => {
                let body: ResumeBody = env.body_as().map_err(|_| malformed)?;
                let (session, resumed) = self.sessions.resume_or_create(Some(&body.session_id)).await;
                if resumed {
                    info!(session_id = %body.session_id, "session resumed");
                }
                session
            }
            _ => return Err(malformed),
        };

        let mut s = session.lock().await;
        s.messages.receive(&env);
        s.touch(true);
        s.attach(tx.clone());
        let reply = Envelope::with_body(
            MessageType::Session,
            &SessionBody {
                session_id: s.id.clone(),
                version: PROTOCOL_VERSION,
            },
        )
        .map_err(|_| malformed)?;
        s.send(reply);
        s.resend(env.ack.unwrap_or(0));
        drop(s);

        Ok(session)
    }

    async fn handle_message(&self, session: &SharedSession, env: Envelope) -> Result<(), CloseReason> {
        let (inbound, player) = {
            let mut s = session.lock().await;
            let inbound = s.messages.receive(&env);
            s.touch(inbound == Inbound::Apply);
            (inbound, s.player(Timestamp::now()))
        };

        match inbound {
            Inbound::Duplicate => {
                debug!(id = ?env.id, "dropping duplicate {:?}", env.kind);
                Ok(())
            }
            Inbound::Gap => {
                debug!(id = ?env.id, "gap before {:?}, asking for resend", env.kind);
                session.lock().await.send(Envelope::new(MessageType::Sync));
                Ok(())
            }
            Inbound::Unsequenced => match env.kind {
                MessageType::Sync => {
                    let mut s = session.lock().await;
                    s.resend(env.ack.unwrap_or(0));
                    s.send(Envelope::new(MessageType::Sync));
                    Ok(())
                }
                _ => Err(CloseReason::new(CLOSE_MALFORMED, "Unexpected message")),
            },
            Inbound::Apply => {
                self.dispatch(session, env, player).await;
                Ok(())
            }
        }
    }

    async fn dispatch(&self, session: &SharedSession, env: Envelope, player: Option<PlayerId>) {
        let id = env.id.unwrap_or_default();
        match env.kind {
            MessageType::Authorize => {
                let result = self.authorize(session, &env).await;
                respond(session, id, result).await;
            }
            MessageType::Join => self.join(session, id, &env, player).await,
            MessageType::Request => {
                let result = self.request(&env, player).await;
                respond(session, id, result).await;
            }
            MessageType::Action => {
                if let Err(error) = self.action(&env, player).await {
                    debug!(id, "action rejected: {}", error);
                    let game_id = env
                        .body
                        .as_ref()
                        .and_then(|b| b.get("gameId"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    let body = ErrorBody {
                        source: ErrorSource {
                            kind: MessageType::Action,
                            id: Some(id),
                            game_id,
                        },
                        error: error.to_wire(),
                    };
                    send_body(session, MessageType::Error, &body).await;
                }
            }
            other => debug!("ignoring {:?}", other),
        }
    }

    async fn authorize(&self, session: &SharedSession, env: &Envelope) -> Result<Value, SyncError> {
        let body: AuthorizeBody = env.body_as()?;
        let identity = self.verifier.verify(&body.token)?;
        let player_id = identity.player_id.clone();

        info!(player_id = %player_id, subject = %identity.subject, "session authorized");
        session.lock().await.identity = Some(identity);

        Ok(serde_json::to_value(Authorized { player_id })?)
    }

    async fn join(&self, session: &SharedSession, id: MessageId, env: &Envelope, player: Option<PlayerId>) {
        let joined = async {
            let body: JoinBody = env.body_as()?;
            let handle = self.games.get(&body.game_id).await?;
            let (patch, events) = handle.join(player, body.reference).await?;
            Ok::<_, SyncError>((body.game_id, serde_json::to_value(&patch)?, events))
        }
        .await;

        match joined {
            Ok((game_id, patch, events)) => {
                let mut s = session.lock().await;
                send_response(&mut s, id, Ok(patch));
                // Spawned under the lock: the forwarder's first event is
                // queued after the patch.
                let forwarder = tokio::spawn(forward_events(Arc::downgrade(session), game_id.clone(), events));
                s.add_forwarder(game_id, forwarder);
            }
            Err(e) => respond(session, id, Err(e)).await,
        }
    }

    async fn request(&self, env: &Envelope, player: Option<PlayerId>) -> Result<Value, SyncError> {
        let request: GameRequest = env.body_as()?;
        let player = player.ok_or_else(|| SyncError::unauthorized("Authorize first"))?;
        debug!(method = request.method(), "request");

        if let GameRequest::CreateGame(params) = request {
            let game_id = self.games.create(params).await?;
            return Ok(serde_json::to_value(CreatedGame { game_id })?);
        }
        let game_id = request
            .game_id()
            .ok_or_else(|| SyncError::protocol("Missing gameId"))?
            .to_string();
        let handle = self.games.get(&game_id).await?;
        handle.request(player, request).await
    }

    async fn action(&self, env: &Envelope, player: Option<PlayerId>) -> Result<(), SyncError> {
        let body: ActionBody = env.body_as()?;
        let player = player.ok_or_else(|| SyncError::unauthorized("Authorize first"))?;
        let position = body.position();
        let handle = self.games.get(&body.game_id).await?;
        handle.submit_action(player, body.actions, Some(position)).await
    }
}

/// Relay a game's broadcast to one session until either goes away.
async fn forward_events(session: Weak<Mutex<ServerSession>>, game_id: GameId, mut events: EventFeed) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(session) = session.upgrade() else { break };
                let body = EventBody {
                    game_id: game_id.clone(),
                    event,
                };
                send_body(&session, MessageType::Event, &body).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(game_id = %game_id, skipped, "event feed fell behind");
                if let Some(session) = session.upgrade() {
                    let body = ErrorBody {
                        source: ErrorSource {
                            kind: MessageType::Event,
                            id: None,
                            game_id: Some(game_id.clone()),
                        },
                        error: SyncError::conflict("Event feed fell behind; rejoin").to_wire(),
                    };
                    let mut s = session.lock().await;
                    send_envelope(&mut s, MessageType::Error, &body);
                    s.games.remove(&game_id);
                }
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn respond(session: &SharedSession, request_id: MessageId, result: Result<Value, SyncError>) {
    let mut s = session.lock().await;
    send_response(&mut s, request_id, result);
}

fn send_response(session: &mut ServerSession, request_id: MessageId, result: Result<Value, SyncError>) {
    let body = ResponseBody::from_result(request_id, result);
    send_envelope(session, MessageType::Response, &body);
}

async fn send_body<T: serde::Serialize>(session: &SharedSession, kind: MessageType, body: &T) {
    let mut s = session.lock().await;
    send_envelope(&mut s, kind, body);
}

fn send_envelope<T: serde::Serialize>(session: &mut ServerSession, kind: MessageType, body: &T) {
    match Envelope::with_body(kind, body) {
        Ok(env) => session.send(env),
        Err(e) => error!("Failed to encode {:?}: {}", kind, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::store::MemoryGameStore;
    use crate::network::auth::AuthConfig;
    use tokio_tungstenite::connect_async;

    fn test_server() -> GameServer {
        let config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            idle_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let verifier = TokenVerifier::new(&AuthConfig::with_secret("test-secret-key-256-bits-long!!")).unwrap();
        GameServer::new(config, verifier, Arc::new(MemoryGameStore::new()))
    }

    async fn spawn_server() -> (Arc<GameServer>, String) {
        let server = Arc::new(test_server());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });
        (server, url)
    }

    async fn next_envelope<S>(ws: &mut S) -> Envelope
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return Envelope::from_json(&text).unwrap(),
                Message::Close(frame) => panic!("closed: {frame:?}"),
                _ => continue,
            }
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.bind_addr.port(), 8080);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = test_server();

        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.session_count().await, 0);
        assert_eq!(server.game_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let server = test_server();
        server.shutdown();
        // Should not panic
    }

    #[tokio::test]
    async fn test_open_then_resume_same_session() {
        let (server, url) = spawn_server().await;

        let (mut ws, _) = connect_async(&url).await.unwrap();
        let open = Envelope::with_body(MessageType::Open, &OpenBody { version: PROTOCOL_VERSION }).unwrap();
        ws.send(Message::Text(open.to_json().unwrap())).await.unwrap();

        let reply = next_envelope(&mut ws).await;
        assert_eq!(reply.kind, MessageType::Session);
        assert!(reply.now.is_some());
        let body: SessionBody = reply.body_as().unwrap();
        ws.close(None).await.unwrap();

        let (mut ws, _) = connect_async(&url).await.unwrap();
        let resume = Envelope::with_body(
            MessageType::Resume,
            &ResumeBody {
                session_id: body.session_id.clone(),
            },
        )
        .unwrap();
        ws.send(Message::Text(resume.to_json().unwrap())).await.unwrap();
        let resumed: SessionBody = next_envelope(&mut ws).await.body_as().unwrap();
        assert_eq!(resumed.session_id, body.session_id);
        assert_eq!(server.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_first_message_closes_terminally() {
        let (_server, url) = spawn_server().await;
        let (mut ws, _) = connect_async(&url).await.unwrap();
        ws.send(Message::Text("not json".into())).await.unwrap();

        loop {
            match ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) => {
                    assert_eq!(u16::from(frame.code), CLOSE_MALFORMED);
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_sync_is_answered_and_request_needs_authorization() {
        let (_server, url) = spawn_server().await;
        let (mut ws, _) = connect_async(&url).await.unwrap();
        let open = Envelope::with_body(MessageType::Open, &OpenBody { version: PROTOCOL_VERSION }).unwrap();
        ws.send(Message::Text(open.to_json().unwrap())).await.unwrap();
        next_envelope(&mut ws).await;

        let mut sync = Envelope::new(MessageType::Sync);
        sync.ack = Some(0);
        ws.send(Message::Text(sync.to_json().unwrap())).await.unwrap();
        assert_eq!(next_envelope(&mut ws).await.kind, MessageType::Sync);

        let mut request = Envelope::with_body(
            MessageType::Request,
            &GameRequest::CancelPlayerRequest(crate::network::protocol::GameRef { game_id: "g".into() }),
        )
        .unwrap();
        request.id = Some(1);
        ws.send(Message::Text(request.to_json().unwrap())).await.unwrap();

        let response = next_envelope(&mut ws).await;
        assert_eq!(response.kind, MessageType::Response);
        assert_eq!(response.id, Some(1));
        assert_eq!(response.ack, Some(1));
        let body: ResponseBody = response.body_as().unwrap();
        assert_eq!(body.request_id, 1);
        assert_eq!(body.into_result().unwrap_err().code(), 403);
    }
}
