//! Session Transport
//!
//! Client side of the resumable session. A background task owns the socket:
//! it connects with backoff, performs the `open`/`resume` handshake, keeps
//! the heartbeat and routes responses back to the requests that asked for
//! them. The transport outlives its sockets: while disconnected, sequenced
//! messages wait in the outbox and go out once the session is identified.
//!
//! Listeners registered on [`SessionTransport::events`] run on the
//! background task and must not block.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, instrument, warn};

use crate::core::emitter::Emitter;
use crate::core::error::SyncError;
use crate::core::time::{ClockOffset, Timestamp};
use crate::network::protocol::{
    is_terminal_close, Envelope, ErrorBody, EventBody, MessageId, MessageType, OpenBody, ResponseBody, ResumeBody,
    SessionBody, Side, PROTOCOL_VERSION,
};
use crate::network::session::{Inbound, MessageSession, SessionId};

/// Idle time after which a bare `sync` is sent.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);

/// Times a flagged request is re-issued after a connection reset.
pub const MAX_RESET_RETRIES: usize = 3;

/// Close code when the transport is dropped or closed without a code.
const CLOSE_NORMAL: u16 = 1000;
/// Pseudo close code for a socket that went away without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server endpoint (`ws://host:port`).
    pub url: String,
    /// Idle time before a heartbeat `sync`.
    pub heartbeat: Duration,
    /// First reconnect delay.
    pub initial_backoff: Duration,
    /// Reconnect delay ceiling.
    pub max_backoff: Duration,
}

impl TransportConfig {
    /// Defaults for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat: DEFAULT_HEARTBEAT,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Load from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::new(std::env::var("SYNC_SERVER_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080".into()));
        if let Some(secs) = std::env::var("SYNC_HEARTBEAT_SECS").ok().and_then(|s| s.parse().ok()) {
            config.heartbeat = Duration::from_secs(secs);
        }
        if let Some(secs) = std::env::var("SYNC_MAX_BACKOFF_SECS").ok().and_then(|s| s.parse().ok()) {
            config.max_backoff = Duration::from_secs(secs);
        }
        config
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new("ws://127.0.0.1:8080")
    }
}

// =============================================================================
// TYPES
// =============================================================================

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport was closed for good.
    #[error("transport is closed")]
    Closed,

    /// A protocol-level failure.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Socket failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Encoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed | TransportError::WebSocket(_) => SyncError::ConnectionReset,
            TransportError::Sync(e) => e,
            TransportError::Codec(e) => e.into(),
        }
    }
}

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connecting or waiting to reconnect.
    Connecting,
    /// Session identified; messages flow.
    Open,
    /// `close` was called and the close frame is on its way.
    Closing,
    /// Closed for good.
    Closed,
}

/// What the transport announces.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// The session is identified and messages flow.
    Open {
        /// Session the connection is bound to.
        session_id: SessionId,
        /// Whether the previous session was continued.
        resumed: bool,
    },
    /// The previous session was continued; the outbox was resent.
    Resume,
    /// The server did not know the session; a fresh one started.
    Reset {
        /// Sequenced messages that were never acknowledged.
        stale_outbox: Vec<Envelope>,
    },
    /// The socket closed.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
        /// Whether the transport gave up.
        terminal: bool,
    },
    /// A game event.
    Event(EventBody),
    /// An id-less error report.
    Error(ErrorBody),
}

type Callback = Box<dyn FnOnce(Result<Value, SyncError>) + Send>;

/// Where a response goes.
enum Route {
    Waiter(oneshot::Sender<Result<Value, SyncError>>),
    Callback(Callback),
}

impl Route {
    fn resolve(self, result: Result<Value, SyncError>) {
        match self {
            Route::Waiter(tx) => {
                let _ = tx.send(result);
            }
            Route::Callback(callback) => callback(result),
        }
    }
}

enum Command {
    Flush,
    Close { code: u16, reason: String },
}

struct TransportState {
    messages: MessageSession<Route>,
    clock: ClockOffset,
    /// Unsequenced messages waiting for the next flush.
    unsequenced: Vec<Envelope>,
    /// Whether the current socket has completed the handshake.
    identified: bool,
    /// Highest outbox id written to the current socket.
    sent_through: MessageId,
    closed: bool,
}

struct Shared {
    config: TransportConfig,
    state: Mutex<TransportState>,
    events: Emitter<TransportEvent>,
    status: watch::Sender<ConnectionState>,
}

/// Side effects collected under the state lock, run after releasing it.
#[derive(Default)]
struct Effects {
    writes: Vec<Envelope>,
    status: Option<ConnectionState>,
    events: Vec<TransportEvent>,
    replies: Vec<(Route, Result<Value, SyncError>)>,
}

enum Outcome {
    Reconnect,
    Finished,
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Handle to a session transport. Clones share the same session.
#[derive(Clone)]
pub struct SessionTransport {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

/// Non-owning handle, for listeners that must not keep the transport alive.
#[derive(Clone)]
pub struct WeakTransport {
    shared: Weak<Shared>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl WeakTransport {
    /// Get the transport back if it still exists.
    pub fn upgrade(&self) -> Option<SessionTransport> {
        Some(SessionTransport {
            shared: self.shared.upgrade()?,
            commands: self.commands.upgrade()?,
        })
    }
}

impl SessionTransport {
    /// Start connecting to `config.url` in the background.
    ///
    /// Must be called inside a tokio runtime. Connection failures are
    /// logged and retried; the transport stops when every handle is
    /// dropped or [`close`](Self::close) is called.
    pub fn open(config: TransportConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(TransportState {
                messages: MessageSession::new(Side::Client),
                clock: ClockOffset::default(),
                unsequenced: Vec::new(),
                identified: false,
                sent_through: 0,
                closed: false,
            }),
            events: Emitter::new(),
            status,
        });
        tokio::spawn(run(shared.clone(), rx));
        Self { shared, commands }
    }

    /// Server endpoint.
    pub fn url(&self) -> &str {
        &self.shared.config.url
    }

    /// Listener registry.
    pub fn events(&self) -> &Emitter<TransportEvent> {
        &self.shared.events
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakTransport {
        WeakTransport {
            shared: Arc::downgrade(&self.shared),
            commands: self.commands.downgrade(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.status.borrow()
    }

    /// Whether the transport was closed for good.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Session id, once the server assigned one.
    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.lock().messages.session_id().map(str::to_owned)
    }

    /// Unacknowledged sequenced messages.
    pub fn outbox_len(&self) -> usize {
        self.shared.lock().messages.outbox_len()
    }

    /// Estimated server clock.
    pub fn server_time(&self) -> Timestamp {
        self.shared.lock().clock.to_server_time(Timestamp::now())
    }

    /// Estimated offset of the server clock, in milliseconds.
    pub fn clock_offset_ms(&self) -> i64 {
        self.shared.lock().clock.offset_ms()
    }

    /// Wait until the session is open.
    pub async fn wait_open(&self) -> Result<(), TransportError> {
        let mut status = self.shared.status.subscribe();
        loop {
            match *status.borrow_and_update() {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Closed => return Err(TransportError::Closed),
                ConnectionState::Connecting | ConnectionState::Closing => {}
            }
            status.changed().await.map_err(|_| TransportError::Closed)?;
        }
    }

    /// Queue a message. Sequenced types go to the outbox and survive
    /// reconnects; others are sent on the next flush.
    pub fn send(&self, env: Envelope) -> Result<(), TransportError> {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if env.kind.is_sequenced(Side::Client) {
                state.messages.prepare(env);
            } else {
                state.unsequenced.push(env);
            }
        }
        self.flush()
    }

    /// Queue a message with a serialized body.
    pub fn send_body<T: Serialize>(&self, kind: MessageType, body: &T) -> Result<(), TransportError> {
        self.send(Envelope::with_body(kind, body)?)
    }

    /// Send a message that expects a response.
    pub fn request<T: Serialize>(
        &self,
        kind: MessageType,
        body: &T,
        flags: RequestFlags,
    ) -> Result<RequestHandle, TransportError> {
        let envelope = Envelope::with_body(kind, body)?;
        let receiver = self.enqueue_request(envelope.clone())?;
        Ok(RequestHandle {
            transport: self.clone(),
            envelope,
            receiver,
            state: RequestState::Pending,
            value: None,
            flags,
        })
    }

    /// Send a message that expects a response and hand the result to
    /// `on_response`.
    ///
    /// The callback runs on the transport task in wire order: every event
    /// received before the response has already been emitted, and none
    /// received after it. It must not block.
    pub fn request_with<T, F>(&self, kind: MessageType, body: &T, on_response: F) -> Result<(), TransportError>
    where
        T: Serialize,
        F: FnOnce(Result<Value, SyncError>) + Send + 'static,
    {
        let envelope = Envelope::with_body(kind, body)?;
        self.enqueue(envelope, Route::Callback(Box::new(on_response)))
    }

    /// Close for good. Open requests are rejected with a connection reset.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shared.set_status(ConnectionState::Closing);
        let command = Command::Close {
            code,
            reason: reason.into(),
        };
        if self.commands.send(command).is_err() {
            self.shared.set_status(ConnectionState::Closed);
        }
    }

    fn enqueue_request(&self, envelope: Envelope) -> Result<oneshot::Receiver<Result<Value, SyncError>>, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(envelope, Route::Waiter(tx))?;
        Ok(rx)
    }

    fn enqueue(&self, envelope: Envelope, route: Route) -> Result<(), TransportError> {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.messages.prepare_with_route(envelope, route);
        }
        self.flush()
    }

    fn flush(&self) -> Result<(), TransportError> {
        self.commands.send(Command::Flush).map_err(|_| TransportError::Closed)
    }
}

// =============================================================================
// REQUEST HANDLE
// =============================================================================

/// Call-site options for a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestFlags {
    /// Re-issue silently once reconnected instead of failing with a
    /// connection reset.
    pub ignore_connection_reset: bool,
}

impl RequestFlags {
    /// Flags for requests that are safe to repeat after a reset.
    pub const fn retry_on_reset() -> Self {
        Self {
            ignore_connection_reset: true,
        }
    }
}

/// Where a request stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// No response yet.
    Pending,
    /// Answered with data.
    Resolved,
    /// Answered with an error, or given up on.
    Rejected,
}

/// A request in flight: `{state, value, flags}`.
pub struct RequestHandle {
    transport: SessionTransport,
    envelope: Envelope,
    receiver: oneshot::Receiver<Result<Value, SyncError>>,
    state: RequestState,
    value: Option<Result<Value, SyncError>>,
    flags: RequestFlags,
}

impl RequestHandle {
    /// Current state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Result, once settled.
    pub fn value(&self) -> Option<&Result<Value, SyncError>> {
        self.value.as_ref()
    }

    /// Options the request was sent with.
    pub fn flags(&self) -> RequestFlags {
        self.flags
    }

    /// Wait for the response.
    ///
    /// With [`RequestFlags::ignore_connection_reset`], a reset re-issues the
    /// request once the transport is open again, up to
    /// [`MAX_RESET_RETRIES`] times.
    pub async fn wait(&mut self) -> Result<Value, SyncError> {
        if let Some(value) = &self.value {
            return value.clone();
        }

        let mut retries = 0;
        let result = loop {
            let result = (&mut self.receiver)
                .await
                .unwrap_or(Err(SyncError::ConnectionReset));
            match result {
                Err(SyncError::ConnectionReset)
                    if self.flags.ignore_connection_reset && retries < MAX_RESET_RETRIES =>
                {
                    retries += 1;
                    if self.transport.wait_open().await.is_err() {
                        break Err(SyncError::ConnectionReset);
                    }
                    debug!(kind = ?self.envelope.kind, retries, "re-issuing request after reset");
                    match self.transport.enqueue_request(self.envelope.clone()) {
                        Ok(receiver) => self.receiver = receiver,
                        Err(e) => break Err(e.into()),
                    }
                }
                other => break other,
            }
        };

        self.state = if result.is_ok() {
            RequestState::Resolved
        } else {
            RequestState::Rejected
        };
        self.value = Some(result.clone());
        result
    }

    /// Wait and decode the response data.
    pub async fn wait_as<T: DeserializeOwned>(&mut self) -> Result<T, SyncError> {
        let value = self.wait().await?;
        Ok(serde_json::from_value(value)?)
    }
}

// =============================================================================
// BACKGROUND TASK
// =============================================================================

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: ConnectionState) {
        self.status.send_replace(status);
    }

    /// First message on a fresh socket.
    fn hello(&self) -> Result<Envelope, TransportError> {
        let mut state = self.lock();
        state.identified = false;
        state.sent_through = 0;
        let env = match state.messages.session_id() {
            Some(id) => Envelope::with_body(
                MessageType::Resume,
                &ResumeBody {
                    session_id: id.to_owned(),
                },
            )?,
            None => Envelope::with_body(MessageType::Open, &OpenBody { version: PROTOCOL_VERSION })?,
        };
        Ok(state.messages.prepare(env))
    }

    /// Everything queued since the last write.
    fn outgoing(&self) -> Vec<Envelope> {
        let mut state = self.lock();
        if !state.identified {
            return Vec::new();
        }
        let after = state.sent_through;
        let mut writes = state.messages.pending_after(after);
        state.sent_through = state.messages.last_sent_id();
        for env in std::mem::take(&mut state.unsequenced) {
            writes.push(state.messages.prepare(env));
        }
        writes
    }

    fn heartbeat(&self) -> Vec<Envelope> {
        let mut state = self.lock();
        if !state.identified {
            return Vec::new();
        }
        vec![state.messages.sync_message()]
    }

    fn on_text(&self, text: &str) -> Vec<Envelope> {
        let env = match Envelope::from_json(text) {
            Ok(env) => env,
            Err(e) => {
                warn!("dropping malformed message: {}", e);
                return Vec::new();
            }
        };

        let mut fx = Effects::default();
        {
            let mut state = self.lock();
            if let Some(server_time) = env.server_time() {
                state.clock.observe(server_time, Timestamp::now());
            }
            if env.kind == MessageType::Session {
                on_session(&mut state, &env, &mut fx);
            } else {
                on_message(&mut state, &env, &mut fx);
            }
        }
        self.apply(fx)
    }

    fn apply(&self, fx: Effects) -> Vec<Envelope> {
        if let Some(status) = fx.status {
            self.set_status(status);
        }
        // Listeners run before rejected routes wake their waiters, so a
        // reset's re-authorization is queued ahead of any retried request.
        for event in &fx.events {
            self.events.emit(event);
        }
        for (route, result) in fx.replies {
            route.resolve(result);
        }
        fx.writes
    }

    fn on_close(&self, code: u16, reason: String) -> Outcome {
        if is_terminal_close(code) {
            self.finish(code, reason);
            return Outcome::Finished;
        }
        self.lock().identified = false;
        info!(code, %reason, "connection closed, reconnecting");
        self.set_status(ConnectionState::Connecting);
        self.events.emit(&TransportEvent::Close {
            code,
            reason,
            terminal: false,
        });
        Outcome::Reconnect
    }

    fn finish(&self, code: u16, reason: String) {
        let routes = {
            let mut state = self.lock();
            state.closed = true;
            state.identified = false;
            state.messages.drain_routes()
        };
        info!(code, %reason, "transport closed");
        self.set_status(ConnectionState::Closed);
        self.events.emit(&TransportEvent::Close {
            code,
            reason,
            terminal: true,
        });
        for route in routes {
            route.resolve(Err(SyncError::ConnectionReset));
        }
    }
}

fn on_session(state: &mut TransportState, env: &Envelope, fx: &mut Effects) {
    let body: SessionBody = match env.body_as() {
        Ok(body) => body,
        Err(e) => {
            warn!("malformed session reply: {}", e);
            return;
        }
    };
    let ack = env.ack.unwrap_or(0);

    let resumed = match state.messages.session_id().map(str::to_owned) {
        Some(current) if current == body.session_id => {
            state.messages.prune(ack);
            fx.writes = state.messages.pending_after(ack);
            fx.writes.push(state.messages.sync_message());
            fx.events.push(TransportEvent::Resume);
            info!(session_id = %current, resent = fx.writes.len() - 1, "session resumed");
            true
        }
        Some(previous) => {
            let (stale_outbox, routes) = state.messages.reset(body.session_id.clone());
            info!(
                previous = %previous,
                session_id = %body.session_id,
                stale = stale_outbox.len(),
                "session reset"
            );
            fx.replies = routes
                .into_iter()
                .map(|route| (route, Err(SyncError::ConnectionReset)))
                .collect();
            fx.events.push(TransportEvent::Reset { stale_outbox });
            false
        }
        None => {
            state.messages.set_session_id(body.session_id.clone());
            state.messages.prune(ack);
            fx.writes = state.messages.pending_after(ack);
            info!(session_id = %body.session_id, "session opened");
            false
        }
    };

    state.identified = true;
    state.sent_through = state.messages.last_sent_id();
    for queued in std::mem::take(&mut state.unsequenced) {
        fx.writes.push(state.messages.prepare(queued));
    }
    fx.status = Some(ConnectionState::Open);
    fx.events.push(TransportEvent::Open {
        session_id: body.session_id,
        resumed,
    });
}

fn on_message(state: &mut TransportState, env: &Envelope, fx: &mut Effects) {
    match state.messages.receive(env) {
        Inbound::Duplicate => debug!(id = ?env.id, "dropping duplicate {:?}", env.kind),
        Inbound::Gap => {
            debug!(id = ?env.id, expected = state.messages.last_received_id() + 1, "gap, asking for resend");
            if state.identified {
                fx.writes.push(state.messages.sync_message());
            }
        }
        Inbound::Apply => match env.kind {
            MessageType::Response => match env.body_as::<ResponseBody>() {
                Ok(response) => match state.messages.take_route(response.request_id) {
                    Some(route) => fx.replies.push((route, response.into_result())),
                    None => debug!(request_id = response.request_id, "response nobody waits for"),
                },
                Err(e) => warn!("malformed response: {}", e),
            },
            MessageType::Event => match env.body_as::<EventBody>() {
                Ok(body) => fx.events.push(TransportEvent::Event(body)),
                Err(e) => warn!("malformed event: {}", e),
            },
            other => debug!("ignoring sequenced {:?}", other),
        },
        Inbound::Unsequenced => match env.kind {
            MessageType::Sync => {
                if state.identified {
                    fx.writes = state.messages.pending_after(env.ack.unwrap_or(0));
                }
            }
            MessageType::Error => match env.body_as::<ErrorBody>() {
                Ok(body) => fx.events.push(TransportEvent::Error(body)),
                Err(e) => warn!("malformed error report: {}", e),
            },
            other => debug!("ignoring {:?}", other),
        },
    }
}

#[instrument(skip_all, fields(url = %shared.config.url))]
async fn run(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut backoff = shared.config.initial_backoff;

    loop {
        shared.set_status(ConnectionState::Connecting);
        match connect_async(shared.config.url.as_str()).await {
            Ok((ws_stream, _)) => {
                debug!("socket connected");
                backoff = shared.config.initial_backoff;
                if let Outcome::Finished = drive(&shared, ws_stream, &mut commands).await {
                    return;
                }
            }
            Err(e) => warn!("connect failed: {}", e),
        }

        let delay = sleep(backoff);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => break,
                command = commands.recv() => match command {
                    Some(Command::Flush) => {}
                    Some(Command::Close { code, reason }) => {
                        shared.finish(code, reason);
                        return;
                    }
                    None => {
                        shared.finish(CLOSE_NORMAL, "Transport dropped".into());
                        return;
                    }
                }
            }
        }
        backoff = (backoff * 2).min(shared.config.max_backoff);
    }
}

async fn drive<S>(shared: &Shared, ws_stream: S, commands: &mut mpsc::UnboundedReceiver<Command>) -> Outcome
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let (mut sink, mut stream) = ws_stream.split();

    let hello = match shared.hello() {
        Ok(hello) => hello,
        Err(e) => {
            warn!("cannot build handshake: {}", e);
            return Outcome::Reconnect;
        }
    };
    if let Err(e) = write_all(&mut sink, vec![hello]).await {
        return shared.on_close(CLOSE_ABNORMAL, e.to_string());
    }

    let heartbeat = sleep(shared.config.heartbeat);
    tokio::pin!(heartbeat);

    loop {
        let outgoing = tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.on_text(&text),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((CLOSE_ABNORMAL, String::new()));
                    return shared.on_close(code, reason);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return shared.on_close(CLOSE_ABNORMAL, e.to_string()),
                None => return shared.on_close(CLOSE_ABNORMAL, "Connection lost".into()),
            },
            command = commands.recv() => match command {
                Some(Command::Flush) => shared.outgoing(),
                Some(Command::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    shared.finish(code, reason);
                    return Outcome::Finished;
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    shared.finish(CLOSE_NORMAL, "Transport dropped".into());
                    return Outcome::Finished;
                }
            },
            _ = &mut heartbeat => {
                heartbeat.as_mut().reset(Instant::now() + shared.config.heartbeat);
                shared.heartbeat()
            }
        };

        if outgoing.is_empty() {
            continue;
        }
        if let Err(e) = write_all(&mut sink, outgoing).await {
            return shared.on_close(CLOSE_ABNORMAL, e.to_string());
        }
        heartbeat.as_mut().reset(Instant::now() + shared.config.heartbeat);
    }
}

async fn write_all<S>(sink: &mut S, envelopes: Vec<Envelope>) -> Result<(), TransportError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    for env in envelopes {
        sink.feed(Message::Text(env.to_json()?)).await?;
    }
    sink.flush().await?;
    Ok(())
}
