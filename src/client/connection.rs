//! Connection Manager
//!
//! Owns one [`SessionTransport`] per server endpoint. Built once at startup
//! and passed by reference to whatever needs a connection.
//!
//! Concurrent `authorize` calls for the same endpoint and token share one
//! request. The last successful token is kept so the session can be
//! re-authorized when the server hands out a fresh one after a reset.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::{info, warn};

use crate::client::transport::{RequestFlags, SessionTransport, TransportConfig, TransportEvent};
use crate::core::error::SyncError;
use crate::network::protocol::{AuthorizeBody, Authorized, MessageType, CLOSE_SHUTDOWN};

type Authorization = Shared<BoxFuture<'static, Result<Authorized, SyncError>>>;

#[derive(Default)]
struct Registry {
    transports: BTreeMap<String, SessionTransport>,
    tokens: BTreeMap<String, String>,
    authorizing: BTreeMap<(String, String), Authorization>,
}

/// Transports by endpoint.
pub struct ConnectionManager {
    template: TransportConfig,
    registry: Arc<Mutex<Registry>>,
}

impl ConnectionManager {
    /// Create a manager; `template` supplies every setting but the url.
    pub fn new(template: TransportConfig) -> Self {
        Self {
            template,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Transport for `url`, opened on first use.
    pub fn transport(&self, url: &str) -> SessionTransport {
        let mut registry = lock(&self.registry);
        if let Some(transport) = registry.transports.get(url).filter(|t| !t.is_closed()) {
            return transport.clone();
        }

        let config = TransportConfig {
            url: url.to_string(),
            ..self.template.clone()
        };
        let transport = SessionTransport::open(config);
        // Registered before any other listener so the re-authorization is
        // queued ahead of rejoins.
        self.reauthorize_on_reset(&transport);
        registry.transports.insert(url.to_string(), transport.clone());
        transport
    }

    /// Authorize the session on `url` with `token`.
    pub async fn authorize(&self, url: &str, token: &str) -> Result<Authorized, SyncError> {
        let key = (url.to_string(), token.to_string());
        let transport = self.transport(url);
        let authorization = lock(&self.registry)
            .authorizing
            .entry(key.clone())
            .or_insert_with(|| {
                let body = AuthorizeBody {
                    token: token.to_string(),
                };
                async move {
                    transport
                        .request(MessageType::Authorize, &body, RequestFlags::retry_on_reset())?
                        .wait_as::<Authorized>()
                        .await
                }
                .boxed()
                .shared()
            })
            .clone();

        let result = authorization.await;

        let mut registry = lock(&self.registry);
        registry.authorizing.remove(&key);
        if let Ok(authorized) = &result {
            info!(url, player_id = %authorized.player_id, "authorized");
            registry.tokens.insert(key.0, key.1);
        }
        result
    }

    /// Number of open endpoints.
    pub fn len(&self) -> usize {
        lock(&self.registry).transports.len()
    }

    /// Whether no endpoint is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget the transport for `url`.
    pub fn disconnect(&self, url: &str) {
        let removed = {
            let mut registry = lock(&self.registry);
            registry.tokens.remove(url);
            registry.transports.remove(url)
        };
        if let Some(transport) = removed {
            transport.close(CLOSE_SHUTDOWN, "Disconnected");
        }
    }

    /// Close every transport.
    pub fn close_all(&self) {
        let transports = std::mem::take(&mut lock(&self.registry).transports);
        for transport in transports.into_values() {
            transport.close(CLOSE_SHUTDOWN, "Client shutting down");
        }
    }

    fn reauthorize_on_reset(&self, transport: &SessionTransport) {
        let weak = transport.downgrade();
        let registry = Arc::downgrade(&self.registry);
        let url = transport.url().to_string();

        transport.events().on(move |event| {
            let TransportEvent::Reset { .. } = event else { return };
            let (Some(transport), Some(registry)) = (weak.upgrade(), registry.upgrade()) else {
                return;
            };
            let Some(token) = lock(&registry).tokens.get(&url).cloned() else {
                return;
            };

            match transport.request(MessageType::Authorize, &AuthorizeBody { token }, RequestFlags::default()) {
                Ok(mut handle) => {
                    let url = url.clone();
                    tokio::spawn(async move {
                        match handle.wait_as::<Authorized>().await {
                            Ok(authorized) => info!(url = %url, player_id = %authorized.player_id, "re-authorized after reset"),
                            Err(e) => warn!(url = %url, "re-authorization failed: {}", e),
                        }
                    });
                }
                Err(e) => warn!(url = %url, "cannot re-authorize: {}", e),
            }
        });
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::{
        Envelope, MessageId, ResponseBody, SessionBody, CLOSE_IDLE_TIMEOUT, PROTOCOL_VERSION,
    };
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{accept_async, WebSocketStream};

    type ServerWs = WebSocketStream<TcpStream>;

    async fn listen() -> (TcpListener, ConnectionManager, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let mut template = TransportConfig::new("");
        template.heartbeat = Duration::from_secs(30);
        template.initial_backoff = Duration::from_millis(20);
        (listener, ConnectionManager::new(template), url)
    }

    async fn accept(listener: &TcpListener) -> ServerWs {
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept()).await.unwrap().unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn recv(ws: &mut ServerWs) -> Envelope {
        loop {
            let frame = timeout(Duration::from_secs(5), ws.next()).await.unwrap();
            if let Message::Text(text) = frame.unwrap().unwrap() {
                return Envelope::from_json(&text).unwrap();
            }
        }
    }

    async fn send(ws: &mut ServerWs, env: Envelope) {
        ws.send(Message::Text(env.to_json().unwrap())).await.unwrap();
    }

    async fn handshake(ws: &mut ServerWs, session_id: &str) {
        recv(ws).await;
        let env = Envelope::with_body(
            MessageType::Session,
            &SessionBody {
                session_id: session_id.into(),
                version: PROTOCOL_VERSION,
            },
        )
        .unwrap();
        send(ws, env).await;
    }

    async fn authorize_reply(ws: &mut ServerWs, id: MessageId, request_id: MessageId) {
        let mut env = Envelope::with_body(
            MessageType::Response,
            &ResponseBody::from_result(request_id, Ok(json!({"playerId": "p1"}))),
        )
        .unwrap();
        env.id = Some(id);
        send(ws, env).await;
    }

    #[tokio::test]
    async fn test_transport_is_shared_per_endpoint() {
        let (_listener, manager, url) = listen().await;
        let a = manager.transport(&url);
        let b = manager.transport(&url);
        assert_eq!(manager.len(), 1);
        assert_eq!(a.url(), b.url());

        manager.disconnect(&url);
        assert!(manager.is_empty());
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_authorize_is_coalesced() {
        let (listener, manager, url) = listen().await;

        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            handshake(&mut ws, "s1").await;
            let first = recv(&mut ws).await;
            assert_eq!(first.kind, MessageType::Authorize);
            // Nothing else arrives while the first is unanswered.
            assert!(timeout(Duration::from_millis(200), ws.next()).await.is_err());
            authorize_reply(&mut ws, 1, first.id.unwrap()).await;
            ws
        });

        let (a, b) = tokio::join!(manager.authorize(&url, "token"), manager.authorize(&url, "token"));
        assert_eq!(a.unwrap().player_id, "p1");
        assert_eq!(b.unwrap().player_id, "p1");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_reauthorizes_with_last_token() {
        let (listener, manager, url) = listen().await;

        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            handshake(&mut ws, "s1").await;
            let auth = recv(&mut ws).await;
            authorize_reply(&mut ws, 1, auth.id.unwrap()).await;
            let frame = CloseFrame {
                code: CloseCode::from(CLOSE_IDLE_TIMEOUT),
                reason: "".into(),
            };
            ws.close(Some(frame)).await.unwrap();

            let mut ws = accept(&listener).await;
            handshake(&mut ws, "s2").await;
            let again = recv(&mut ws).await;
            assert_eq!(again.kind, MessageType::Authorize);
            assert_eq!(again.id, Some(1));
            assert_eq!(again.body_as::<AuthorizeBody>().unwrap().token, "secret-token");
        });

        manager.authorize(&url, "secret-token").await.unwrap();
        timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    }
}
