//! Multi-client WebSocket listener.
//!
//! Many clients connect concurrently; each runs in its own task. Inbound
//! `cmd` envelopes are dispatched independently and their responses written
//! back only to the originating session, while broadcast envelopes
//! (telemetry events, client logs/events) fan out to every connected
//! session through the broker's broadcast channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use devbus_core::{decode, encode, Envelope};

use crate::broker::Broker;
use crate::transport::{decode_error_response, TransportError};

/// Runtime info about one connected WebSocket session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    pub connected_at: std::time::Instant,
}

/// In-memory registry of live sessions, shared by all session tasks.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<Uuid, SessionInfo>,
}

impl SessionRegistry {
    pub fn insert(&mut self, id: Uuid, info: SessionInfo) {
        self.sessions.insert(id, info);
    }

    pub fn remove(&mut self, id: &Uuid) {
        self.sessions.remove(id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// The multi-client WebSocket listener.
pub struct WsListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<Mutex<SessionRegistry>>,
}

impl WsListener {
    /// Binds the TCP listener backing the WebSocket endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] when binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::BindFailed { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::BindFailed { addr, source })?;
        Ok(Self {
            listener,
            local_addr,
            registry: Arc::new(Mutex::new(SessionRegistry::default())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the accept loop until `running` is cleared.
    pub async fn run(self, broker: Arc<Broker>, running: Arc<AtomicBool>) {
        info!("websocket listener on {}", self.local_addr);

        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; websocket accept loop stopping");
                break;
            }

            match timeout(Duration::from_millis(200), self.listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    let broker = Arc::clone(&broker);
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        handle_session(stream, peer, broker, registry).await;
                    });
                }
                Ok(Err(e)) => {
                    warn!("websocket accept error: {e}");
                }
                Err(_) => {
                    // Accept timeout; re-check the shutdown flag.
                }
            }
        }
    }
}

/// Runs the complete lifecycle of one client session: WebSocket handshake,
/// registration, the request/broadcast loop, and deregistration.
async fn handle_session(
    raw_stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    registry: Arc<Mutex<SessionRegistry>>,
) {
    let ws_stream = match accept_async(raw_stream).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("websocket handshake with {peer} failed: {e}");
            return;
        }
    };

    let session_id = Uuid::new_v4();
    {
        let mut reg = registry.lock().await;
        reg.insert(
            session_id,
            SessionInfo {
                peer,
                connected_at: std::time::Instant::now(),
            },
        );
        info!("websocket session {session_id} from {peer} ({} connected)", reg.len());
    }

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let mut events = broker.subscribe_events();

    loop {
        tokio::select! {
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        let response = match decode(text.as_bytes()) {
                            Ok(envelope) => broker.handle_envelope(&envelope).await,
                            Err(e) => {
                                debug!("session {session_id}: undecodable frame: {e}");
                                decode_error_response(&broker, &e)
                            }
                        };
                        if send_envelope(&mut ws_tx, &response).await.is_err() {
                            warn!("session {session_id}: response write failed; closing");
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        // The envelope protocol is text-only on this transport.
                        warn!("session {session_id}: unexpected binary frame (ignored)");
                    }
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                        // Protocol-level frames; tungstenite answers pings itself.
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!("session {session_id}: close frame received");
                        break;
                    }
                    Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) => {
                        debug!("session {session_id}: connection closed");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("session {session_id}: websocket error: {e}");
                        break;
                    }
                    None => {
                        debug!("session {session_id}: stream ended");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(envelope) => {
                        if send_envelope(&mut ws_tx, &envelope).await.is_err() {
                            debug!("session {session_id}: broadcast write failed; closing");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The session fell behind the broadcast stream; drop
                        // the missed events and keep the session alive.
                        warn!("session {session_id}: lagged, skipped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("session {session_id}: broadcast channel closed");
                        break;
                    }
                }
            }
        }
    }

    {
        let mut reg = registry.lock().await;
        reg.remove(&session_id);
        info!("websocket session {session_id} ended ({} connected)", reg.len());
    }
}

async fn send_envelope<S>(sink: &mut S, envelope: &Envelope) -> Result<(), ()>
where
    S: SinkExt<WsMessage> + Unpin,
{
    let bytes = match encode(envelope) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("envelope encode failed: {e}");
            return Err(());
        }
    };
    let text = String::from_utf8_lossy(&bytes).into_owned();
    sink.send(WsMessage::Text(text)).await.map_err(|_| ())
}
