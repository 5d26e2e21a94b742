//! Client-side transports and request/response correlation.
//!
//! Two transport shapes, chosen once at construction (no runtime switch):
//!
//! - **Strict duplex** (TCP, newline-delimited JSON): the whole
//!   request/response cycle runs under one lock, so at most one request is
//!   in flight per connection and answers arrive in send order.
//! - **WebSocket**: requests are multiplexed; a background reader task
//!   resolves each pending request by the response's envelope id and fans
//!   broadcast envelopes (telemetry, other clients' events) out to
//!   subscribers.
//!
//! Every outbound request registers a [`PendingRequest`] with a deadline;
//! the record is destroyed on the matching response, on expiry (the caller
//! gets [`ClientError::Timeout`]), or when the connection closes (all
//! outstanding waits cancel immediately).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use uuid::Uuid;

use devbus_core::{
    decode, encode, DecodeError, EncodeError, Envelope, EnvelopeIdGen, EnvelopeKind, TraceBuffer,
};

/// Capacity of the client-side event fan-out channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Error type for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("connect to {endpoint} failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("request {id} timed out")]
    Timeout { id: String },

    #[error("broker error [{kind}]: {message}")]
    Broker { kind: String, message: String },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where and how to reach the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Strict request/reply TCP.
    Duplex(SocketAddr),
    /// Multi-client WebSocket URL (`ws://host:port`).
    WebSocket(String),
}

impl Endpoint {
    /// Parses `tcp://host:port`, a bare `host:port` (both duplex), or a
    /// `ws://` / `wss://` URL.
    pub fn parse(s: &str) -> Result<Self, ClientError> {
        if s.starts_with("ws://") || s.starts_with("wss://") {
            return Ok(Endpoint::WebSocket(s.to_string()));
        }
        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        addr.parse()
            .map(Endpoint::Duplex)
            .map_err(|_| ClientError::InvalidEndpoint(s.to_string()))
    }

    fn describe(&self) -> String {
        match self {
            Endpoint::Duplex(addr) => format!("tcp://{addr}"),
            Endpoint::WebSocket(url) => url.clone(),
        }
    }
}

/// Client configuration. `Default` is suitable for a local broker; set
/// `endpoint` before connecting.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    /// Source identity stamped on every envelope; defaults to a
    /// connection-unique `cli-<uuid>` string.
    pub source: String,
    /// Deadline for each request's matching response.
    pub request_timeout: Duration,
    /// Bounded connect retries before surfacing a terminal error.
    pub connect_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Capacity of the local trace buffer of sent envelopes.
    pub buffer_capacity: usize,
}

impl ClientConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            source: format!("cli-{}", Uuid::new_v4().simple()),
            request_timeout: Duration::from_secs(5),
            connect_attempts: 5,
            backoff_base: Duration::from_millis(200),
            buffer_capacity: 1024,
        }
    }
}

/// Ephemeral correlation record for one in-flight request.
struct PendingRequest {
    deadline: Instant,
    responder: oneshot::Sender<Envelope>,
}

type PendingMap = Arc<StdMutex<HashMap<String, PendingRequest>>>;
type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct DuplexIo {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

struct WsTransport {
    sink: Mutex<WsSink>,
    pending: PendingMap,
    events_tx: broadcast::Sender<Envelope>,
    reader_task: JoinHandle<()>,
}

enum Transport {
    // The mutex is the strict-duplex discipline: the whole request/response
    // cycle holds it, so one request is in flight at a time.
    Duplex(Mutex<DuplexIo>),
    WebSocket(WsTransport),
}

/// A connected devbus client.
pub struct BrokerClient {
    config: ClientConfig,
    ids: EnvelopeIdGen,
    buffer: Mutex<TraceBuffer>,
    transport: Transport,
}

impl BrokerClient {
    /// Connects to the configured endpoint, retrying with exponential
    /// backoff up to `connect_attempts` times.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::RetriesExhausted`] when every attempt fails.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let endpoint = config.endpoint.describe();
        let mut last_error = String::new();

        for attempt in 0..config.connect_attempts.max(1) {
            if attempt > 0 {
                let delay = config.backoff_base * 2u32.saturating_pow(attempt - 1);
                debug!("reconnect attempt {attempt} to {endpoint} in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            match Self::open_transport(&config).await {
                Ok(transport) => {
                    let ids = EnvelopeIdGen::new(config.source.clone());
                    let buffer = Mutex::new(TraceBuffer::new(config.buffer_capacity));
                    debug!("connected to {endpoint}");
                    return Ok(Self {
                        config,
                        ids,
                        buffer,
                        transport,
                    });
                }
                Err(e) => {
                    warn!("connect to {endpoint} failed: {e}");
                    last_error = e.to_string();
                }
            }
        }

        Err(ClientError::RetriesExhausted {
            endpoint,
            attempts: config.connect_attempts.max(1),
            last_error,
        })
    }

    async fn open_transport(config: &ClientConfig) -> Result<Transport, ClientError> {
        match &config.endpoint {
            Endpoint::Duplex(addr) => {
                let stream = TcpStream::connect(addr).await?;
                let (read_half, writer) = stream.into_split();
                Ok(Transport::Duplex(Mutex::new(DuplexIo {
                    reader: BufReader::new(read_half),
                    writer,
                })))
            }
            Endpoint::WebSocket(url) => {
                let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
                    .await
                    .map_err(|e| ClientError::ConnectionLost(e.to_string()))?;
                let (sink, source) = stream.split();
                let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
                let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
                let reader_task = tokio::spawn(ws_reader(
                    source,
                    Arc::clone(&pending),
                    events_tx.clone(),
                ));
                Ok(Transport::WebSocket(WsTransport {
                    sink: Mutex::new(sink),
                    pending,
                    events_tx,
                    reader_task,
                }))
            }
        }
    }

    /// The source identity stamped on outbound envelopes.
    pub fn source(&self) -> &str {
        self.ids.source()
    }

    /// Issues the next connection-unique envelope id.
    pub fn next_request_id(&self) -> String {
        self.ids.next_id()
    }

    /// Sends a `cmd` envelope and returns the correlated response payload.
    pub async fn request(
        &self,
        action: &str,
        params: serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, ClientError> {
        let envelope = Envelope::cmd(self.ids.next_id(), self.config.source.clone(), action, params);
        let response = self.send(envelope).await?;
        Ok(response.data)
    }

    /// Sends any envelope and awaits its correlated response.
    pub async fn send(&self, envelope: Envelope) -> Result<Envelope, ClientError> {
        self.buffer.lock().await.append(envelope.clone());

        match &self.transport {
            Transport::Duplex(io) => self.send_duplex(io, &envelope).await,
            Transport::WebSocket(ws) => self.send_ws(ws, &envelope).await,
        }
    }

    async fn send_duplex(
        &self,
        io: &Mutex<DuplexIo>,
        envelope: &Envelope,
    ) -> Result<Envelope, ClientError> {
        // One request in flight: the lock spans the whole cycle.
        let mut io = io.lock().await;

        let mut bytes = encode(envelope)?;
        bytes.push(b'\n');
        io.writer.write_all(&bytes).await?;
        io.writer.flush().await?;

        let deadline = Instant::now() + self.config.request_timeout;
        loop {
            let mut line = String::new();
            let read = timeout(
                deadline.saturating_duration_since(Instant::now()),
                io.reader.read_line(&mut line),
            )
            .await;

            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(ClientError::Io(e)),
                Err(_elapsed) => {
                    return Err(ClientError::Timeout {
                        id: envelope.id.clone(),
                    })
                }
            };
            if n == 0 {
                return Err(ClientError::ConnectionLost("peer closed".into()));
            }

            let response = decode(line.trim_end().as_bytes())?;
            if response.id == envelope.id {
                return Ok(response);
            }
            // A stale answer from an earlier timed-out request; skip it and
            // keep waiting for ours.
            debug!("discarding stale response {}", response.id);
        }
    }

    async fn send_ws(&self, ws: &WsTransport, envelope: &Envelope) -> Result<Envelope, ClientError> {
        let (responder, response_rx) = oneshot::channel();
        let deadline = Instant::now() + self.config.request_timeout;
        {
            let mut pending = ws.pending.lock().expect("pending map lock poisoned");
            pending.insert(
                envelope.id.clone(),
                PendingRequest {
                    deadline,
                    responder,
                },
            );
        }

        let bytes = encode(envelope)?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        {
            let mut sink = ws.sink.lock().await;
            if let Err(e) = sink.send(WsMessage::Text(text)).await {
                ws.pending
                    .lock()
                    .expect("pending map lock poisoned")
                    .remove(&envelope.id);
                return Err(ClientError::ConnectionLost(e.to_string()));
            }
        }

        match timeout(self.config.request_timeout, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_closed)) => Err(ClientError::ConnectionLost(
                "connection closed with request in flight".into(),
            )),
            Err(_elapsed) => {
                // Deadline expiry destroys the pending record.
                ws.pending
                    .lock()
                    .expect("pending map lock poisoned")
                    .remove(&envelope.id);
                Err(ClientError::Timeout {
                    id: envelope.id.clone(),
                })
            }
        }
    }

    /// Broadcast envelopes pushed by the broker (telemetry, other clients'
    /// events). Only the WebSocket transport carries them.
    pub fn subscribe_events(&self) -> Option<broadcast::Receiver<Envelope>> {
        match &self.transport {
            Transport::Duplex(_) => None,
            Transport::WebSocket(ws) => Some(ws.events_tx.subscribe()),
        }
    }

    /// The last `n` envelopes this client sent, newest last.
    pub async fn recent(&self, n: usize) -> Vec<Envelope> {
        self.buffer.lock().await.recent(n)
    }

    /// Closes the connection, cancelling all outstanding waits.
    pub async fn close(self) {
        if let Transport::WebSocket(ws) = self.transport {
            ws.reader_task.abort();
            // Dropping the responders wakes every in-flight caller with
            // ConnectionLost.
            ws.pending
                .lock()
                .expect("pending map lock poisoned")
                .clear();
        }
    }
}

/// Background reader for the WebSocket transport: resolves pending requests
/// by envelope id and fans out broadcast envelopes.
async fn ws_reader(mut source: WsSource, pending: PendingMap, events_tx: broadcast::Sender<Envelope>) {
    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("websocket read error: {e}");
                break;
            }
        };
        match decode(text.as_bytes()) {
            Ok(envelope) => match envelope.kind {
                EnvelopeKind::Response => {
                    let responder = pending
                        .lock()
                        .expect("pending map lock poisoned")
                        .remove(&envelope.id);
                    match responder {
                        Some(request) => {
                            if Instant::now() > request.deadline {
                                debug!("response {} arrived after its deadline", envelope.id);
                            }
                            let _ = request.responder.send(envelope);
                        }
                        None => debug!("unmatched response {}", envelope.id),
                    }
                }
                EnvelopeKind::Event | EnvelopeKind::Log => {
                    let _ = events_tx.send(envelope);
                }
                EnvelopeKind::Cmd => {
                    debug!("ignoring inbound cmd envelope {}", envelope.id);
                }
            },
            Err(e) => warn!("undecodable broadcast frame: {e}"),
        }
    }

    // Connection gone: destroy every pending record so callers wake now
    // instead of waiting out their deadlines.
    pending
        .lock()
        .expect("pending map lock poisoned")
        .clear();
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parses_tcp_scheme() {
        let endpoint = Endpoint::parse("tcp://127.0.0.1:5555").unwrap();
        assert_eq!(endpoint, Endpoint::Duplex("127.0.0.1:5555".parse().unwrap()));
    }

    #[test]
    fn test_endpoint_parses_bare_socket_addr() {
        let endpoint = Endpoint::parse("127.0.0.1:5555").unwrap();
        assert!(matches!(endpoint, Endpoint::Duplex(_)));
    }

    #[test]
    fn test_endpoint_parses_websocket_url() {
        let endpoint = Endpoint::parse("ws://localhost:8080").unwrap();
        assert_eq!(endpoint, Endpoint::WebSocket("ws://localhost:8080".into()));
    }

    #[test]
    fn test_endpoint_rejects_garbage() {
        assert!(matches!(
            Endpoint::parse("not an endpoint"),
            Err(ClientError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new(Endpoint::parse("127.0.0.1:5555").unwrap());
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.connect_attempts, 5);
        assert!(config.source.starts_with("cli-"));
    }

    #[tokio::test]
    async fn test_connect_to_dead_endpoint_exhausts_retries() {
        // Port 1 on localhost is essentially guaranteed closed.
        let mut config = ClientConfig::new(Endpoint::parse("127.0.0.1:1").unwrap());
        config.connect_attempts = 2;
        config.backoff_base = Duration::from_millis(10);

        let started = std::time::Instant::now();
        let result = BrokerClient::connect(config).await;
        match result {
            Err(ClientError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected RetriesExhausted, got {:?}", other.err()),
        }
        // One backoff delay (10 ms) between the two attempts.
        assert!(started.elapsed() >= Duration::from_millis(10));
    }
}
