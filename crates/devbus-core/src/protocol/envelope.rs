//! The devbus wire envelope.
//!
//! Every message exchanged between a client and the broker is one envelope,
//! serialized as a compact JSON object with the fixed field set:
//!
//! ```json
//! {"v":1,"t":"cmd","id":"cli-7","src":"cli","ts":1719334455.201,"d":{"action":"gpio_get","pin":17}}
//! ```
//!
//! The short wire keys (`v`, `t`, `id`, `src`, `ts`, `d`) are part of the
//! protocol contract; the Rust struct uses descriptive names and maps them
//! via serde renames.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current protocol version. Envelopes carrying any other value are rejected
/// before routing.
pub const PROTOCOL_VERSION: u8 = 1;

// ── Envelope kind ─────────────────────────────────────────────────────────────

/// The four envelope types defined by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Structured log record from a client.
    #[serde(rename = "log")]
    Log,
    /// Command to be dispatched by the router.
    #[serde(rename = "cmd")]
    Cmd,
    /// Asynchronous event (client-emitted or broker telemetry broadcast).
    #[serde(rename = "evt")]
    Event,
    /// Response correlated to a previously sent envelope.
    #[serde(rename = "res")]
    Response,
}

impl EnvelopeKind {
    /// Returns the wire string for this kind (`log`, `cmd`, `evt`, `res`).
    pub fn as_wire(&self) -> &'static str {
        match self {
            EnvelopeKind::Log => "log",
            EnvelopeKind::Cmd => "cmd",
            EnvelopeKind::Event => "evt",
            EnvelopeKind::Response => "res",
        }
    }

    /// Parses a wire string into a kind. Returns `None` for anything outside
    /// the four enumerated values.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "log" => Some(EnvelopeKind::Log),
            "cmd" => Some(EnvelopeKind::Cmd),
            "evt" => Some(EnvelopeKind::Event),
            "res" => Some(EnvelopeKind::Response),
            _ => None,
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A single protocol message.
///
/// `id` must be unique within the lifetime of the connection that created the
/// envelope; use [`crate::EnvelopeIdGen`] rather than inventing ids ad hoc.
/// Responses echo the id of the envelope they answer, which is what lets a
/// client correlate them on a multiplexed transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version; always [`PROTOCOL_VERSION`] for envelopes we create.
    #[serde(rename = "v")]
    pub version: u8,
    /// Envelope type discriminant.
    #[serde(rename = "t")]
    pub kind: EnvelopeKind,
    /// Correlation id, unique per connection lifetime.
    pub id: String,
    /// Identity of the sender (client name, broker, connection id).
    #[serde(rename = "src")]
    pub source: String,
    /// Creation time, Unix seconds.
    #[serde(rename = "ts")]
    pub timestamp: f64,
    /// Type-specific payload object.
    #[serde(rename = "d", default)]
    pub data: Map<String, Value>,
}

impl Envelope {
    /// Creates an envelope with the current time as its timestamp.
    pub fn new(
        kind: EnvelopeKind,
        id: impl Into<String>,
        source: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            id: id.into(),
            source: source.into(),
            timestamp: now_unix_seconds(),
            data,
        }
    }

    /// Builds a `log` envelope with the conventional `level` / `msg` payload.
    pub fn log(
        id: impl Into<String>,
        source: impl Into<String>,
        level: &str,
        message: &str,
    ) -> Self {
        let mut data = Map::new();
        data.insert("level".into(), Value::String(level.to_string()));
        data.insert("msg".into(), Value::String(message.to_string()));
        Self::new(EnvelopeKind::Log, id, source, data)
    }

    /// Builds a `cmd` envelope. `params` are merged beside the `action` key.
    pub fn cmd(
        id: impl Into<String>,
        source: impl Into<String>,
        action: &str,
        params: Map<String, Value>,
    ) -> Self {
        let mut data = Map::new();
        data.insert("action".into(), Value::String(action.to_string()));
        data.extend(params);
        Self::new(EnvelopeKind::Cmd, id, source, data)
    }

    /// Builds an `evt` envelope. `data` is merged beside the `event` key.
    pub fn event(
        id: impl Into<String>,
        source: impl Into<String>,
        event: &str,
        data: Map<String, Value>,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("event".into(), Value::String(event.to_string()));
        payload.extend(data);
        Self::new(EnvelopeKind::Event, id, source, payload)
    }

    /// Builds a `res` envelope answering `request`, echoing its id.
    pub fn response_to(
        request: &Envelope,
        source: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self::new(EnvelopeKind::Response, request.id.clone(), source, data)
    }

    /// Returns the `action` payload field of a `cmd` envelope, if present.
    pub fn action(&self) -> Option<&str> {
        self.data.get("action").and_then(Value::as_str)
    }
}

/// Current time as fractional Unix seconds.
pub fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
