//! The broker context object.
//!
//! One `Broker` owns everything the transports share: the router (and
//! through it the device models), the trace buffer, the event broadcast
//! channel, and the process counters. Listeners hold it behind an `Arc`;
//! there is no process-global state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use devbus_core::{Envelope, EnvelopeIdGen, EnvelopeKind, TraceBuffer};

use crate::config::{BrokerConfig, ConfigError};
use crate::devices::{
    AudioBus, GpioBus, I2cBus, Rs485Bus, SimulatedAudio, SimulatedGpio, SimulatedI2c,
    SimulatedRs485,
};
use crate::router::{DeviceSet, Router};

/// Capacity of the event broadcast channel feeding WebSocket sessions.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shared broker state. See the module docs.
pub struct Broker {
    config: BrokerConfig,
    router: Router,
    buffer: Arc<Mutex<TraceBuffer>>,
    ids: EnvelopeIdGen,
    events_tx: broadcast::Sender<Envelope>,
    started: Instant,
    messages_processed: AtomicU64,
    errors: AtomicU64,
}

impl Broker {
    /// Builds the broker: validates configuration, provisions the simulated
    /// device set (each bus seeded deterministically from the configured
    /// seed), and wires the router over the shared trace buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for invalid configuration; this is the only
    /// fatal error path in the broker.
    pub fn new(config: BrokerConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let buffer = Arc::new(Mutex::new(TraceBuffer::new(config.broker.buffer_capacity)));
        let seed = config.broker.seed;
        let threshold = config.broker.degraded_threshold;

        // Distinct derived seeds keep the buses' jitter streams independent
        // while staying reproducible from the single configured seed.
        let devices = DeviceSet {
            gpio: config
                .devices
                .gpio
                .enabled
                .then(|| Box::new(SimulatedGpio::new(threshold)) as Box<dyn GpioBus>),
            i2c: config
                .devices
                .i2c
                .enabled
                .then(|| Box::new(SimulatedI2c::new(seed, threshold)) as Box<dyn I2cBus>),
            i2s: config
                .devices
                .i2s
                .enabled
                .then(|| {
                    Box::new(SimulatedAudio::new(seed.wrapping_add(1), threshold))
                        as Box<dyn AudioBus>
                }),
            rs485: config
                .devices
                .rs485
                .enabled
                .then(|| {
                    Box::new(SimulatedRs485::new(seed.wrapping_add(2), threshold))
                        as Box<dyn Rs485Bus>
                }),
        };

        let router = Router::new(devices, Arc::clone(&buffer), config.request_timeout());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let ids = EnvelopeIdGen::new(config.broker.name.clone());

        info!(
            seed,
            timeout_ms = config.broker.request_timeout_ms,
            buffer_capacity = config.broker.buffer_capacity,
            "broker initialized"
        );

        Ok(Self {
            config,
            router,
            buffer,
            ids,
            events_tx,
            started: Instant::now(),
            messages_processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    /// The broker's source identity for outbound envelopes.
    pub fn source(&self) -> &str {
        self.ids.source()
    }

    /// Issues a broker-unique envelope id.
    pub fn next_id(&self) -> String {
        self.ids.next_id()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Processes one inbound envelope and returns the response to write
    /// back. Both transports funnel through here.
    pub async fn handle_envelope(&self, envelope: &Envelope) -> Envelope {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);

        let response = match envelope.kind {
            EnvelopeKind::Cmd => {
                // The health query is answered from broker state directly;
                // it does not go through the router's action table.
                if envelope.action() == Some("health") {
                    Envelope::response_to(envelope, self.source(), self.health_payload().await)
                } else {
                    self.router.dispatch(envelope, self.source()).await
                }
            }
            EnvelopeKind::Log => {
                debug!(source = %envelope.source, "log envelope received");
                self.publish(envelope.clone()).await;
                Envelope::response_to(envelope, self.source(), status_ok())
            }
            EnvelopeKind::Event => {
                debug!(source = %envelope.source, "event envelope received");
                self.publish(envelope.clone()).await;
                Envelope::response_to(envelope, self.source(), status_ok())
            }
            EnvelopeKind::Response => {
                // Clients do not answer the broker on these transports.
                let mut error = Map::new();
                error.insert("kind".into(), Value::from("invalid_request"));
                error.insert(
                    "message".into(),
                    Value::from("unexpected envelope type \"res\""),
                );
                let mut payload = Map::new();
                payload.insert("status".into(), Value::from("error"));
                payload.insert("error".into(), Value::Object(error));
                Envelope::response_to(envelope, self.source(), payload)
            }
        };

        if response.data.get("status").and_then(Value::as_str) == Some("error") {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        response
    }

    /// Appends an envelope to the trace buffer and broadcasts it to every
    /// connected multi-client session.
    pub async fn publish(&self, envelope: Envelope) {
        self.buffer.lock().await.append(envelope.clone());
        // A send error only means no session is currently subscribed.
        let _ = self.events_tx.send(envelope);
    }

    /// Subscribes to the broadcast stream (telemetry, client logs/events).
    pub fn subscribe_events(&self) -> broadcast::Receiver<Envelope> {
        self.events_tx.subscribe()
    }

    /// The last `n` envelopes seen by the broker, newest last.
    pub async fn recent(&self, n: usize) -> Vec<Envelope> {
        self.buffer.lock().await.recent(n)
    }

    /// Process status plus per-device connection state.
    pub async fn health_payload(&self) -> Map<String, Value> {
        let devices = self.router.device_health().await;
        let mut payload = status_ok();
        payload.insert(
            "uptime_secs".into(),
            Value::from(self.started.elapsed().as_secs_f64()),
        );
        payload.insert(
            "messages_processed".into(),
            Value::from(self.messages_processed.load(Ordering::Relaxed)),
        );
        payload.insert(
            "errors".into(),
            Value::from(self.errors.load(Ordering::Relaxed)),
        );
        payload.insert(
            "devices".into(),
            serde_json::to_value(devices).unwrap_or_default(),
        );
        payload
    }
}

fn status_ok() -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("status".into(), Value::from("ok"));
    payload
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_broker() -> Broker {
        let mut config = BrokerConfig::default();
        config.broker.seed = 42;
        Broker::new(config).expect("broker must build from defaults")
    }

    fn cmd(action: &str, pairs: &[(&str, Value)]) -> Envelope {
        let params: Map<String, Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Envelope::cmd(format!("t-{action}"), "test", action, params)
    }

    #[tokio::test]
    async fn test_health_query_bypasses_action_table() {
        let broker = test_broker();
        let request = cmd("health", &[]);
        let response = broker.handle_envelope(&request).await;

        assert_eq!(response.kind, EnvelopeKind::Response);
        assert_eq!(response.data.get("status"), Some(&Value::from("ok")));
        let devices = response.data.get("devices").and_then(Value::as_array).unwrap();
        assert_eq!(devices.len(), 4, "all four buses report health");
    }

    #[tokio::test]
    async fn test_log_envelope_is_acknowledged_and_buffered() {
        let broker = test_broker();
        let log = Envelope::log("cli-1", "cli", "info", "hello");
        let response = broker.handle_envelope(&log).await;

        assert_eq!(response.data.get("status"), Some(&Value::from("ok")));
        assert_eq!(response.id, "cli-1", "ack echoes the log id");

        let recent = broker.recent(10).await;
        assert!(recent.iter().any(|e| e.id == "cli-1"));
    }

    #[tokio::test]
    async fn test_event_envelope_reaches_subscribers() {
        let broker = test_broker();
        let mut events = broker.subscribe_events();

        let evt = Envelope::event("cli-2", "cli", "door_open", Map::new());
        broker.handle_envelope(&evt).await;

        let received = events.recv().await.expect("event must be broadcast");
        assert_eq!(received.id, "cli-2");
    }

    #[tokio::test]
    async fn test_inbound_response_envelope_is_rejected() {
        let broker = test_broker();
        let request = Envelope::cmd("x-1", "test", "gpio_get", Map::new());
        let bogus = Envelope::response_to(&request, "test", Map::new());
        let response = broker.handle_envelope(&bogus).await;
        assert_eq!(response.data.get("status"), Some(&Value::from("error")));
    }

    #[tokio::test]
    async fn test_counters_track_messages_and_errors() {
        let broker = test_broker();
        broker
            .handle_envelope(&cmd("gpio_set", &[("pin", Value::from(1)), ("value", Value::from(1))]))
            .await;
        broker.handle_envelope(&cmd("frobnicate", &[])).await;

        let health = broker.health_payload().await;
        assert_eq!(health.get("messages_processed"), Some(&Value::from(2u64)));
        assert_eq!(health.get("errors"), Some(&Value::from(1u64)));
    }
}
