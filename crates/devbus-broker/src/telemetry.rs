//! Background telemetry generators.
//!
//! One independently scheduled task per simulated bus periodically samples
//! its device and publishes an `evt` envelope on the broker's broadcast
//! channel (multi-client sessions forward it to every connected client).
//!
//! The tasks are ordinary router clients: they issue `cmd` envelopes through
//! [`Broker::handle_envelope`], so telemetry reads take the same per-device
//! serialization path as client commands and never bypass the router.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use devbus_core::Envelope;

use crate::broker::Broker;

/// Source identity stamped on telemetry envelopes.
const TELEMETRY_SOURCE: &str = "telemetry";

/// Spawns the telemetry tasks enabled by configuration. Returns their
/// handles so the caller can await them on shutdown.
pub fn spawn_telemetry_tasks(
    broker: Arc<Broker>,
    running: Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    let config = broker.config().clone();
    let mut handles = Vec::new();

    if config.devices.i2c.enabled && config.telemetry.i2c_interval_ms > 0 {
        let interval = Duration::from_millis(config.telemetry.i2c_interval_ms);
        handles.push(tokio::spawn(i2c_task(
            Arc::clone(&broker),
            Arc::clone(&running),
            interval,
        )));
    }
    if config.devices.i2s.enabled && config.telemetry.i2s_interval_ms > 0 {
        let interval = Duration::from_millis(config.telemetry.i2s_interval_ms);
        handles.push(tokio::spawn(i2s_task(
            Arc::clone(&broker),
            Arc::clone(&running),
            interval,
        )));
    }
    if config.devices.rs485.enabled && config.telemetry.rs485_interval_ms > 0 {
        let interval = Duration::from_millis(config.telemetry.rs485_interval_ms);
        handles.push(tokio::spawn(rs485_task(broker, running, interval)));
    }

    info!("{} telemetry task(s) started", handles.len());
    handles
}

/// Samples the environment sensor's measurement block.
async fn i2c_task(broker: Arc<Broker>, running: Arc<AtomicBool>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // the first tick fires immediately

    while running.load(Ordering::Relaxed) {
        ticker.tick().await;

        let params = object(&[
            ("address", Value::from(0x76)),
            ("register", Value::from(0xFA)),
            ("length", Value::from(3)),
        ]);
        let request = Envelope::cmd(broker.next_id(), TELEMETRY_SOURCE, "i2c_read", params);
        let response = broker.handle_envelope(&request).await;

        if let Some(bytes) = response.data.get("bytes") {
            let data = object(&[
                ("protocol", Value::from("i2c")),
                ("address", Value::from(0x76)),
                ("register", Value::from(0xFA)),
                ("bytes", bytes.clone()),
            ]);
            let event =
                Envelope::event(broker.next_id(), TELEMETRY_SOURCE, "sensor_reading", data);
            broker.publish(event).await;
        } else {
            debug!("i2c telemetry read failed: {:?}", response.data.get("error"));
        }
    }
}

/// Records a short audio sample and publishes its level analysis.
async fn i2s_task(broker: Arc<Broker>, running: Arc<AtomicBool>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    while running.load(Ordering::Relaxed) {
        ticker.tick().await;

        let record = Envelope::cmd(
            broker.next_id(),
            TELEMETRY_SOURCE,
            "i2s_record",
            object(&[("duration", Value::from(0.1))]),
        );
        let started = broker.handle_envelope(&record).await;
        if started.data.get("status") != Some(&Value::from("ok")) {
            // A client recording is in progress; try again next tick.
            debug!("i2s telemetry skipped: {:?}", started.data.get("error"));
            continue;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;

        let stop = Envelope::cmd(broker.next_id(), TELEMETRY_SOURCE, "i2s_stop", Map::new());
        let response = broker.handle_envelope(&stop).await;
        if response.data.get("status") == Some(&Value::from("ok")) {
            let mut data = object(&[("protocol", Value::from("i2s"))]);
            for key in ["db_level", "rms", "peak", "duration_secs"] {
                if let Some(value) = response.data.get(key) {
                    data.insert(key.to_string(), value.clone());
                }
            }
            let event = Envelope::event(broker.next_id(), TELEMETRY_SOURCE, "audio_level", data);
            broker.publish(event).await;
        }
    }
}

/// Polls the temperature controller's primary register block.
async fn rs485_task(broker: Arc<Broker>, running: Arc<AtomicBool>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    while running.load(Ordering::Relaxed) {
        ticker.tick().await;

        let params = object(&[
            ("slave", Value::from(1)),
            ("address", Value::from(0)),
            ("count", Value::from(5)),
        ]);
        let request = Envelope::cmd(
            broker.next_id(),
            TELEMETRY_SOURCE,
            "rs485_read_holding",
            params,
        );
        let response = broker.handle_envelope(&request).await;

        if let Some(values) = response.data.get("values") {
            let data = object(&[
                ("protocol", Value::from("rs485")),
                ("slave", Value::from(1)),
                ("values", values.clone()),
            ]);
            let event =
                Envelope::event(broker.next_id(), TELEMETRY_SOURCE, "modbus_reading", data);
            broker.publish(event).await;
        } else {
            debug!("rs485 telemetry read failed: {:?}", response.data.get("error"));
        }
    }
}

fn object(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
