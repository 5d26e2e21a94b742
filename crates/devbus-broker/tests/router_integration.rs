//! Integration tests for the dispatch pipeline: broker → router → device
//! models, exercised through the public envelope API exactly the way the
//! transports use it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use devbus_broker::config::BrokerConfig;
use devbus_broker::Broker;
use devbus_core::Envelope;

fn broker_with(seed: u64, timeout_ms: u64) -> Broker {
    let mut config = BrokerConfig::default();
    config.broker.seed = seed;
    config.broker.request_timeout_ms = timeout_ms;
    Broker::new(config).expect("broker must build")
}

fn cmd(action: &str, pairs: &[(&str, Value)]) -> Envelope {
    let params: Map<String, Value> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    Envelope::cmd(format!("it-{action}-{}", pairs.len()), "test", action, params)
}

fn error_kind(response: &Envelope) -> Option<&str> {
    response
        .data
        .get("error")
        .and_then(Value::as_object)
        .and_then(|e| e.get("kind"))
        .and_then(Value::as_str)
}

// ── GPIO ──────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_gpio_set_then_get_round_trips() {
    let broker = broker_with(42, 2000);

    let set = broker
        .handle_envelope(&cmd(
            "gpio_set",
            &[("pin", Value::from(17)), ("value", Value::from(1))],
        ))
        .await;
    assert_eq!(set.data.get("status"), Some(&Value::from("ok")));

    let get = broker
        .handle_envelope(&cmd("gpio_get", &[("pin", Value::from(17))]))
        .await;
    assert_eq!(get.data.get("status"), Some(&Value::from("ok")));
    assert_eq!(get.data.get("value"), Some(&Value::from(1)));
}

// ── Unknown action ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unknown_action_yields_structured_error_without_state_change() {
    let broker = broker_with(42, 2000);

    let response = broker.handle_envelope(&cmd("frobnicate", &[])).await;
    assert_eq!(response.data.get("status"), Some(&Value::from("error")));
    assert_eq!(error_kind(&response), Some("unknown_action"));

    // Nothing changed anywhere: a pin that was never set still reads low.
    let get = broker
        .handle_envelope(&cmd("gpio_get", &[("pin", Value::from(17))]))
        .await;
    assert_eq!(get.data.get("value"), Some(&Value::from(0)));
}

#[tokio::test]
async fn test_invalid_params_name_the_field() {
    let broker = broker_with(1, 2000);
    let response = broker
        .handle_envelope(&cmd("gpio_set", &[("pin", Value::from(17))]))
        .await;

    assert_eq!(error_kind(&response), Some("invalid_params"));
    let field = response
        .data
        .get("error")
        .and_then(Value::as_object)
        .and_then(|e| e.get("field"))
        .and_then(Value::as_str);
    assert_eq!(field, Some("value"));
}

// ── RS485 ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rs485_write_then_read_holding_register() {
    let broker = broker_with(1, 2000);

    let write = broker
        .handle_envelope(&cmd(
            "rs485_write_holding",
            &[
                ("slave", Value::from(3)),
                ("address", Value::from(0)),
                ("value", Value::from(5000)),
            ],
        ))
        .await;
    assert_eq!(write.data.get("status"), Some(&Value::from("ok")));

    let read = broker
        .handle_envelope(&cmd(
            "rs485_read_holding",
            &[
                ("slave", Value::from(3)),
                ("address", Value::from(0)),
                ("count", Value::from(1)),
            ],
        ))
        .await;
    assert_eq!(read.data.get("status"), Some(&Value::from("ok")));
    assert_eq!(
        read.data.get("values"),
        Some(&Value::from(vec![Value::from(5000)]))
    );
}

#[tokio::test]
async fn test_rs485_unknown_slave_surfaces_device_fault_in_payload() {
    let broker = broker_with(1, 2000);
    let response = broker
        .handle_envelope(&cmd(
            "rs485_read_holding",
            &[
                ("slave", Value::from(99)),
                ("address", Value::from(0)),
                ("count", Value::from(1)),
            ],
        ))
        .await;

    assert_eq!(response.data.get("status"), Some(&Value::from("error")));
    assert_eq!(error_kind(&response), Some("device_not_found"));
}

// ── I2C read-only enforcement ─────────────────────────────────────────────────

#[tokio::test]
async fn test_read_only_register_write_rejected_and_value_unchanged() {
    let broker = broker_with(1, 2000);

    // The chip id register (0x76 / 0xD0) never carries jitter, so the
    // before/after comparison is exact.
    let before = broker
        .handle_envelope(&cmd(
            "i2c_read",
            &[
                ("address", Value::from(0x76)),
                ("register", Value::from(0xD0)),
                ("length", Value::from(1)),
            ],
        ))
        .await;
    assert_eq!(before.data.get("bytes"), Some(&Value::from(vec![0x60])));

    let write = broker
        .handle_envelope(&cmd(
            "i2c_write",
            &[
                ("address", Value::from(0x76)),
                ("register", Value::from(0xD0)),
                ("bytes", Value::from(vec![Value::from(0x55)])),
            ],
        ))
        .await;
    assert_eq!(write.data.get("status"), Some(&Value::from("error")));
    assert_eq!(error_kind(&write), Some("read_only"));

    let after = broker
        .handle_envelope(&cmd(
            "i2c_read",
            &[
                ("address", Value::from(0x76)),
                ("register", Value::from(0xD0)),
                ("length", Value::from(1)),
            ],
        ))
        .await;
    assert_eq!(
        after.data.get("bytes"),
        before.data.get("bytes"),
        "rejected write must not change what a read observes"
    );
}

// ── Deadline enforcement ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_slow_handler_times_out_before_150ms() {
    let broker = broker_with(1, 100);

    // A 500 ms playback against a 100 ms deadline.
    let request = cmd(
        "i2s_play",
        &[(
            "tone",
            serde_json::json!({"frequency": 440.0, "duration": 0.5}),
        )],
    );

    let started = Instant::now();
    let response = broker.handle_envelope(&request).await;
    let elapsed = started.elapsed();

    assert_eq!(error_kind(&response), Some("timeout"));
    assert!(
        elapsed < Duration::from_millis(150),
        "timeout must fire before 150ms, took {elapsed:?}"
    );
}

// ── Per-device serialization ──────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_writes_to_one_device_apply_in_total_order() {
    let broker = Arc::new(broker_with(1, 2000));

    let a = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            broker
                .handle_envelope(&cmd(
                    "rs485_write_holding",
                    &[
                        ("slave", Value::from(2)),
                        ("address", Value::from(3)),
                        ("value", Value::from(100)),
                    ],
                ))
                .await
        })
    };
    let b = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            broker
                .handle_envelope(&cmd(
                    "rs485_write_holding",
                    &[
                        ("slave", Value::from(2)),
                        ("address", Value::from(3)),
                        ("value", Value::from(200)),
                    ],
                ))
                .await
        })
    };

    let ra = a.await.expect("task a");
    let rb = b.await.expect("task b");
    assert_eq!(ra.data.get("status"), Some(&Value::from("ok")));
    assert_eq!(rb.data.get("status"), Some(&Value::from("ok")));

    let read = broker
        .handle_envelope(&cmd(
            "rs485_read_holding",
            &[
                ("slave", Value::from(2)),
                ("address", Value::from(3)),
                ("count", Value::from(1)),
            ],
        ))
        .await;
    let value = read
        .data
        .get("values")
        .and_then(Value::as_array)
        .and_then(|v| v.first())
        .and_then(Value::as_i64)
        .expect("one value");
    assert!(
        value == 100 || value == 200,
        "final state must equal one of the two writes, got {value}"
    );
}

// ── Degraded health annotation ────────────────────────────────────────────────

#[tokio::test]
async fn test_degraded_flag_appears_after_faults_and_clears_on_success() {
    let mut config = BrokerConfig::default();
    config.broker.seed = 1;
    config.broker.degraded_threshold = 2;
    let broker = Broker::new(config).expect("broker must build");

    let missing = cmd(
        "i2c_read",
        &[
            ("address", Value::from(0x50)),
            ("register", Value::from(0)),
            ("length", Value::from(1)),
        ],
    );

    let first = broker.handle_envelope(&missing).await;
    assert_eq!(first.data.get("degraded"), None, "one fault is below threshold");

    let second = broker.handle_envelope(&missing).await;
    assert_eq!(
        second.data.get("degraded"),
        Some(&Value::Bool(true)),
        "threshold reached: responses carry the degraded flag"
    );

    // The next successful transaction clears the state.
    let ok = broker
        .handle_envelope(&cmd(
            "i2c_read",
            &[
                ("address", Value::from(0x76)),
                ("register", Value::from(0xD0)),
                ("length", Value::from(1)),
            ],
        ))
        .await;
    assert_eq!(ok.data.get("status"), Some(&Value::from("ok")));
    assert_eq!(ok.data.get("degraded"), None, "success exits degraded");
}

// ── Trace buffer side effect ──────────────────────────────────────────────────

#[tokio::test]
async fn test_dispatch_appends_request_and_response_to_trace_buffer() {
    let broker = broker_with(1, 2000);

    let request = cmd("i2c_scan", &[]);
    broker.handle_envelope(&request).await;

    let recent = broker.recent(10).await;
    assert!(recent.iter().any(|e| e.id == request.id && e.action() == Some("i2c_scan")));
    let response_logged = recent
        .iter()
        .any(|e| e.id == request.id && e.kind == devbus_core::EnvelopeKind::Response);
    assert!(response_logged, "result envelope must be buffered after execution");
}

// ── Recording lifecycle through the router ────────────────────────────────────

#[tokio::test]
async fn test_i2s_record_returns_immediately_then_stop_reports_analysis() {
    let broker = broker_with(9, 2000);

    let started = Instant::now();
    let record = broker
        .handle_envelope(&cmd("i2s_record", &[("duration", Value::from(2.0))]))
        .await;
    assert_eq!(record.data.get("status"), Some(&Value::from("ok")));
    assert_eq!(record.data.get("recording"), Some(&Value::Bool(true)));
    assert!(
        started.elapsed() < Duration::from_millis(100),
        "starting a recording must not block for its duration"
    );

    tokio::time::sleep(Duration::from_millis(250)).await;

    let stop = broker.handle_envelope(&cmd("i2s_stop", &[])).await;
    assert_eq!(stop.data.get("status"), Some(&Value::from("ok")));
    let samples = stop.data.get("samples").and_then(Value::as_u64).unwrap_or(0);
    assert!(samples > 0, "analysis must cover the accumulated samples");
}
