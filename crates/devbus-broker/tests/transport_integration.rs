//! Integration tests for the transport listeners, speaking the raw wire
//! protocol over real sockets: newline-delimited JSON for the strict duplex
//! listener, WebSocket text frames for the multi-client listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use devbus_broker::config::BrokerConfig;
use devbus_broker::transport::duplex::DuplexListener;
use devbus_broker::transport::ws::WsListener;
use devbus_broker::Broker;
use devbus_core::{decode, encode, Envelope, EnvelopeKind};

fn test_broker() -> Arc<Broker> {
    let mut config = BrokerConfig::default();
    config.broker.seed = 42;
    Arc::new(Broker::new(config).expect("broker must build"))
}

fn cmd(id: &str, action: &str, pairs: &[(&str, Value)]) -> Envelope {
    let params: Map<String, Value> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    Envelope::cmd(id, "test-client", action, params)
}

async fn start_duplex(broker: Arc<Broker>) -> (std::net::SocketAddr, Arc<AtomicBool>) {
    let listener = DuplexListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind duplex");
    let addr = listener.local_addr();
    let running = Arc::new(AtomicBool::new(true));
    tokio::spawn(listener.run(broker, Arc::clone(&running)));
    (addr, running)
}

async fn read_response(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Envelope {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    decode(line.trim_end().as_bytes()).expect("response must decode")
}

// ── Strict duplex ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_duplex_request_reply_cycle() {
    let (addr, running) = start_duplex(test_broker()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = cmd(
        "dx-1",
        "gpio_set",
        &[("pin", Value::from(17)), ("value", Value::from(1))],
    );
    {
        let mut bytes = encode(&request).unwrap();
        bytes.push(b'\n');
        write_half.write_all(&bytes).await.unwrap();
    }

    let response = read_response(&mut reader).await;
    assert_eq!(response.kind, EnvelopeKind::Response);
    assert_eq!(response.id, "dx-1", "response correlates by id");
    assert_eq!(response.data.get("status"), Some(&Value::from("ok")));

    running.store(false, Ordering::Relaxed);
}

#[tokio::test]
async fn test_duplex_answers_in_send_order() {
    let (addr, running) = start_duplex(test_broker()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // Two requests written back-to-back; the listener must answer the first
    // before reading the second.
    for (id, pin) in [("order-1", 4), ("order-2", 5)] {
        let request = cmd(id, "gpio_get", &[("pin", Value::from(pin))]);
        let mut bytes = encode(&request).unwrap();
        bytes.push(b'\n');
        write_half.write_all(&bytes).await.unwrap();
    }

    let first = read_response(&mut reader).await;
    let second = read_response(&mut reader).await;
    assert_eq!(first.id, "order-1");
    assert_eq!(second.id, "order-2");

    running.store(false, Ordering::Relaxed);
}

#[tokio::test]
async fn test_duplex_survives_undecodable_frame() {
    let (addr, running) = start_duplex(test_broker()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"this is not json\n").await.unwrap();

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let error_response = read_response(&mut reader).await;
    assert_eq!(error_response.data.get("status"), Some(&Value::from("error")));
    let kind = error_response
        .data
        .get("error")
        .and_then(Value::as_object)
        .and_then(|e| e.get("kind"))
        .and_then(Value::as_str);
    assert_eq!(kind, Some("malformed_payload"));

    // The connection is still usable afterwards.
    let request = cmd("after-garbage", "i2c_scan", &[]);
    let mut bytes = encode(&request).unwrap();
    bytes.push(b'\n');
    write_half.write_all(&bytes).await.unwrap();

    let response = read_response(&mut reader).await;
    assert_eq!(response.id, "after-garbage");
    assert_eq!(response.data.get("status"), Some(&Value::from("ok")));

    running.store(false, Ordering::Relaxed);
}

#[tokio::test]
async fn test_duplex_rejects_wrong_protocol_version() {
    let (addr, running) = start_duplex(test_broker()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"{\"v\":9,\"t\":\"cmd\",\"id\":\"x\",\"src\":\"c\",\"ts\":0.0,\"d\":{}}\n")
        .await
        .unwrap();

    let (read_half, _write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let response = read_response(&mut reader).await;
    let kind = response
        .data
        .get("error")
        .and_then(Value::as_object)
        .and_then(|e| e.get("kind"))
        .and_then(Value::as_str);
    assert_eq!(kind, Some("unsupported_version"));

    running.store(false, Ordering::Relaxed);
}

#[tokio::test]
async fn test_duplex_health_query_reports_devices() {
    let (addr, running) = start_duplex(test_broker()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = cmd("health-1", "health", &[]);
    let mut bytes = encode(&request).unwrap();
    bytes.push(b'\n');
    write_half.write_all(&bytes).await.unwrap();

    let response = read_response(&mut reader).await;
    assert_eq!(response.data.get("status"), Some(&Value::from("ok")));
    let devices = response
        .data
        .get("devices")
        .and_then(Value::as_array)
        .expect("health carries per-device state");
    assert_eq!(devices.len(), 4);
    assert!(response.data.get("uptime_secs").is_some());

    running.store(false, Ordering::Relaxed);
}

// ── Multi-client WebSocket ────────────────────────────────────────────────────

async fn start_ws(broker: Arc<Broker>) -> (String, Arc<AtomicBool>) {
    let listener = WsListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind ws");
    let url = format!("ws://{}", listener.local_addr());
    let running = Arc::new(AtomicBool::new(true));
    tokio::spawn(listener.run(broker, Arc::clone(&running)));
    (url, running)
}

#[tokio::test]
async fn test_ws_response_reaches_only_the_originating_client() {
    let broker = test_broker();
    let (url, running) = start_ws(Arc::clone(&broker)).await;

    let (mut client_a, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut client_b, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let request = cmd("ws-a-1", "gpio_get", &[("pin", Value::from(2))]);
    let text = String::from_utf8(encode(&request).unwrap()).unwrap();
    client_a.send(WsMessage::Text(text)).await.unwrap();

    // Client A receives its response.
    let reply = tokio::time::timeout(Duration::from_secs(2), client_a.next())
        .await
        .expect("reply within 2s")
        .expect("stream open")
        .expect("frame ok");
    let envelope = decode(reply.into_text().unwrap().as_bytes()).unwrap();
    assert_eq!(envelope.id, "ws-a-1");

    // Client B sees nothing: responses are not broadcast.
    let nothing = tokio::time::timeout(Duration::from_millis(300), client_b.next()).await;
    assert!(nothing.is_err(), "other clients must not receive the response");

    running.store(false, Ordering::Relaxed);
}

#[tokio::test]
async fn test_ws_events_broadcast_to_all_clients() {
    let broker = test_broker();
    let (url, running) = start_ws(Arc::clone(&broker)).await;

    let (mut client_a, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut client_b, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    // Give both sessions a moment to subscribe to the broadcast channel.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut data = Map::new();
    data.insert("temperature".into(), Value::from(21.5));
    let event = Envelope::event(broker.next_id(), "telemetry", "sensor_reading", data);
    broker.publish(event).await;

    for client in [&mut client_a, &mut client_b] {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("broadcast within 2s")
            .expect("stream open")
            .expect("frame ok");
        let envelope = decode(frame.into_text().unwrap().as_bytes()).unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Event);
        assert_eq!(envelope.data.get("event"), Some(&Value::from("sensor_reading")));
    }

    running.store(false, Ordering::Relaxed);
}

#[tokio::test]
async fn test_ws_client_event_rebroadcasts_to_other_clients() {
    let broker = test_broker();
    let (url, running) = start_ws(Arc::clone(&broker)).await;

    let (mut client_a, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut client_b, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let event = Envelope::event("evt-a-1", "client-a", "door_open", Map::new());
    let text = String::from_utf8(encode(&event).unwrap()).unwrap();
    client_a.send(WsMessage::Text(text)).await.unwrap();

    // Client A gets the acknowledgement and the rebroadcast (order not
    // guaranteed); client B gets the rebroadcast only.
    let frame = tokio::time::timeout(Duration::from_secs(2), client_b.next())
        .await
        .expect("rebroadcast within 2s")
        .expect("stream open")
        .expect("frame ok");
    let envelope = decode(frame.into_text().unwrap().as_bytes()).unwrap();
    assert_eq!(envelope.id, "evt-a-1");
    assert_eq!(envelope.kind, EnvelopeKind::Event);

    running.store(false, Ordering::Relaxed);
}
