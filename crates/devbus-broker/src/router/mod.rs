//! Command router.
//!
//! Maps validated [`Command`]s onto device-model operations. The router owns
//! the only handles to the device models; every device sits behind its own
//! async mutex, so commands targeting the same device are serialized
//! (single-writer-at-a-time) while commands to different devices proceed
//! concurrently. Nothing else in the process touches a device model
//! directly.
//!
//! Every dispatch:
//!
//! 1. appends the request envelope to the trace buffer (pre-state),
//! 2. parses the action into a typed [`Command`],
//! 3. runs the device operation under the configured deadline,
//! 4. folds any fault into the response payload (never a transport error),
//! 5. appends the response envelope to the trace buffer (result).

pub mod command;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use devbus_core::{Envelope, TraceBuffer};

use crate::devices::i2s::generate_tone;
use crate::devices::{AudioBus, DeviceFault, DeviceHealth, GpioBus, I2cBus, Rs485Bus};

pub use command::Command;

/// Errors produced by the router itself (as opposed to device faults).
///
/// Always surfaced to the caller as a structured response payload, never as
/// a transport-level failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RouterError {
    #[error("unknown action: {0:?}")]
    UnknownAction(String),

    #[error("invalid parameter {field:?}: {reason}")]
    InvalidParams { field: String, reason: String },

    #[error("request deadline exceeded")]
    Timeout,
}

impl RouterError {
    /// Stable snake_case identifier used in response payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::UnknownAction(_) => "unknown_action",
            RouterError::InvalidParams { .. } => "invalid_params",
            RouterError::Timeout => "timeout",
        }
    }
}

/// The device handles a router instance dispatches to. Disabled buses are
/// simply absent.
pub struct DeviceSet {
    pub gpio: Option<Box<dyn GpioBus>>,
    pub i2c: Option<Box<dyn I2cBus>>,
    pub i2s: Option<Box<dyn AudioBus>>,
    pub rs485: Option<Box<dyn Rs485Bus>>,
}

/// The command router. See the module docs for the dispatch pipeline.
pub struct Router {
    gpio: Option<Mutex<Box<dyn GpioBus>>>,
    i2c: Option<Mutex<Box<dyn I2cBus>>>,
    i2s: Option<Mutex<Box<dyn AudioBus>>>,
    rs485: Option<Mutex<Box<dyn Rs485Bus>>>,
    buffer: Arc<Mutex<TraceBuffer>>,
    timeout: Duration,
}

impl Router {
    /// Creates a router over `devices`, sharing `buffer` with the broker.
    pub fn new(devices: DeviceSet, buffer: Arc<Mutex<TraceBuffer>>, timeout: Duration) -> Self {
        Self {
            gpio: devices.gpio.map(Mutex::new),
            i2c: devices.i2c.map(Mutex::new),
            i2s: devices.i2s.map(Mutex::new),
            rs485: devices.rs485.map(Mutex::new),
            buffer,
            timeout,
        }
    }

    /// Handles one `cmd` envelope end to end, returning the response
    /// envelope stamped with `responder` as its source.
    pub async fn dispatch(&self, request: &Envelope, responder: &str) -> Envelope {
        self.buffer.lock().await.append(request.clone());

        let payload = self.dispatch_payload(request).await;
        let response = Envelope::response_to(request, responder, payload);

        self.buffer.lock().await.append(response.clone());
        response
    }

    async fn dispatch_payload(&self, request: &Envelope) -> Map<String, Value> {
        let Some(action) = request.action() else {
            return router_error_payload(&RouterError::InvalidParams {
                field: "action".into(),
                reason: "missing required parameter".into(),
            });
        };

        let cmd = match Command::parse(action, &request.data) {
            Ok(cmd) => cmd,
            Err(err) => {
                debug!(action, error = %err, "command rejected");
                return router_error_payload(&err);
            }
        };

        match tokio::time::timeout(self.timeout, self.execute(cmd)).await {
            Ok((Ok(fields), degraded)) => ok_payload(fields, degraded),
            Ok((Err(fault), degraded)) => fault_payload(&fault, degraded),
            Err(_elapsed) => {
                debug!(action, timeout = ?self.timeout, "dispatch deadline exceeded");
                router_error_payload(&RouterError::Timeout)
            }
        }
    }

    /// Runs one command against its device model. Returns the ok-fields or
    /// fault, plus the device's degraded flag observed after the operation.
    async fn execute(&self, cmd: Command) -> (Result<Map<String, Value>, DeviceFault>, bool) {
        match cmd {
            Command::GpioSet { pin, value } => {
                let Some(gpio) = &self.gpio else {
                    return (Err(bus_disabled("gpio")), false);
                };
                let mut gpio = gpio.lock().await;
                let result = gpio.set(pin, value).map(|()| {
                    fields(&[("pin", pin.into()), ("value", value.into())])
                });
                (result, gpio.health().is_degraded())
            }
            Command::GpioGet { pin } => {
                let Some(gpio) = &self.gpio else {
                    return (Err(bus_disabled("gpio")), false);
                };
                let mut gpio = gpio.lock().await;
                let result = gpio.get(pin).map(|level| {
                    fields(&[("pin", pin.into()), ("value", level.into())])
                });
                (result, gpio.health().is_degraded())
            }
            Command::GpioPwm {
                pin,
                frequency,
                duty_cycle,
            } => {
                let Some(gpio) = &self.gpio else {
                    return (Err(bus_disabled("gpio")), false);
                };
                let mut gpio = gpio.lock().await;
                let result = gpio.start_pwm(pin, frequency, duty_cycle).map(|()| {
                    fields(&[
                        ("pin", pin.into()),
                        ("frequency", frequency.into()),
                        ("duty_cycle", duty_cycle.into()),
                    ])
                });
                (result, gpio.health().is_degraded())
            }
            Command::I2cRead {
                address,
                register,
                length,
            } => {
                let Some(i2c) = &self.i2c else {
                    return (Err(bus_disabled("i2c")), false);
                };
                let mut i2c = i2c.lock().await;
                let result = i2c.read(address, register, length).map(|bytes| {
                    fields(&[
                        ("address", address.into()),
                        ("register", register.into()),
                        ("bytes", bytes.into()),
                    ])
                });
                (result, i2c.health().is_degraded())
            }
            Command::I2cWrite {
                address,
                register,
                bytes,
            } => {
                let Some(i2c) = &self.i2c else {
                    return (Err(bus_disabled("i2c")), false);
                };
                let mut i2c = i2c.lock().await;
                let written = bytes.len();
                let result = i2c.write(address, register, &bytes).map(|()| {
                    fields(&[
                        ("address", address.into()),
                        ("register", register.into()),
                        ("written", written.into()),
                    ])
                });
                (result, i2c.health().is_degraded())
            }
            Command::I2cScan => {
                let Some(i2c) = &self.i2c else {
                    return (Err(bus_disabled("i2c")), false);
                };
                let mut i2c = i2c.lock().await;
                let addresses = i2c.scan();
                (
                    Ok(fields(&[("addresses", addresses.into())])),
                    i2c.health().is_degraded(),
                )
            }
            Command::I2sPlaySamples { samples } => {
                let Some(i2s) = &self.i2s else {
                    return (Err(bus_disabled("i2s")), false);
                };
                let mut i2s = i2s.lock().await;
                let result = i2s.play(samples).await.map(analysis_fields);
                (result, i2s.health().is_degraded())
            }
            Command::I2sPlayTone { tone } => {
                let Some(i2s) = &self.i2s else {
                    return (Err(bus_disabled("i2s")), false);
                };
                let mut i2s = i2s.lock().await;
                let samples = generate_tone(i2s.config(), &tone);
                let result = i2s.play(samples).await.map(analysis_fields);
                (result, i2s.health().is_degraded())
            }
            Command::I2sRecord { duration } => {
                let Some(i2s) = &self.i2s else {
                    return (Err(bus_disabled("i2s")), false);
                };
                let mut i2s = i2s.lock().await;
                let result = i2s
                    .start_recording(Duration::from_secs_f64(duration))
                    .await
                    .map(|()| {
                        fields(&[("recording", true.into()), ("max_duration", duration.into())])
                    });
                (result, i2s.health().is_degraded())
            }
            Command::I2sStop => {
                let Some(i2s) = &self.i2s else {
                    return (Err(bus_disabled("i2s")), false);
                };
                let mut i2s = i2s.lock().await;
                let result = match i2s.stop_recording().await {
                    Ok(samples) => {
                        let analysis = crate::devices::i2s::analyze(i2s.config(), &samples);
                        Ok(analysis_fields(analysis))
                    }
                    Err(fault) => Err(fault),
                };
                (result, i2s.health().is_degraded())
            }
            Command::I2sDevices => {
                let Some(i2s) = &self.i2s else {
                    return (Err(bus_disabled("i2s")), false);
                };
                let i2s = i2s.lock().await;
                let endpoints = serde_json::to_value(i2s.endpoints()).unwrap_or_default();
                (
                    Ok(fields(&[("devices", endpoints)])),
                    i2s.health().is_degraded(),
                )
            }
            Command::Rs485ReadHolding {
                slave,
                address,
                count,
            } => {
                let Some(rs485) = &self.rs485 else {
                    return (Err(bus_disabled("rs485")), false);
                };
                let mut rs485 = rs485.lock().await;
                let result = rs485.read_holding(slave, address, count).map(|values| {
                    fields(&[
                        ("slave", slave.into()),
                        ("address", address.into()),
                        ("values", values.into()),
                    ])
                });
                (result, rs485.health().is_degraded())
            }
            Command::Rs485WriteHolding {
                slave,
                address,
                value,
            } => {
                let Some(rs485) = &self.rs485 else {
                    return (Err(bus_disabled("rs485")), false);
                };
                let mut rs485 = rs485.lock().await;
                let result = rs485.write_holding(slave, address, value).map(|()| {
                    fields(&[
                        ("slave", slave.into()),
                        ("address", address.into()),
                        ("value", value.into()),
                    ])
                });
                (result, rs485.health().is_degraded())
            }
            Command::Rs485ReadCoils {
                slave,
                address,
                count,
            } => {
                let Some(rs485) = &self.rs485 else {
                    return (Err(bus_disabled("rs485")), false);
                };
                let mut rs485 = rs485.lock().await;
                let result = rs485.read_coils(slave, address, count).map(|bits| {
                    fields(&[
                        ("slave", slave.into()),
                        ("address", address.into()),
                        ("values", bits.into()),
                    ])
                });
                (result, rs485.health().is_degraded())
            }
            Command::Rs485WriteCoil {
                slave,
                address,
                value,
            } => {
                let Some(rs485) = &self.rs485 else {
                    return (Err(bus_disabled("rs485")), false);
                };
                let mut rs485 = rs485.lock().await;
                let result = rs485.write_coil(slave, address, value).map(|()| {
                    fields(&[
                        ("slave", slave.into()),
                        ("address", address.into()),
                        ("value", value.into()),
                    ])
                });
                (result, rs485.health().is_degraded())
            }
            Command::Rs485Scan => {
                let Some(rs485) = &self.rs485 else {
                    return (Err(bus_disabled("rs485")), false);
                };
                let mut rs485 = rs485.lock().await;
                let slaves = rs485.scan();
                let info = serde_json::to_value(rs485.slave_info()).unwrap_or_default();
                (
                    Ok(fields(&[("slaves", slaves.into()), ("devices", info)])),
                    rs485.health().is_degraded(),
                )
            }
        }
    }

    /// Health of every enabled device, for the health query.
    pub async fn device_health(&self) -> Vec<DeviceHealth> {
        let mut out = Vec::new();
        if let Some(gpio) = &self.gpio {
            out.push(DeviceHealth::from_health("gpio", gpio.lock().await.health()));
        }
        if let Some(i2c) = &self.i2c {
            out.push(DeviceHealth::from_health("i2c", i2c.lock().await.health()));
        }
        if let Some(i2s) = &self.i2s {
            out.push(DeviceHealth::from_health("i2s", i2s.lock().await.health()));
        }
        if let Some(rs485) = &self.rs485 {
            out.push(DeviceHealth::from_health(
                "rs485",
                rs485.lock().await.health(),
            ));
        }
        out
    }

    /// The configured per-request deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

// ── Payload helpers ───────────────────────────────────────────────────────────

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn analysis_fields(analysis: crate::devices::i2s::AudioAnalysis) -> Map<String, Value> {
    match serde_json::to_value(&analysis) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn ok_payload(mut payload: Map<String, Value>, degraded: bool) -> Map<String, Value> {
    payload.insert("status".into(), Value::from("ok"));
    if degraded {
        payload.insert("degraded".into(), Value::Bool(true));
    }
    payload
}

fn fault_payload(fault: &DeviceFault, degraded: bool) -> Map<String, Value> {
    let mut error = Map::new();
    error.insert("kind".into(), Value::from(fault.kind()));
    error.insert("message".into(), Value::from(fault.to_string()));

    let mut payload = Map::new();
    payload.insert("status".into(), Value::from("error"));
    payload.insert("error".into(), Value::Object(error));
    if degraded {
        payload.insert("degraded".into(), Value::Bool(true));
    }
    payload
}

fn router_error_payload(err: &RouterError) -> Map<String, Value> {
    let mut error = Map::new();
    error.insert("kind".into(), Value::from(err.kind()));
    error.insert("message".into(), Value::from(err.to_string()));
    if let RouterError::InvalidParams { field, .. } = err {
        error.insert("field".into(), Value::from(field.as_str()));
    }

    let mut payload = Map::new();
    payload.insert("status".into(), Value::from("error"));
    payload.insert("error".into(), Value::Object(error));
    payload
}

fn bus_disabled(bus: &str) -> DeviceFault {
    DeviceFault::InvalidRequest(format!("{bus} bus is not enabled"))
}
