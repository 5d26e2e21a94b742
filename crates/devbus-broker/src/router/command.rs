//! Typed command registry.
//!
//! Every action name maps to a variant of [`Command`] with typed,
//! bounds-checked fields. Parsing happens once, up front; by the time a
//! handler runs, every parameter has already been validated, so the device
//! models never see malformed input. An action missing from this registry
//! is [`RouterError::UnknownAction`]; the registry is fixed at compile
//! time.

use serde_json::{Map, Value};

use crate::devices::i2s::ToneSpec;

use super::RouterError;

/// Maximum raw sample buffer accepted by `i2s_play`.
const MAX_PLAY_SAMPLES: usize = 1_048_576;

/// Maximum i2c transfer span in bytes.
const MAX_I2C_SPAN: usize = 32;

/// A fully validated command, ready for dispatch to a device model.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GpioSet { pin: u8, value: u8 },
    GpioGet { pin: u8 },
    GpioPwm { pin: u8, frequency: f64, duty_cycle: f64 },
    I2cRead { address: u8, register: u8, length: usize },
    I2cWrite { address: u8, register: u8, bytes: Vec<u8> },
    I2cScan,
    I2sPlaySamples { samples: Vec<i16> },
    I2sPlayTone { tone: ToneSpec },
    I2sRecord { duration: f64 },
    I2sStop,
    I2sDevices,
    Rs485ReadHolding { slave: u8, address: u16, count: u16 },
    Rs485WriteHolding { slave: u8, address: u16, value: u16 },
    Rs485ReadCoils { slave: u8, address: u16, count: u16 },
    Rs485WriteCoil { slave: u8, address: u16, value: bool },
    Rs485Scan,
}

impl Command {
    /// Parses and validates an action with its parameters.
    ///
    /// # Errors
    ///
    /// [`RouterError::UnknownAction`] for an unregistered action name,
    /// [`RouterError::InvalidParams`] naming the offending field otherwise.
    pub fn parse(action: &str, params: &Map<String, Value>) -> Result<Self, RouterError> {
        match action {
            "gpio_set" => Ok(Command::GpioSet {
                pin: int_field(params, "pin", 0, 63)? as u8,
                value: int_field(params, "value", 0, 1)? as u8,
            }),
            "gpio_get" => Ok(Command::GpioGet {
                pin: int_field(params, "pin", 0, 63)? as u8,
            }),
            "gpio_pwm" => Ok(Command::GpioPwm {
                pin: int_field(params, "pin", 0, 63)? as u8,
                frequency: float_field(params, "frequency", 0.1, 1_000_000.0)?,
                duty_cycle: float_field(params, "duty_cycle", 0.0, 100.0)?,
            }),
            "i2c_read" => Ok(Command::I2cRead {
                address: int_field(params, "address", 0x03, 0x77)? as u8,
                register: int_field(params, "register", 0, 0xFF)? as u8,
                length: int_field(params, "length", 1, MAX_I2C_SPAN as i64)? as usize,
            }),
            "i2c_write" => Ok(Command::I2cWrite {
                address: int_field(params, "address", 0x03, 0x77)? as u8,
                register: int_field(params, "register", 0, 0xFF)? as u8,
                bytes: byte_array_field(params, "bytes")?,
            }),
            "i2c_scan" => Ok(Command::I2cScan),
            "i2s_play" => parse_i2s_play(params),
            "i2s_record" => Ok(Command::I2sRecord {
                duration: float_field(params, "duration", 0.01, 60.0)?,
            }),
            "i2s_stop" => Ok(Command::I2sStop),
            "i2s_devices" => Ok(Command::I2sDevices),
            "rs485_read_holding" => Ok(Command::Rs485ReadHolding {
                slave: int_field(params, "slave", 1, 247)? as u8,
                address: int_field(params, "address", 0, 0xFFFF)? as u16,
                count: int_field(params, "count", 1, 125)? as u16,
            }),
            "rs485_write_holding" => Ok(Command::Rs485WriteHolding {
                slave: int_field(params, "slave", 1, 247)? as u8,
                address: int_field(params, "address", 0, 0xFFFF)? as u16,
                value: int_field(params, "value", 0, 0xFFFF)? as u16,
            }),
            "rs485_read_coils" => Ok(Command::Rs485ReadCoils {
                slave: int_field(params, "slave", 1, 247)? as u8,
                address: int_field(params, "address", 0, 0xFFFF)? as u16,
                count: int_field(params, "count", 1, 125)? as u16,
            }),
            "rs485_write_coil" => Ok(Command::Rs485WriteCoil {
                slave: int_field(params, "slave", 1, 247)? as u8,
                address: int_field(params, "address", 0, 0xFFFF)? as u16,
                value: bool_field(params, "value")?,
            }),
            "rs485_scan" => Ok(Command::Rs485Scan),
            other => Err(RouterError::UnknownAction(other.to_string())),
        }
    }
}

// ── Field extraction helpers ──────────────────────────────────────────────────

fn invalid(field: &str, reason: impl Into<String>) -> RouterError {
    RouterError::InvalidParams {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn int_field(params: &Map<String, Value>, field: &str, min: i64, max: i64) -> Result<i64, RouterError> {
    let value = params
        .get(field)
        .ok_or_else(|| invalid(field, "missing required parameter"))?;
    let n = value
        .as_i64()
        .ok_or_else(|| invalid(field, format!("expected an integer, got {value}")))?;
    if !(min..=max).contains(&n) {
        return Err(invalid(field, format!("{n} outside {min}..={max}")));
    }
    Ok(n)
}

fn float_field(
    params: &Map<String, Value>,
    field: &str,
    min: f64,
    max: f64,
) -> Result<f64, RouterError> {
    let value = params
        .get(field)
        .ok_or_else(|| invalid(field, "missing required parameter"))?;
    let n = value
        .as_f64()
        .ok_or_else(|| invalid(field, format!("expected a number, got {value}")))?;
    if !n.is_finite() || n < min || n > max {
        return Err(invalid(field, format!("{n} outside {min}..={max}")));
    }
    Ok(n)
}

/// Accepts JSON `true`/`false` as well as `0`/`1` (clients on loosely typed
/// stacks send both).
fn bool_field(params: &Map<String, Value>, field: &str) -> Result<bool, RouterError> {
    let value = params
        .get(field)
        .ok_or_else(|| invalid(field, "missing required parameter"))?;
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(invalid(field, format!("expected a boolean or 0/1, got {value}"))),
        },
        _ => Err(invalid(field, format!("expected a boolean, got {value}"))),
    }
}

fn byte_array_field(params: &Map<String, Value>, field: &str) -> Result<Vec<u8>, RouterError> {
    let value = params
        .get(field)
        .ok_or_else(|| invalid(field, "missing required parameter"))?;
    let array = value
        .as_array()
        .ok_or_else(|| invalid(field, format!("expected an array of bytes, got {value}")))?;
    if array.is_empty() || array.len() > MAX_I2C_SPAN {
        return Err(invalid(
            field,
            format!("length {} outside 1..={MAX_I2C_SPAN}", array.len()),
        ));
    }
    array
        .iter()
        .map(|item| {
            item.as_i64()
                .filter(|n| (0..=255).contains(n))
                .map(|n| n as u8)
                .ok_or_else(|| invalid(field, format!("byte out of range: {item}")))
        })
        .collect()
}

fn parse_i2s_play(params: &Map<String, Value>) -> Result<Command, RouterError> {
    match (params.get("samples"), params.get("tone")) {
        (Some(_), Some(_)) => Err(invalid(
            "samples",
            "provide either `samples` or `tone`, not both",
        )),
        (Some(value), None) => {
            let array = value
                .as_array()
                .ok_or_else(|| invalid("samples", "expected an array of 16-bit samples"))?;
            if array.len() > MAX_PLAY_SAMPLES {
                return Err(invalid(
                    "samples",
                    format!("length {} exceeds {MAX_PLAY_SAMPLES}", array.len()),
                ));
            }
            let samples = array
                .iter()
                .map(|item| {
                    item.as_i64()
                        .filter(|n| (i64::from(i16::MIN)..=i64::from(i16::MAX)).contains(n))
                        .map(|n| n as i16)
                        .ok_or_else(|| invalid("samples", format!("sample out of range: {item}")))
                })
                .collect::<Result<Vec<i16>, RouterError>>()?;
            Ok(Command::I2sPlaySamples { samples })
        }
        (None, Some(value)) => {
            let tone = value
                .as_object()
                .ok_or_else(|| invalid("tone", "expected an object"))?;
            Ok(Command::I2sPlayTone {
                tone: ToneSpec {
                    frequency: float_field(tone, "frequency", 1.0, 20_000.0)?,
                    duration: float_field(tone, "duration", 0.0, 10.0)?,
                    amplitude: match tone.get("amplitude") {
                        Some(_) => float_field(tone, "amplitude", 0.0, 1.0)?,
                        None => 0.5,
                    },
                },
            })
        }
        (None, None) => Err(invalid("samples", "provide `samples` or `tone`")),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
