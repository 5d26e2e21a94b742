//! Convenience methods mirroring the broker's action catalog.
//!
//! Each wrapper builds the parameter map, issues the request, and unwraps
//! the typed result field from an `ok` payload; an `error` payload becomes
//! [`ClientError::Broker`] carrying the broker's fault kind and message.

use serde_json::{Map, Value};

use devbus_core::Envelope;

use crate::connection::{BrokerClient, ClientError};

fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

/// Returns the payload when `status` is ok, or the broker's error otherwise.
fn expect_ok(payload: Map<String, Value>) -> Result<Map<String, Value>, ClientError> {
    if payload.get("status").and_then(Value::as_str) == Some("ok") {
        return Ok(payload);
    }
    let (kind, message) = payload
        .get("error")
        .and_then(Value::as_object)
        .map(|error| {
            (
                error
                    .get("kind")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            )
        })
        .unwrap_or_else(|| ("unknown".to_string(), String::new()));
    Err(ClientError::Broker { kind, message })
}

impl BrokerClient {
    // ── GPIO ──────────────────────────────────────────────────────────────────

    pub async fn gpio_set(&self, pin: u8, value: u8) -> Result<(), ClientError> {
        let payload = self
            .request(
                "gpio_set",
                params(&[("pin", pin.into()), ("value", value.into())]),
            )
            .await?;
        expect_ok(payload).map(|_| ())
    }

    pub async fn gpio_get(&self, pin: u8) -> Result<u8, ClientError> {
        let payload = self
            .request("gpio_get", params(&[("pin", pin.into())]))
            .await?;
        let payload = expect_ok(payload)?;
        Ok(payload.get("value").and_then(Value::as_u64).unwrap_or(0) as u8)
    }

    pub async fn gpio_pwm(
        &self,
        pin: u8,
        frequency: f64,
        duty_cycle: f64,
    ) -> Result<(), ClientError> {
        let payload = self
            .request(
                "gpio_pwm",
                params(&[
                    ("pin", pin.into()),
                    ("frequency", frequency.into()),
                    ("duty_cycle", duty_cycle.into()),
                ]),
            )
            .await?;
        expect_ok(payload).map(|_| ())
    }

    // ── I2C ───────────────────────────────────────────────────────────────────

    pub async fn i2c_read(
        &self,
        address: u8,
        register: u8,
        length: usize,
    ) -> Result<Vec<u8>, ClientError> {
        let payload = self
            .request(
                "i2c_read",
                params(&[
                    ("address", address.into()),
                    ("register", register.into()),
                    ("length", length.into()),
                ]),
            )
            .await?;
        let payload = expect_ok(payload)?;
        Ok(payload
            .get("bytes")
            .and_then(Value::as_array)
            .map(|array| {
                array
                    .iter()
                    .filter_map(Value::as_u64)
                    .map(|b| b as u8)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn i2c_write(
        &self,
        address: u8,
        register: u8,
        bytes: &[u8],
    ) -> Result<(), ClientError> {
        let byte_values: Vec<Value> = bytes.iter().map(|&b| Value::from(b)).collect();
        let payload = self
            .request(
                "i2c_write",
                params(&[
                    ("address", address.into()),
                    ("register", register.into()),
                    ("bytes", Value::from(byte_values)),
                ]),
            )
            .await?;
        expect_ok(payload).map(|_| ())
    }

    pub async fn i2c_scan(&self) -> Result<Vec<u8>, ClientError> {
        let payload = self.request("i2c_scan", Map::new()).await?;
        let payload = expect_ok(payload)?;
        Ok(payload
            .get("addresses")
            .and_then(Value::as_array)
            .map(|array| {
                array
                    .iter()
                    .filter_map(Value::as_u64)
                    .map(|a| a as u8)
                    .collect()
            })
            .unwrap_or_default())
    }

    // ── I2S ───────────────────────────────────────────────────────────────────

    /// Plays a synthesized tone; returns the level analysis of the stream.
    pub async fn i2s_play_tone(
        &self,
        frequency: f64,
        duration: f64,
        amplitude: f64,
    ) -> Result<Map<String, Value>, ClientError> {
        let tone = serde_json::json!({
            "frequency": frequency,
            "duration": duration,
            "amplitude": amplitude,
        });
        let payload = self.request("i2s_play", params(&[("tone", tone)])).await?;
        expect_ok(payload)
    }

    /// Starts a background recording bounded by `duration` seconds.
    pub async fn i2s_record(&self, duration: f64) -> Result<(), ClientError> {
        let payload = self
            .request("i2s_record", params(&[("duration", duration.into())]))
            .await?;
        expect_ok(payload).map(|_| ())
    }

    /// Stops the recording; returns the analysis of what was captured.
    pub async fn i2s_stop(&self) -> Result<Map<String, Value>, ClientError> {
        let payload = self.request("i2s_stop", Map::new()).await?;
        expect_ok(payload)
    }

    // ── RS485 ─────────────────────────────────────────────────────────────────

    pub async fn rs485_read_holding(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ClientError> {
        let payload = self
            .request(
                "rs485_read_holding",
                params(&[
                    ("slave", slave.into()),
                    ("address", address.into()),
                    ("count", count.into()),
                ]),
            )
            .await?;
        let payload = expect_ok(payload)?;
        Ok(payload
            .get("values")
            .and_then(Value::as_array)
            .map(|array| {
                array
                    .iter()
                    .filter_map(Value::as_u64)
                    .map(|v| v as u16)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn rs485_write_holding(
        &self,
        slave: u8,
        address: u16,
        value: u16,
    ) -> Result<(), ClientError> {
        let payload = self
            .request(
                "rs485_write_holding",
                params(&[
                    ("slave", slave.into()),
                    ("address", address.into()),
                    ("value", value.into()),
                ]),
            )
            .await?;
        expect_ok(payload).map(|_| ())
    }

    pub async fn rs485_read_coils(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, ClientError> {
        let payload = self
            .request(
                "rs485_read_coils",
                params(&[
                    ("slave", slave.into()),
                    ("address", address.into()),
                    ("count", count.into()),
                ]),
            )
            .await?;
        let payload = expect_ok(payload)?;
        Ok(payload
            .get("values")
            .and_then(Value::as_array)
            .map(|array| array.iter().filter_map(Value::as_bool).collect())
            .unwrap_or_default())
    }

    pub async fn rs485_write_coil(
        &self,
        slave: u8,
        address: u16,
        value: bool,
    ) -> Result<(), ClientError> {
        let payload = self
            .request(
                "rs485_write_coil",
                params(&[
                    ("slave", slave.into()),
                    ("address", address.into()),
                    ("value", value.into()),
                ]),
            )
            .await?;
        expect_ok(payload).map(|_| ())
    }

    pub async fn rs485_scan(&self) -> Result<Vec<u8>, ClientError> {
        let payload = self.request("rs485_scan", Map::new()).await?;
        let payload = expect_ok(payload)?;
        Ok(payload
            .get("slaves")
            .and_then(Value::as_array)
            .map(|array| {
                array
                    .iter()
                    .filter_map(Value::as_u64)
                    .map(|s| s as u8)
                    .collect()
            })
            .unwrap_or_default())
    }

    // ── Logs, events, health ──────────────────────────────────────────────────

    /// Ships a structured log record to the broker.
    pub async fn log(&self, level: &str, message: &str) -> Result<(), ClientError> {
        let envelope = Envelope::log(
            self.next_request_id(),
            self.source().to_string(),
            level,
            message,
        );
        let response = self.send(envelope).await?;
        expect_ok(response.data).map(|_| ())
    }

    /// Emits an application event (broadcast to other multi-client peers).
    pub async fn event(
        &self,
        name: &str,
        data: Map<String, Value>,
    ) -> Result<(), ClientError> {
        let envelope = Envelope::event(
            self.next_request_id(),
            self.source().to_string(),
            name,
            data,
        );
        let response = self.send(envelope).await?;
        expect_ok(response.data).map(|_| ())
    }

    /// Queries broker status and per-device connection state.
    pub async fn health(&self) -> Result<Map<String, Value>, ClientError> {
        let payload = self.request("health", Map::new()).await?;
        expect_ok(payload)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
