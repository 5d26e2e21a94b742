//! TOML-based broker configuration.
//!
//! The broker reads a single `config.toml` describing transports, device
//! provisioning, and runtime limits. Every field carries a serde default so
//! a missing file (or a file from an older release missing newer fields)
//! still produces a working configuration. The binary layers CLI flags and
//! environment variables on top (see `main.rs`).
//!
//! Configuration problems are the only errors allowed to terminate the
//! process, and only at startup.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A transport endpoint string is not a valid socket address.
    #[error("invalid {which} endpoint {value:?}: {source}")]
    InvalidEndpoint {
        which: &'static str,
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },

    /// A device was configured with `simulated = false`; live bus backends
    /// are not part of this build.
    #[error("device {0:?} requested a live backend, which is not available in this build")]
    LiveBackendUnavailable(&'static str),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level broker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub devices: DevicesSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// Core runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Source identity stamped on broker-originated envelopes.
    #[serde(default = "default_name")]
    pub name: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seed for every simulated device's jitter generator. The same seed
    /// always reproduces the same readings.
    #[serde(default)]
    pub seed: u64,
    /// Per-request dispatch deadline in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Trace buffer capacity (envelopes). Oldest entries are evicted FIFO.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Consecutive faults before a device connection is marked degraded.
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,
}

/// Transport endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    /// Bind address for the strict request/reply TCP listener.
    #[serde(default = "default_duplex_addr")]
    pub duplex_addr: String,
    /// Bind address for the multi-client WebSocket listener.
    #[serde(default = "default_ws_addr")]
    pub ws_addr: String,
}

/// Which device models exist and whether they are simulated.
///
/// `simulated = false` would select a live hardware backend; this build
/// ships only the simulated implementations, so `false` is a startup error
/// rather than a silent fallback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DevicesSection {
    #[serde(default = "default_device")]
    pub gpio: DeviceToggle,
    #[serde(default = "default_device")]
    pub i2c: DeviceToggle,
    #[serde(default = "default_device")]
    pub i2s: DeviceToggle,
    #[serde(default = "default_device")]
    pub rs485: DeviceToggle,
}

/// Per-device enable / simulation toggle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DeviceToggle {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub simulated: bool,
}

/// Background telemetry cadence, one interval per bus. `0` disables a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    #[serde(default = "default_i2c_interval_ms")]
    pub i2c_interval_ms: u64,
    #[serde(default = "default_i2s_interval_ms")]
    pub i2s_interval_ms: u64,
    #[serde(default = "default_rs485_interval_ms")]
    pub rs485_interval_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

fn default_name() -> String {
    "broker".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_degraded_threshold() -> u32 {
    3
}

fn default_duplex_addr() -> String {
    "127.0.0.1:5555".to_string()
}

fn default_ws_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_device() -> DeviceToggle {
    DeviceToggle {
        enabled: true,
        simulated: true,
    }
}

fn default_i2c_interval_ms() -> u64 {
    2000
}

fn default_i2s_interval_ms() -> u64 {
    1000
}

fn default_rs485_interval_ms() -> u64 {
    3000
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            seed: 0,
            request_timeout_ms: default_request_timeout_ms(),
            buffer_capacity: default_buffer_capacity(),
            degraded_threshold: default_degraded_threshold(),
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            duplex_addr: default_duplex_addr(),
            ws_addr: default_ws_addr(),
        }
    }
}

impl Default for DevicesSection {
    fn default() -> Self {
        Self {
            gpio: default_device(),
            i2c: default_device(),
            i2s: default_device(),
            rs485: default_device(),
        }
    }
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            i2c_interval_ms: default_i2c_interval_ms(),
            i2s_interval_ms: default_i2s_interval_ms(),
            rs485_interval_ms: default_rs485_interval_ms(),
        }
    }
}

// ── Loading and validation ────────────────────────────────────────────────────

impl BrokerConfig {
    /// Loads configuration from `path`. A missing file yields defaults;
    /// unreadable or unparseable content is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        Ok(config)
    }

    /// Validates everything that must be checked before startup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an unparseable endpoint or a device
    /// requesting a live backend.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.duplex_addr()?;
        self.ws_addr()?;
        for (name, toggle) in [
            ("gpio", self.devices.gpio),
            ("i2c", self.devices.i2c),
            ("i2s", self.devices.i2s),
            ("rs485", self.devices.rs485),
        ] {
            if toggle.enabled && !toggle.simulated {
                return Err(ConfigError::LiveBackendUnavailable(name));
            }
        }
        Ok(())
    }

    /// Parsed duplex listener address.
    pub fn duplex_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.transport
            .duplex_addr
            .parse()
            .map_err(|source| ConfigError::InvalidEndpoint {
                which: "duplex",
                value: self.transport.duplex_addr.clone(),
                source,
            })
    }

    /// Parsed WebSocket listener address.
    pub fn ws_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.transport
            .ws_addr
            .parse()
            .map_err(|source| ConfigError::InvalidEndpoint {
                which: "websocket",
                value: self.transport.ws_addr.clone(),
                source,
            })
    }

    /// Per-request dispatch deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.broker.request_timeout_ms)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
