//! Device models.
//!
//! Each bus module defines a backend trait (the seam where a live hardware
//! driver would plug in) and the simulated implementation that ships with
//! the broker. All register state lives inside the models; access is
//! serialized per device by the router, so the models themselves are plain
//! mutable state machines with no internal locking.
//!
//! Shared across every bus:
//!
//! - [`DeviceFault`]: the fault taxonomy surfaced in response payloads.
//! - [`BusHealth`]: the per-connection health state machine
//!   (`Disconnected → Connecting → Connected → Degraded`).

use serde::Serialize;
use thiserror::Error;

pub mod gpio;
pub mod i2c;
pub mod i2s;
pub mod rs485;

pub use gpio::{GpioBus, SimulatedGpio};
pub use i2c::{I2cBus, SimulatedI2c};
pub use i2s::{AudioBus, AudioConfig, SimulatedAudio, ToneSpec};
pub use rs485::{Rs485Bus, SimulatedRs485};

// ── Fault taxonomy ────────────────────────────────────────────────────────────

/// Faults raised by device models.
///
/// Every variant leaves device state unchanged: validation (addressing,
/// checksums, read-only checks) happens before any register mutation, so a
/// faulted request never half-applies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceFault {
    /// No device answers at this bus address / slave id.
    #[error("device {0:#04x} not found on bus")]
    DeviceNotFound(u16),

    /// The addressed register does not exist on the target device.
    #[error("address {address:#06x} out of range on device {device:#04x}")]
    AddressOutOfRange { device: u16, address: u16 },

    /// Write attempted on a read-only register.
    #[error("register {0:#04x} is read-only")]
    ReadOnlyRegister(u16),

    /// Framed-request checksum mismatch; the request was discarded whole.
    #[error("frame checksum mismatch: expected {expected:#06x}, received {received:#06x}")]
    ChecksumError { expected: u16, received: u16 },

    /// The bus is occupied by an exclusive operation (e.g. a recording in
    /// progress).
    #[error("bus busy: {0}")]
    Busy(String),

    /// Structurally invalid request for this bus.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl DeviceFault {
    /// Stable snake_case identifier used in response payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceFault::DeviceNotFound(_) => "device_not_found",
            DeviceFault::AddressOutOfRange { .. } => "address_out_of_range",
            DeviceFault::ReadOnlyRegister(_) => "read_only",
            DeviceFault::ChecksumError { .. } => "checksum_error",
            DeviceFault::Busy(_) => "busy",
            DeviceFault::InvalidRequest(_) => "invalid_request",
        }
    }
}

// ── Bus health state machine ──────────────────────────────────────────────────

/// Bus-level connection state (per device connection, not per register).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusState {
    Disconnected,
    Connecting,
    Connected,
    /// Entered after N consecutive faults; exits to `Connected` on the next
    /// successful transaction. Does not block requests; it only annotates
    /// responses.
    Degraded,
}

/// Tracks consecutive faults and drives the [`BusState`] transitions.
#[derive(Debug, Clone)]
pub struct BusHealth {
    state: BusState,
    consecutive_faults: u32,
    threshold: u32,
    total_faults: u64,
    total_transactions: u64,
}

impl BusHealth {
    /// Creates a health tracker; `threshold` consecutive faults enter
    /// `Degraded`. A threshold of 0 is treated as 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            state: BusState::Disconnected,
            consecutive_faults: 0,
            threshold: threshold.max(1),
            total_faults: 0,
            total_transactions: 0,
        }
    }

    /// Marks the connection attempt in progress.
    pub fn mark_connecting(&mut self) {
        self.state = BusState::Connecting;
    }

    /// Marks the bus connected (initial provisioning complete).
    pub fn mark_connected(&mut self) {
        self.state = BusState::Connected;
        self.consecutive_faults = 0;
    }

    /// Records the outcome of one transaction.
    pub fn observe(&mut self, ok: bool) {
        self.total_transactions += 1;
        if ok {
            self.consecutive_faults = 0;
            if self.state == BusState::Degraded {
                self.state = BusState::Connected;
            }
        } else {
            self.total_faults += 1;
            self.consecutive_faults += 1;
            if self.state == BusState::Connected && self.consecutive_faults >= self.threshold {
                self.state = BusState::Degraded;
            }
        }
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    pub fn is_degraded(&self) -> bool {
        self.state == BusState::Degraded
    }

    pub fn total_faults(&self) -> u64 {
        self.total_faults
    }

    pub fn total_transactions(&self) -> u64 {
        self.total_transactions
    }
}

/// Health summary for one device, reported by the health query.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceHealth {
    pub device: &'static str,
    pub state: BusState,
    pub degraded: bool,
    pub faults: u64,
    pub transactions: u64,
}

impl DeviceHealth {
    pub fn from_health(device: &'static str, health: &BusHealth) -> Self {
        Self {
            device,
            state: health.state(),
            degraded: health.is_degraded(),
            faults: health.total_faults(),
            transactions: health.total_transactions(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
