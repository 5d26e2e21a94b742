//! Digital I/O device model.
//!
//! A flat pin table with per-pin direction, level, and optional PWM state.
//! Setting a level or starting PWM on an unconfigured pin provisions it as
//! an output first, so a set followed by a get always observes the written
//! level.

use std::collections::BTreeMap;

use super::{BusHealth, DeviceFault};

/// Pin direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    Input,
    Output,
}

/// Software PWM state attached to a pin.
#[derive(Debug, Clone, PartialEq)]
pub struct PwmState {
    pub frequency: f64,
    pub duty_cycle: f64,
    pub active: bool,
}

/// State of one provisioned pin.
#[derive(Debug, Clone, PartialEq)]
pub struct PinState {
    pub direction: PinDirection,
    pub level: u8,
    pub pwm: Option<PwmState>,
}

/// Backend seam for the digital I/O bus. The live variant binds to a
/// hardware GPIO character device; the simulated variant below is the one
/// shipped with the broker.
pub trait GpioBus: Send {
    /// Drives `pin` to `value` (0 or 1), provisioning it as an output when
    /// unconfigured.
    fn set(&mut self, pin: u8, value: u8) -> Result<(), DeviceFault>;

    /// Reads the current level of `pin`; unprovisioned pins read low.
    fn get(&mut self, pin: u8) -> Result<u8, DeviceFault>;

    /// Starts (or retunes) PWM on `pin`.
    fn start_pwm(&mut self, pin: u8, frequency: f64, duty_cycle: f64) -> Result<(), DeviceFault>;

    /// Returns the sorted set of provisioned pins.
    fn scan(&self) -> Vec<u8>;

    fn health(&self) -> &BusHealth;
}

/// In-memory GPIO simulator.
#[derive(Debug)]
pub struct SimulatedGpio {
    pins: BTreeMap<u8, PinState>,
    health: BusHealth,
}

impl SimulatedGpio {
    pub fn new(degraded_threshold: u32) -> Self {
        let mut health = BusHealth::new(degraded_threshold);
        health.mark_connecting();
        health.mark_connected();
        Self {
            pins: BTreeMap::new(),
            health,
        }
    }

    /// Direct pin inspection for tests and the health snapshot.
    pub fn pin(&self, pin: u8) -> Option<&PinState> {
        self.pins.get(&pin)
    }

    fn provision(&mut self, pin: u8, direction: PinDirection) -> &mut PinState {
        self.pins.entry(pin).or_insert(PinState {
            direction,
            level: 0,
            pwm: None,
        })
    }
}

impl GpioBus for SimulatedGpio {
    fn set(&mut self, pin: u8, value: u8) -> Result<(), DeviceFault> {
        let state = self.provision(pin, PinDirection::Output);
        state.direction = PinDirection::Output;
        state.level = value;
        self.health.observe(true);
        Ok(())
    }

    fn get(&mut self, pin: u8) -> Result<u8, DeviceFault> {
        let level = self.pins.get(&pin).map_or(0, |p| p.level);
        self.health.observe(true);
        Ok(level)
    }

    fn start_pwm(&mut self, pin: u8, frequency: f64, duty_cycle: f64) -> Result<(), DeviceFault> {
        let state = self.provision(pin, PinDirection::Output);
        state.pwm = Some(PwmState {
            frequency,
            duty_cycle,
            active: true,
        });
        self.health.observe(true);
        Ok(())
    }

    fn scan(&self) -> Vec<u8> {
        self.pins.keys().copied().collect()
    }

    fn health(&self) -> &BusHealth {
        &self.health
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
