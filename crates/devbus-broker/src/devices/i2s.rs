//! Streaming-audio bus (I2S-style) device model.
//!
//! Recording and playback are time-bounded operations: starting a recording
//! returns immediately and a background task accumulates generated sample
//! chunks on a fixed cadence until stopped or the maximum duration elapses;
//! playback holds the caller for a duration proportional to sample count at
//! the configured sample rate. The simulated source mixes a seeded chord
//! plus noise so recordings are reproducible for a given seed.

use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::debug;

use super::{BusHealth, DeviceFault};

/// Fixed cadence of the simulated recording task.
const CHUNK_DURATION: Duration = Duration::from_millis(100);

/// Stream format configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            bit_depth: 16,
        }
    }
}

/// A tone to synthesize instead of passing raw samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ToneSpec {
    pub frequency: f64,
    pub duration: f64,
    pub amplitude: f64,
}

/// Level analysis of a sample buffer.
#[derive(Debug, Clone, Serialize)]
pub struct AudioAnalysis {
    pub rms: f64,
    pub db_level: f64,
    pub peak: i16,
    pub duration_secs: f64,
    pub samples: usize,
}

/// One audio endpoint reported by a bus scan.
#[derive(Debug, Clone, Serialize)]
pub struct AudioEndpoint {
    pub index: u32,
    pub name: &'static str,
    pub channels: u8,
    pub direction: &'static str,
}

/// Backend seam for the streaming-audio bus.
#[async_trait]
pub trait AudioBus: Send {
    fn config(&self) -> &AudioConfig;

    /// Plays `samples`, holding the caller for the stream duration, and
    /// returns the level analysis of what was played.
    async fn play(&mut self, samples: Vec<i16>) -> Result<AudioAnalysis, DeviceFault>;

    /// Starts a background recording; returns immediately.
    async fn start_recording(&mut self, max_duration: Duration) -> Result<(), DeviceFault>;

    /// Stops the recording (or collects one that hit its maximum duration)
    /// and returns the accumulated samples.
    async fn stop_recording(&mut self) -> Result<Vec<i16>, DeviceFault>;

    fn is_recording(&self) -> bool;

    /// Provisioned endpoints on this bus.
    fn endpoints(&self) -> Vec<AudioEndpoint>;

    fn health(&self) -> &BusHealth;
}

/// Synthesizes an interleaved sine tone in the configured format.
pub fn generate_tone(config: &AudioConfig, spec: &ToneSpec) -> Vec<i16> {
    let amplitude = spec.amplitude.clamp(0.0, 1.0);
    let frames = (f64::from(config.sample_rate) * spec.duration.max(0.0)) as usize;
    let mut out = Vec::with_capacity(frames * usize::from(config.channels));
    for frame in 0..frames {
        let t = frame as f64 / f64::from(config.sample_rate);
        let sample = (amplitude * (2.0 * PI * spec.frequency * t).sin() * 32767.0) as i16;
        for _ in 0..config.channels {
            out.push(sample);
        }
    }
    out
}

/// Computes RMS / peak / dB levels over an interleaved sample buffer.
pub fn analyze(config: &AudioConfig, samples: &[i16]) -> AudioAnalysis {
    let rms = if samples.is_empty() {
        0.0
    } else {
        let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
        (sum_sq / samples.len() as f64).sqrt()
    };
    let db_level = if rms > 0.0 {
        20.0 * (rms / 32767.0).log10()
    } else {
        -120.0
    };
    let peak = samples.iter().map(|s| s.saturating_abs()).max().unwrap_or(0);
    let duration_secs =
        samples.len() as f64 / (f64::from(config.sample_rate) * f64::from(config.channels));
    AudioAnalysis {
        rms,
        db_level,
        peak,
        duration_secs,
        samples: samples.len(),
    }
}

struct RecordingSession {
    buffer: Arc<Mutex<Vec<i16>>>,
    stop: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

/// In-memory audio bus simulator.
pub struct SimulatedAudio {
    config: AudioConfig,
    rng: StdRng,
    recording: Option<RecordingSession>,
    health: BusHealth,
}

impl SimulatedAudio {
    pub fn new(seed: u64, degraded_threshold: u32) -> Self {
        Self::with_config(AudioConfig::default(), seed, degraded_threshold)
    }

    pub fn with_config(config: AudioConfig, seed: u64, degraded_threshold: u32) -> Self {
        let mut health = BusHealth::new(degraded_threshold);
        health.mark_connecting();
        health.mark_connected();
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            recording: None,
            health,
        }
    }
}

#[async_trait]
impl AudioBus for SimulatedAudio {
    fn config(&self) -> &AudioConfig {
        &self.config
    }

    async fn play(&mut self, samples: Vec<i16>) -> Result<AudioAnalysis, DeviceFault> {
        let analysis = analyze(&self.config, &samples);
        debug!(
            duration_secs = analysis.duration_secs,
            db_level = analysis.db_level,
            "simulated playback"
        );
        // A simulated transfer takes as long as the real one would.
        tokio::time::sleep(Duration::from_secs_f64(analysis.duration_secs)).await;
        self.health.observe(true);
        Ok(analysis)
    }

    async fn start_recording(&mut self, max_duration: Duration) -> Result<(), DeviceFault> {
        if self.recording.is_some() {
            self.health.observe(false);
            return Err(DeviceFault::Busy("recording already in progress".into()));
        }

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let task_buffer = Arc::clone(&buffer);
        let task_stop = Arc::clone(&stop);
        let config = self.config.clone();
        // The generator task gets its own generator derived from the bus
        // seed, so recordings stay reproducible run to run.
        let mut rng = StdRng::seed_from_u64(self.rng.gen());

        let task = tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            while !task_stop.load(Ordering::Relaxed) && started.elapsed() < max_duration {
                let chunk = synth_chunk(&mut rng, &config);
                task_buffer
                    .lock()
                    .expect("recording buffer lock poisoned")
                    .extend_from_slice(&chunk);
                tokio::time::sleep(CHUNK_DURATION).await;
            }
        });

        self.recording = Some(RecordingSession { buffer, stop, task });
        self.health.observe(true);
        Ok(())
    }

    async fn stop_recording(&mut self) -> Result<Vec<i16>, DeviceFault> {
        let Some(session) = self.recording.take() else {
            self.health.observe(false);
            return Err(DeviceFault::InvalidRequest("no recording in progress".into()));
        };
        session.stop.store(true, Ordering::Relaxed);
        let _ = session.task.await;

        let samples = std::mem::take(
            &mut *session
                .buffer
                .lock()
                .expect("recording buffer lock poisoned"),
        );
        debug!(samples = samples.len(), "recording stopped");
        self.health.observe(true);
        Ok(samples)
    }

    fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    fn endpoints(&self) -> Vec<AudioEndpoint> {
        vec![
            AudioEndpoint {
                index: 0,
                name: "Simulated Input",
                channels: self.config.channels,
                direction: "input",
            },
            AudioEndpoint {
                index: 1,
                name: "Simulated Output",
                channels: self.config.channels,
                direction: "output",
            },
        ]
    }

    fn health(&self) -> &BusHealth {
        &self.health
    }
}

/// Generates one 100 ms chunk: a three-note chord with randomized amplitudes
/// plus low-level noise, interleaved per the configured channel count.
fn synth_chunk(rng: &mut StdRng, config: &AudioConfig) -> Vec<i16> {
    let frames = (f64::from(config.sample_rate) * CHUNK_DURATION.as_secs_f64()) as usize;
    let amplitudes: Vec<(f64, f64)> = [440.0, 880.0, 1320.0]
        .iter()
        .map(|&freq| (freq, rng.gen_range(0.1..0.3)))
        .collect();
    let noise_level: f64 = rng.gen_range(0.01..0.05);

    let mut out = Vec::with_capacity(frames * usize::from(config.channels));
    for frame in 0..frames {
        let t = frame as f64 / f64::from(config.sample_rate);
        let mut value: f64 = amplitudes
            .iter()
            .map(|(freq, amp)| amp * (2.0 * PI * freq * t).sin())
            .sum();
        value += noise_level * rng.gen_range(-1.0..1.0);
        let sample = (value.clamp(-1.0, 1.0) * 32767.0) as i16;
        for _ in 0..config.channels {
            out.push(sample);
        }
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────
