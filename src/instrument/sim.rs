//! Simulated instruments.
//!
//! Every device sleeps for the configured latency per command and draws its
//! noise from one seeded generator, so runs are reproducible.

use super::capabilities::{
    BridgeReading, LockInAmplifier, MagnetSupply, Oscilloscope, PressureGauge, ResistanceBridge,
    SignalGenerator,
};
use crate::error::{AppResult, DaqError};
use crate::protocol::{LockInConfig, SignalGeneratorConfig};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Maximum number of points a lock-in buffer holds.
pub const LOCKIN_BUFFER_CAPACITY: usize = 16_383;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Latency and noise source shared by the simulated devices of a station.
#[derive(Debug, Clone)]
pub struct SimClock {
    latency: Duration,
    rng: Arc<Mutex<StdRng>>,
}

impl SimClock {
    /// Clock with a per-command `latency` and noise seeded from `seed`.
    pub fn new(latency: Duration, seed: u64) -> Self {
        Self {
            latency,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Per-command latency.
    pub fn latency(&self) -> Duration {
        self.latency
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    /// Uniform noise in `[-scale, scale]`.
    fn noise(&self, scale: f64) -> f64 {
        if scale == 0.0 {
            return 0.0;
        }
        lock(&self.rng).gen_range(-scale..=scale)
    }
}

/// Multi-channel pressure gauge controller.
pub struct SimPressureGauge {
    clock: SimClock,
    channels: usize,
}

impl SimPressureGauge {
    /// Gauge with `channels` channels.
    pub fn new(clock: SimClock, channels: usize) -> Self {
        Self { clock, channels }
    }
}

#[async_trait]
impl PressureGauge for SimPressureGauge {
    async fn read_pressures(&self) -> AppResult<Vec<f64>> {
        self.clock.delay().await;
        Ok((0..self.channels)
            .map(|i| 1e-3 * 10f64.powi(i as i32 % 4) * (1.0 + self.clock.noise(0.02)))
            .collect())
    }
}

/// Multiplexed resistance bridge.
///
/// With `overrange_every = n > 0`, every n-th conversion reports overrange.
pub struct SimResistanceBridge {
    clock: SimClock,
    selected: AtomicU8,
    reads: AtomicU32,
    overrange_every: u32,
}

impl SimResistanceBridge {
    /// Bridge with overrange injection (0 disables it).
    pub fn new(clock: SimClock, overrange_every: u32) -> Self {
        Self {
            clock,
            selected: AtomicU8::new(0),
            reads: AtomicU32::new(0),
            overrange_every,
        }
    }

    /// Conversions performed so far.
    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResistanceBridge for SimResistanceBridge {
    async fn select_channel(&self, channel: u8) -> AppResult<()> {
        if channel > 7 {
            return Err(DaqError::Instrument(format!(
                "bridge channel {channel} does not exist"
            )));
        }
        self.clock.delay().await;
        self.selected.store(channel, Ordering::SeqCst);
        Ok(())
    }

    fn settle_time(&self) -> Duration {
        self.clock.latency()
    }

    async fn read_resistance(&self) -> AppResult<BridgeReading> {
        self.clock.delay().await;
        let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if self.overrange_every > 0 && n % self.overrange_every == 0 {
            return Ok(BridgeReading::Overrange);
        }
        let channel = f64::from(self.selected.load(Ordering::SeqCst));
        let base = 2_000.0 + 1_500.0 * channel;
        Ok(BridgeReading::Resistance(base * (1.0 + self.clock.noise(0.01))))
    }
}

/// Signal generator driving the AC field coil.
pub struct SimSignalGenerator {
    clock: SimClock,
    config: Mutex<SignalGeneratorConfig>,
}

impl SimSignalGenerator {
    /// Generator starting with the output off (zero amplitude).
    pub fn new(clock: SimClock) -> Self {
        Self {
            clock,
            config: Mutex::new(SignalGeneratorConfig {
                amplitude: 0.0,
                frequency: 1000.0,
            }),
        }
    }

    fn current(&self) -> SignalGeneratorConfig {
        *lock(&self.config)
    }
}

#[async_trait]
impl SignalGenerator for SimSignalGenerator {
    async fn configure(&self, config: SignalGeneratorConfig) -> AppResult<()> {
        if config.frequency <= 0.0 || config.amplitude < 0.0 {
            return Err(DaqError::Instrument(format!(
                "signal generator rejected {config:?}"
            )));
        }
        self.clock.delay().await;
        *lock(&self.config) = config;
        Ok(())
    }

    async fn config(&self) -> AppResult<SignalGeneratorConfig> {
        self.clock.delay().await;
        Ok(self.current())
    }
}

/// Oscilloscope looking at the shunt resistor of the AC coil.
pub struct SimOscilloscope {
    clock: SimClock,
    trace_len: usize,
    horizontal_scale: Mutex<f64>,
    source: Arc<SimSignalGenerator>,
}

impl SimOscilloscope {
    /// Scope whose channel 1 shows the output of `source`.
    pub fn new(clock: SimClock, trace_len: usize, source: Arc<SimSignalGenerator>) -> Self {
        Self {
            clock,
            trace_len: trace_len.max(1),
            horizontal_scale: Mutex::new(100e-5),
            source,
        }
    }
}

#[async_trait]
impl Oscilloscope for SimOscilloscope {
    async fn set_horizontal_scale(&self, secs_per_div: f64) -> AppResult<()> {
        if secs_per_div <= 0.0 {
            return Err(DaqError::Instrument(format!(
                "invalid horizontal scale {secs_per_div}"
            )));
        }
        self.clock.delay().await;
        *lock(&self.horizontal_scale) = secs_per_div;
        Ok(())
    }

    fn horizontal_scale(&self) -> f64 {
        *lock(&self.horizontal_scale)
    }

    async fn capture_trace(&self) -> AppResult<Vec<f64>> {
        let window = 10.0 * self.horizontal_scale();
        self.clock.delay().await;
        tokio::time::sleep(Duration::from_secs_f64(window)).await;

        let signal = self.source.current();
        let peak = signal.amplitude / 2.0;
        let dt = window / self.trace_len as f64;
        Ok((0..self.trace_len)
            .map(|i| {
                let t = i as f64 * dt;
                peak * (2.0 * PI * signal.frequency * t).sin() + self.clock.noise(peak * 0.01)
            })
            .collect())
    }
}

/// Superconducting magnet supply.
pub struct SimMagnetSupply {
    clock: SimClock,
    field: Mutex<f64>,
    writes: AtomicUsize,
}

impl SimMagnetSupply {
    /// Supply sitting at `initial_field`.
    pub fn new(clock: SimClock, initial_field: f64) -> Self {
        Self {
            clock,
            field: Mutex::new(initial_field),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of field commands received.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MagnetSupply for SimMagnetSupply {
    async fn field(&self) -> AppResult<f64> {
        self.clock.delay().await;
        Ok(*lock(&self.field))
    }

    async fn set_field(&self, tesla: f64) -> AppResult<()> {
        if !tesla.is_finite() {
            return Err(DaqError::Instrument(format!("invalid field {tesla}")));
        }
        self.clock.delay().await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        *lock(&self.field) = tesla;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BufferState {
    started: Option<Instant>,
    points: usize,
}

/// Buffered lock-in amplifier.
pub struct SimLockIn {
    clock: SimClock,
    config: Mutex<LockInConfig>,
    buffer: Mutex<BufferState>,
}

impl SimLockIn {
    /// Lock-in with factory settings.
    pub fn new(clock: SimClock) -> Self {
        Self {
            clock,
            config: Mutex::new(LockInConfig {
                sensitivity: 1e-6,
                frequency: 512.0,
                buffer_size: 256,
            }),
            buffer: Mutex::new(BufferState::default()),
        }
    }

    fn filled_points(&self, state: &BufferState) -> usize {
        let rate = lock(&self.config).frequency;
        let running = state
            .started
            .map(|t| (t.elapsed().as_secs_f64() * rate) as usize)
            .unwrap_or(0);
        (state.points + running).min(LOCKIN_BUFFER_CAPACITY)
    }
}

#[async_trait]
impl LockInAmplifier for SimLockIn {
    async fn configure(&self, config: LockInConfig) -> AppResult<()> {
        if config.frequency <= 0.0 || config.sensitivity <= 0.0 {
            return Err(DaqError::Instrument(format!("lock-in rejected {config:?}")));
        }
        self.clock.delay().await;
        *lock(&self.config) = config;
        Ok(())
    }

    async fn config(&self) -> AppResult<LockInConfig> {
        self.clock.delay().await;
        Ok(*lock(&self.config))
    }

    async fn buffer_reset(&self) -> AppResult<()> {
        self.clock.delay().await;
        *lock(&self.buffer) = BufferState::default();
        Ok(())
    }

    async fn buffer_start(&self) -> AppResult<()> {
        self.clock.delay().await;
        lock(&self.buffer).started = Some(Instant::now());
        Ok(())
    }

    async fn buffer_pause(&self) -> AppResult<()> {
        self.clock.delay().await;
        let mut state = lock(&self.buffer);
        let points = self.filled_points(&state);
        state.points = points;
        state.started = None;
        Ok(())
    }

    async fn read_buffers(&self) -> AppResult<(Vec<f64>, Vec<f64>)> {
        self.clock.delay().await;
        let points = {
            let state = lock(&self.buffer);
            self.filled_points(&state)
        };
        let sensitivity = lock(&self.config).sensitivity;
        let ch1 = (0..points)
            .map(|_| sensitivity * (0.3 + self.clock.noise(0.01)))
            .collect();
        let ch2 = (0..points).map(|_| 12.0 + self.clock.noise(0.5)).collect();
        Ok((ch1, ch2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> SimClock {
        SimClock::new(Duration::ZERO, 42)
    }

    #[tokio::test]
    async fn bridge_injects_overrange() {
        let bridge = SimResistanceBridge::new(clock(), 3);
        bridge.select_channel(2).await.unwrap();
        let readings: Vec<BridgeReading> = futures::future::join_all(
            (0..3).map(|_| bridge.read_resistance()),
        )
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
        assert!(matches!(readings[0], BridgeReading::Resistance(_)));
        assert_eq!(readings[2], BridgeReading::Overrange);
        assert!(bridge.select_channel(9).await.is_err());
    }

    #[tokio::test]
    async fn magnet_counts_writes() {
        let magnet = SimMagnetSupply::new(clock(), 0.0);
        magnet.set_field(1.5).await.unwrap();
        assert_eq!(magnet.field().await.unwrap(), 1.5);
        assert_eq!(magnet.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lockin_fills_at_configured_rate() {
        let lockin = SimLockIn::new(clock());
        lockin
            .configure(LockInConfig {
                sensitivity: 1e-6,
                frequency: 100.0,
                buffer_size: 10,
            })
            .await
            .unwrap();
        lockin.buffer_reset().await.unwrap();
        lockin.buffer_start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        lockin.buffer_pause().await.unwrap();
        let (ch1, ch2) = lockin.read_buffers().await.unwrap();
        assert_eq!(ch1.len(), 50);
        assert_eq!(ch2.len(), 50);
    }

    #[tokio::test]
    async fn scope_trace_follows_generator_amplitude() {
        let generator = Arc::new(SimSignalGenerator::new(clock()));
        generator
            .configure(SignalGeneratorConfig {
                amplitude: 2.0,
                frequency: 1000.0,
            })
            .await
            .unwrap();
        let scope = SimOscilloscope::new(clock(), 1000, generator);
        scope.set_horizontal_scale(1e-4).await.unwrap();
        let trace = scope.capture_trace().await.unwrap();
        let peak = trace.iter().cloned().fold(0.0_f64, f64::max);
        assert!(peak > 0.9 && peak < 1.1);
    }
}
