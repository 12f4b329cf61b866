//! Cryogenics station: pressure gauges and the temperature bridge.

use super::sim_clock;
use crate::config::{CryoConfig, Settings, StaleReadingPolicy};
use crate::error::{AppResult, DaqError};
use crate::experiment::{ChannelReading, CryoSample, Step};
use crate::instrument::sim::{SimPressureGauge, SimResistanceBridge};
use crate::instrument::{BridgeReading, PressureGauge, SharedBridge};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Pressure gauges plus a multiplexed resistance bridge.
///
/// Shared between the step task and the background temperature poll, so
/// every method takes `&self`; bridge access is serialized by [`SharedBridge`].
pub struct CryoStation {
    gauge: Arc<dyn PressureGauge>,
    bridge: SharedBridge,
    config: CryoConfig,
    started: Instant,
    last_good: Mutex<HashMap<u8, f64>>,
}

impl std::fmt::Debug for CryoStation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryoStation")
            .field("bridge", &self.bridge)
            .field("channels", &self.config.bridge_channels)
            .finish()
    }
}

impl CryoStation {
    /// Station over the given instruments.
    pub fn new(gauge: Arc<dyn PressureGauge>, bridge: SharedBridge, config: CryoConfig) -> Self {
        Self {
            gauge,
            bridge,
            config,
            started: Instant::now(),
            last_good: Mutex::new(HashMap::new()),
        }
    }

    /// Station over simulated instruments.
    pub fn simulated(settings: &Settings) -> Self {
        let clock = sim_clock(&settings.simulation);
        let gauge = SimPressureGauge::new(clock.clone(), settings.cryo.pressure_channels);
        let bridge = SimResistanceBridge::new(clock, settings.simulation.overrange_every);
        Self::new(
            Arc::new(gauge),
            SharedBridge::new("avs47b", Arc::new(bridge)),
            settings.cryo.clone(),
        )
    }

    /// The shared bridge.
    pub fn bridge(&self) -> &SharedBridge {
        &self.bridge
    }

    /// Nothing on this station depends on the step settings.
    pub async fn apply_step_configuration(&self, step: &Step) -> AppResult<()> {
        debug!(step_id = %step.id, "cryo station has no step configuration to apply");
        Ok(())
    }

    /// Reads every pressure channel and one full bridge cycle.
    ///
    /// `owner` names the caller in bridge contention errors.
    pub async fn sample_once(&self, owner: &str) -> AppResult<CryoSample> {
        let (pressures, temperatures) =
            tokio::try_join!(self.gauge.read_pressures(), self.read_temperatures(owner))?;
        Ok(CryoSample {
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
            pressures,
            temperatures,
        })
    }

    async fn read_temperatures(&self, owner: &str) -> AppResult<Vec<ChannelReading>> {
        let mut readings = Vec::with_capacity(self.config.bridge_channels.len());
        for &channel in &self.config.bridge_channels {
            readings.push(self.read_channel(owner, channel).await?);
        }
        Ok(readings)
    }

    async fn read_channel(&self, owner: &str, channel: u8) -> AppResult<ChannelReading> {
        let attempts = self.config.bridge_max_retries.max(1);
        let lock_timeout = Duration::from_millis(self.config.bridge_lock_timeout_ms);

        for attempt in 1..=attempts {
            let reading = {
                let guard = self.bridge.acquire(owner, lock_timeout).await?;
                guard.read_channel(channel).await?
            };
            match reading {
                BridgeReading::Resistance(resistance) => {
                    self.last_good
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(channel, resistance);
                    return Ok(self.convert(channel, Some(resistance), false));
                }
                BridgeReading::Overrange => {
                    debug!(channel, attempt, "bridge overrange");
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(self.config.bridge_retry_delay_ms))
                            .await;
                    }
                }
            }
        }

        match self.config.stale_reading_policy {
            StaleReadingPolicy::UseLastReading => {
                let last = self
                    .last_good
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&channel)
                    .copied();
                warn!(
                    channel,
                    attempts,
                    has_previous = last.is_some(),
                    "bridge channel stayed overranged, keeping last reading"
                );
                Ok(self.convert(channel, last, true))
            }
            StaleReadingPolicy::FailSample => {
                warn!(channel, attempts, "bridge channel stayed overranged");
                Err(DaqError::Overrange { channel, attempts })
            }
        }
    }

    fn convert(&self, channel: u8, resistance: Option<f64>, stale: bool) -> ChannelReading {
        let temperature = resistance
            .zip(self.config.calibration_for(channel))
            .map(|(r, curve)| curve.temperature(r))
            .filter(|t| t.is_finite());
        ChannelReading {
            channel,
            resistance,
            temperature,
            stale,
        }
    }
}
