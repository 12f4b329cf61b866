//! Shared resistance bridge with exclusive access.
//!
//! The step task and the background temperature poll both switch the bridge
//! multiplexer. A channel read (switch, settle, convert) must never be
//! interleaved with another, so every read happens under a [`BridgeGuard`].
//! Acquisition waits up to a timeout and then reports who holds the bridge.

use super::capabilities::{BridgeReading, ResistanceBridge};
use crate::error::{AppResult, DaqError};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::trace;

/// Shared bridge wrapper with exclusive access control.
#[derive(Clone)]
pub struct SharedBridge {
    name: Arc<str>,
    device: Arc<Mutex<Arc<dyn ResistanceBridge>>>,
    owner: Arc<StdMutex<Option<String>>>,
}

impl std::fmt::Debug for SharedBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBridge")
            .field("name", &self.name)
            .field("owner", &self.current_owner())
            .finish()
    }
}

impl SharedBridge {
    /// Wraps `bridge`; `name` is used in errors and logs.
    pub fn new(name: &str, bridge: Arc<dyn ResistanceBridge>) -> Self {
        Self {
            name: Arc::from(name),
            device: Arc::new(Mutex::new(bridge)),
            owner: Arc::new(StdMutex::new(None)),
        }
    }

    /// Who holds the bridge right now.
    pub fn current_owner(&self) -> Option<String> {
        self.owner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether the bridge is free.
    pub fn is_available(&self) -> bool {
        self.current_owner().is_none()
    }

    /// Acquires exclusive access, waiting at most `acquire_timeout`.
    pub async fn acquire(&self, owner: &str, acquire_timeout: Duration) -> AppResult<BridgeGuard> {
        match timeout(acquire_timeout, self.device.clone().lock_owned()).await {
            Ok(device) => {
                *self.owner.lock().unwrap_or_else(|e| e.into_inner()) = Some(owner.to_string());
                trace!(bridge = %self.name, owner, "bridge acquired");
                Ok(BridgeGuard {
                    device,
                    owner: self.owner.clone(),
                })
            }
            Err(_) => Err(DaqError::DeviceBusy {
                device: self.name.to_string(),
                holder: self.current_owner().unwrap_or_else(|| "unknown".to_string()),
            }),
        }
    }
}

/// RAII guard over the bridge; releases ownership on drop.
pub struct BridgeGuard {
    device: OwnedMutexGuard<Arc<dyn ResistanceBridge>>,
    owner: Arc<StdMutex<Option<String>>>,
}

impl std::fmt::Debug for BridgeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let owner = self.owner.lock().unwrap_or_else(|e| e.into_inner()).clone();
        f.debug_struct("BridgeGuard").field("owner", &owner).finish()
    }
}

impl BridgeGuard {
    /// One full switch, settle and convert cycle on `channel`.
    pub async fn read_channel(&self, channel: u8) -> AppResult<BridgeReading> {
        self.device.select_channel(channel).await?;
        tokio::time::sleep(self.device.settle_time()).await;
        self.device.read_resistance().await
    }
}

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        *self.owner.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::sim::{SimClock, SimResistanceBridge};

    fn bridge() -> SharedBridge {
        let sim = SimResistanceBridge::new(SimClock::new(Duration::ZERO, 1), 0);
        SharedBridge::new("avs47b", Arc::new(sim))
    }

    #[tokio::test]
    async fn guard_tracks_owner() {
        let bridge = bridge();
        {
            let guard = bridge.acquire("step", Duration::from_millis(10)).await.unwrap();
            assert_eq!(bridge.current_owner().as_deref(), Some("step"));
            assert!(matches!(
                guard.read_channel(1).await.unwrap(),
                BridgeReading::Resistance(_)
            ));
        }
        assert!(bridge.is_available());
    }

    #[tokio::test]
    async fn second_acquire_times_out_with_holder() {
        let bridge = bridge();
        let guard = bridge.acquire("step", Duration::from_millis(10)).await.unwrap();
        assert!(format!("{guard:?}").contains("step"));
        let err = bridge
            .acquire("telemetry", Duration::from_millis(10))
            .await
            .unwrap_err();
        match err {
            DaqError::DeviceBusy { device, holder } => {
                assert_eq!(device, "avs47b");
                assert_eq!(holder, "step");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn waiter_gets_the_bridge_after_release() {
        let bridge = bridge();
        let guard = bridge.acquire("step", Duration::from_millis(10)).await.unwrap();
        let other = bridge.clone();
        let waiter = tokio::spawn(async move {
            other
                .acquire("telemetry", Duration::from_secs(1))
                .await
                .map(|_| ())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        waiter.await.unwrap().unwrap();
    }
}
