//! HeartbeatLoop.
//!
//! Stamps the liveness marker through [`PresenceStore::heartbeat`] on a fixed
//! interval. A run of consecutive failures ends the loop with an error, which
//! the supervisor treats as the signal to shut the whole relay down.

use crate::store::{DeviceTable, PresenceStore, StoreError};
use crate::utils::clock::display;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::PrimitiveDateTime;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("store unavailable after {failures} consecutive heartbeat failures: {source}")]
    StoreUnavailable { failures: u32, source: StoreError },
}

pub struct HeartbeatLoop<T> {
    store: Arc<PresenceStore<T>>,
    settings: HeartbeatSettings,
    shutdown_rx: watch::Receiver<bool>,
    status_tx: watch::Sender<Option<PrimitiveDateTime>>,
}

impl<T: DeviceTable> HeartbeatLoop<T> {
    /// `status_tx` receives every successful stamp.
    pub fn new(
        store: Arc<PresenceStore<T>>,
        settings: HeartbeatSettings,
        shutdown_rx: watch::Receiver<bool>,
        status_tx: watch::Sender<Option<PrimitiveDateTime>>,
    ) -> Self {
        Self {
            store,
            settings,
            shutdown_rx,
            status_tx,
        }
    }

    /// Tick until shutdown. The first stamp is written immediately.
    pub async fn run(mut self) -> Result<(), HeartbeatError> {
        info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            max_consecutive_failures = self.settings.max_consecutive_failures,
            "HeartbeatLoop started"
        );

        let limit = self.settings.max_consecutive_failures.max(1);
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        if *self.shutdown_rx.borrow_and_update() {
            return Ok(());
        }

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("HeartbeatLoop shutting down");
                        return Ok(());
                    }
                }

                _ = ticker.tick() => {
                    match self.store.heartbeat().await {
                        Ok(at) => {
                            if failures > 0 {
                                info!(failures, "Heartbeat recovered");
                            }
                            failures = 0;
                            debug!(at = %display(at), "Heartbeat");
                            self.status_tx.send_replace(Some(at));
                        }
                        Err(e) => {
                            failures += 1;
                            if failures >= limit {
                                error!(failures, error = %e, "Heartbeat failed, giving up");
                                return Err(HeartbeatError::StoreUnavailable { failures, source: e });
                            }
                            warn!(failures, limit, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DeviceKey;
    use crate::testing::InMemoryDeviceTable;
    use time::macros::datetime;

    fn setup(
        settings: HeartbeatSettings,
    ) -> (
        Arc<PresenceStore<InMemoryDeviceTable>>,
        watch::Sender<bool>,
        watch::Receiver<Option<PrimitiveDateTime>>,
        HeartbeatLoop<InMemoryDeviceTable>,
    ) {
        let table = InMemoryDeviceTable::new();
        table.seed(&DeviceKey::new("C1", "D9", "M1"), datetime!(2024-01-15 09:30:00));
        let store = Arc::new(PresenceStore::new(table));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(None);
        let heartbeat = HeartbeatLoop::new(store.clone(), settings, shutdown_rx, status_tx);
        (store, shutdown_tx, status_rx, heartbeat)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stamps_on_every_tick() {
        let (store, shutdown_tx, mut status_rx, heartbeat) = setup(HeartbeatSettings::default());
        let handle = tokio::spawn(heartbeat.run());

        status_rx.changed().await.unwrap();
        let first = status_rx.borrow_and_update().unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;
        let latest = status_rx.borrow().unwrap();
        assert!(latest > first);

        let record = store.table().record(&DeviceKey::new("C1", "D9", "M1")).unwrap();
        assert_eq!(record.current_heartbeat, Some(latest));

        shutdown_tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_consecutive_failures() {
        let (store, _shutdown_tx, status_rx, heartbeat) = setup(HeartbeatSettings::default());
        store.table().set_available(false);

        let result = heartbeat.run().await;
        assert!(matches!(
            result,
            Err(HeartbeatError::StoreUnavailable { failures: 3, .. })
        ));
        assert!(status_rx.borrow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let (store, shutdown_tx, status_rx, heartbeat) = setup(HeartbeatSettings::default());
        store.table().set_available(false);
        let handle = tokio::spawn(heartbeat.run());

        // Ticks at 0s and 10s fail, 20s succeeds.
        tokio::time::sleep(Duration::from_secs(15)).await;
        store.table().set_available(true);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(status_rx.borrow().is_some());

        // Two more failures stay under the limit.
        store.table().set_available(false);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!handle.is_finished());

        shutdown_tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let (store, shutdown_tx, _status_rx, heartbeat) = setup(HeartbeatSettings::default());
        shutdown_tx.send(true).unwrap();
        assert!(heartbeat.run().await.is_ok());
        assert_eq!(store.table().calls(), 0);
    }
}
