//! Supervisor.
//!
//! Owns the relay's lifecycle: provision every configured channel, start one
//! [`ChannelConsumer`] per subscription plus the [`HeartbeatLoop`], then wait.
//! The heartbeat is the liveness proxy: when it gives up, or when an external
//! shutdown arrives, the shutdown signal is fanned out and consumers get
//! `drain_timeout` to finish their in-hand batch before being aborted. A
//! consumer that fails on its own is logged and does not stop the others.

use super::channel_consumer::{ChannelConsumer, ConsumeError, ConsumerSettings, ConsumerStats};
use super::channel_provisioner::{ChannelProvisioner, ProvisioningError};
use super::heartbeat::{HeartbeatError, HeartbeatLoop, HeartbeatSettings};
use crate::bus::{BusError, ChannelManager, SubscriptionHandle, SubscriptionSource};
use crate::store::{DeviceTable, PresenceStore};
use lastseen_sdk::config::{ChannelConfig, ChannelPolicy};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::PrimitiveDateTime;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub channels: Vec<ChannelConfig>,
    pub policy: ChannelPolicy,
    pub consumer: ConsumerSettings,
    pub heartbeat: HeartbeatSettings,
    pub drain_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            channels: ChannelConfig::defaults(),
            policy: ChannelPolicy::default(),
            consumer: ConsumerSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error("failed to open receiver for {subscription}: {source}")]
    Receiver {
        subscription: String,
        source: BusError,
    },

    #[error(transparent)]
    HeartbeatFailed(#[from] HeartbeatError),

    #[error("heartbeat task failed: {0}")]
    HeartbeatTask(#[from] JoinError),
}

type ConsumerResult = Result<Result<ConsumerStats, ConsumeError>, JoinError>;

pub struct Supervisor<B, T> {
    bus: Arc<B>,
    store: Arc<PresenceStore<T>>,
    settings: SupervisorSettings,
    status_tx: watch::Sender<Option<PrimitiveDateTime>>,
}

impl<B, T> Supervisor<B, T>
where
    B: ChannelManager + SubscriptionSource + 'static,
    T: DeviceTable + 'static,
{
    pub fn new(bus: Arc<B>, store: Arc<PresenceStore<T>>, settings: SupervisorSettings) -> Self {
        let (status_tx, _) = watch::channel(None);
        Self {
            bus,
            store,
            settings,
            status_tx,
        }
    }

    /// Latest successful heartbeat stamp, `None` until the first one.
    pub fn heartbeat_status(&self) -> watch::Receiver<Option<PrimitiveDateTime>> {
        self.status_tx.subscribe()
    }

    pub fn store(&self) -> &Arc<PresenceStore<T>> {
        &self.store
    }

    /// Ensure every configured channel, one after another.
    pub async fn provision(&self) -> Result<Vec<SubscriptionHandle>, ProvisioningError> {
        let provisioner = ChannelProvisioner::new(self.bus.clone(), self.settings.policy);
        let mut subscriptions = Vec::with_capacity(self.settings.channels.len());
        for channel in &self.settings.channels {
            subscriptions.push(provisioner.ensure_channel(channel).await?);
        }
        info!(channels = subscriptions.len(), "Channels provisioned");
        Ok(subscriptions)
    }

    /// Run the relay until the heartbeat gives up or `external_shutdown`
    /// flips to `true` (or its sender is dropped).
    ///
    /// Returns `Ok(())` after a requested shutdown and
    /// [`SupervisorError::HeartbeatFailed`] when the store went away.
    pub async fn run(
        self,
        mut external_shutdown: watch::Receiver<bool>,
    ) -> Result<(), SupervisorError> {
        let subscriptions = self.provision().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut consumers: JoinSet<Result<ConsumerStats, ConsumeError>> = JoinSet::new();
        for subscription in subscriptions {
            let receiver = self.bus.open(&subscription).await.map_err(|source| {
                SupervisorError::Receiver {
                    subscription: subscription.to_string(),
                    source,
                }
            })?;
            let consumer = ChannelConsumer::new(
                subscription,
                receiver,
                self.store.clone(),
                self.settings.consumer,
                shutdown_rx.clone(),
            );
            consumers.spawn(consumer.run());
        }

        let mut heartbeat = tokio::spawn(
            HeartbeatLoop::new(
                self.store.clone(),
                self.settings.heartbeat,
                shutdown_rx,
                self.status_tx.clone(),
            )
            .run(),
        );
        let mut heartbeat_done = false;

        info!(consumers = consumers.len(), "Supervisor running");

        let outcome = if *external_shutdown.borrow_and_update() {
            info!("Shutdown requested before start");
            Ok(())
        } else {
            loop {
                tokio::select! {
                    biased;

                    joined = &mut heartbeat => {
                        heartbeat_done = true;
                        break match joined {
                            Ok(Ok(())) => {
                                warn!("HeartbeatLoop exited without shutdown");
                                Ok(())
                            }
                            Ok(Err(e)) => {
                                error!(error = %e, "Heartbeat failed, shutting down");
                                Err(SupervisorError::HeartbeatFailed(e))
                            }
                            Err(e) => {
                                error!(error = %e, "Heartbeat task failed, shutting down");
                                Err(SupervisorError::HeartbeatTask(e))
                            }
                        };
                    }

                    changed = external_shutdown.changed() => {
                        if changed.is_err() || *external_shutdown.borrow() {
                            info!("Shutdown requested");
                            break Ok(());
                        }
                    }

                    Some(joined) = consumers.join_next() => {
                        log_consumer_exit(joined);
                    }
                }
            }
        };

        shutdown_tx.send_replace(true);
        self.drain(&mut consumers).await;

        if !heartbeat_done {
            match tokio::time::timeout(self.settings.drain_timeout, &mut heartbeat).await {
                Ok(Ok(Err(e))) => warn!(error = %e, "Heartbeat failed while stopping"),
                Ok(Err(e)) => warn!(error = %e, "Heartbeat task failed while stopping"),
                Ok(Ok(Ok(()))) => {}
                Err(_) => heartbeat.abort(),
            }
        }

        info!("Supervisor stopped");
        outcome
    }

    async fn drain(&self, consumers: &mut JoinSet<Result<ConsumerStats, ConsumeError>>) {
        let joined = tokio::time::timeout(self.settings.drain_timeout, async {
            while let Some(joined) = consumers.join_next().await {
                log_consumer_exit(joined);
            }
        })
        .await;

        if joined.is_err() {
            warn!(
                remaining = consumers.len(),
                drain_timeout_ms = self.settings.drain_timeout.as_millis() as u64,
                "Consumers did not drain in time, aborting"
            );
            consumers.abort_all();
            while consumers.join_next().await.is_some() {}
        }
    }
}

fn log_consumer_exit(joined: ConsumerResult) {
    match joined {
        Ok(Ok(stats)) => debug!(received = stats.received, "ChannelConsumer finished"),
        Ok(Err(e)) => error!(error = %e, "ChannelConsumer failed"),
        Err(e) if e.is_cancelled() => debug!("ChannelConsumer aborted"),
        Err(e) => error!(error = %e, "ChannelConsumer panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DeviceKey;
    use crate::testing::{InMemoryBus, InMemoryDeviceTable};
    use time::macros::datetime;

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            consumer: ConsumerSettings {
                batch_size: 8,
                max_wait: Duration::from_millis(20),
            },
            heartbeat: HeartbeatSettings {
                interval: Duration::from_millis(20),
                max_consecutive_failures: 2,
            },
            drain_timeout: Duration::from_secs(1),
            ..SupervisorSettings::default()
        }
    }

    fn supervisor(
        bus: &Arc<InMemoryBus>,
    ) -> (
        Supervisor<InMemoryBus, InMemoryDeviceTable>,
        Arc<PresenceStore<InMemoryDeviceTable>>,
    ) {
        let store = Arc::new(PresenceStore::new(InMemoryDeviceTable::new()));
        (Supervisor::new(bus.clone(), store.clone(), settings()), store)
    }

    fn payload(device: &str, date: &str) -> String {
        format!(
            r#"{{"metadata":{{"client_code":"C1","device_code":"{device}","message_code":"M1","is_raw":false,"reportfile_date":"{date}"}}}}"#
        )
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_provision_creates_default_channels() {
        let bus = Arc::new(InMemoryBus::new());
        let (supervisor, _) = supervisor(&bus);
        let subscriptions = supervisor.provision().await.unwrap();
        assert_eq!(subscriptions.len(), 3);
        assert_eq!(bus.topic_names(), ["api_topic", "ftp_topic", "mqtt_topic"]);

        // A second pass reuses everything.
        supervisor.provision().await.unwrap();
        assert_eq!(bus.creates(), 6);
    }

    #[tokio::test]
    async fn test_relays_every_channel_until_shutdown() {
        let bus = Arc::new(InMemoryBus::new());
        let (supervisor, store) = supervisor(&bus);
        supervisor.provision().await.unwrap();
        let mut status = supervisor.heartbeat_status();

        bus.publish("ftp_topic", payload("D1", "20240115093000")).unwrap();
        bus.publish("mqtt_topic", payload("D2", "20240115093000")).unwrap();
        bus.publish("api_topic", payload("D1", "20240115094500")).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(supervisor.run(shutdown_rx));

        wait_for(|| {
            store
                .table()
                .record(&DeviceKey::new("C1", "D1", "M1"))
                .is_some_and(|r| r.last_ping == datetime!(2024-01-15 09:45:00))
                && store.table().len() == 2
        })
        .await;
        status.changed().await.unwrap();
        assert!(status.borrow().is_some());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        for topic in ["ftp_topic", "mqtt_topic", "api_topic"] {
            assert_eq!(bus.completed(topic, "dagotest"), 1);
        }
    }

    #[tokio::test]
    async fn test_heartbeat_failure_stops_relay() {
        let bus = Arc::new(InMemoryBus::new());
        let (supervisor, store) = supervisor(&bus);
        store.table().set_available(false);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let result = supervisor.run(shutdown_rx).await;
        assert!(matches!(result, Err(SupervisorError::HeartbeatFailed(_))));

        // Consumers are gone: nothing picks up new messages.
        bus.publish("ftp_topic", payload("D1", "20240115093000")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.pending("ftp_topic", "dagotest"), 1);
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_fatal() {
        let bus = Arc::new(InMemoryBus::new());
        bus.set_management_offline(true);
        let (supervisor, store) = supervisor(&bus);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let result = supervisor.run(shutdown_rx).await;
        assert!(matches!(result, Err(SupervisorError::Provisioning(_))));
        assert_eq!(store.table().calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_consumer_does_not_stop_others() {
        let bus = Arc::new(InMemoryBus::new());
        let (supervisor, store) = supervisor(&bus);
        supervisor.provision().await.unwrap();
        bus.set_receive_failure("ftp_topic", "dagotest", true);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(supervisor.run(shutdown_rx));

        bus.publish("mqtt_topic", payload("D2", "20240115093000")).unwrap();
        wait_for(|| store.table().len() == 1).await;
        assert!(!handle.is_finished());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
