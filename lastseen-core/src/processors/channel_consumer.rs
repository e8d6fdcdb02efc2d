//! ChannelConsumer.
//!
//! One consumer per subscription. Each received message is parsed, upserted
//! into the presence store and then completed. Messages that cannot be parsed
//! or stored are logged and completed anyway so a poison message never
//! blocks its channel. Completing a message is the one failure the loop does
//! not survive.

use crate::bus::{BusError, Delivery, MessageReceiver, SubscriptionHandle};
use crate::events;
use crate::store::{DeviceTable, PresenceStore, UpsertOutcome};
use crate::utils::clock::display;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Upper bound on messages taken per receive call.
    pub batch_size: usize,
    /// How long one receive call waits for the first message.
    pub max_wait: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            batch_size: 16,
            max_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("receive failed on {channel}: {source}")]
    Receive { channel: String, source: BusError },

    #[error("acknowledge failed on {channel}: {source}")]
    Acknowledge { channel: String, source: BusError },
}

/// Per-consumer counters, logged when the loop exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub persisted: u64,
    pub skipped_raw: u64,
    pub rejected: u64,
    pub store_failures: u64,
}

pub struct ChannelConsumer<T> {
    subscription: SubscriptionHandle,
    receiver: Box<dyn MessageReceiver>,
    store: Arc<PresenceStore<T>>,
    settings: ConsumerSettings,
    shutdown_rx: watch::Receiver<bool>,
    stats: ConsumerStats,
}

impl<T: DeviceTable> ChannelConsumer<T> {
    pub fn new(
        subscription: SubscriptionHandle,
        receiver: Box<dyn MessageReceiver>,
        store: Arc<PresenceStore<T>>,
        settings: ConsumerSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            subscription,
            receiver,
            store,
            settings,
            shutdown_rx,
            stats: ConsumerStats::default(),
        }
    }

    /// Consume until shutdown is requested or the transport fails.
    ///
    /// Shutdown is only observed between batches, so a batch in hand is
    /// always finished before the loop returns.
    pub async fn run(mut self) -> Result<ConsumerStats, ConsumeError> {
        info!(channel = %self.subscription, "ChannelConsumer started");

        let result = self.consume().await;
        let stats = self.stats;
        info!(
            channel = %self.subscription,
            received = stats.received,
            persisted = stats.persisted,
            skipped_raw = stats.skipped_raw,
            rejected = stats.rejected,
            store_failures = stats.store_failures,
            "ChannelConsumer stopped"
        );
        result.map(|()| stats)
    }

    async fn consume(&mut self) -> Result<(), ConsumeError> {
        if *self.shutdown_rx.borrow_and_update() {
            return Ok(());
        }

        loop {
            let batch = tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    // A dropped sender counts as a shutdown request.
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!(channel = %self.subscription, "ChannelConsumer received shutdown signal");
                        return Ok(());
                    }
                    continue;
                }

                batch = self.receiver.receive(self.settings.batch_size, self.settings.max_wait) => {
                    batch.map_err(|source| ConsumeError::Receive {
                        channel: self.subscription.to_string(),
                        source,
                    })?
                }
            };

            if batch.is_empty() {
                continue;
            }
            debug!(channel = %self.subscription, count = batch.len(), "Received batch");

            for delivery in batch {
                self.handle(delivery.as_ref()).await;
                delivery
                    .complete()
                    .await
                    .map_err(|source| ConsumeError::Acknowledge {
                        channel: self.subscription.to_string(),
                        source,
                    })?;
            }
        }
    }

    async fn handle(&mut self, delivery: &dyn Delivery) {
        self.stats.received += 1;

        let event = match events::parse(delivery.payload()) {
            Ok(event) => event,
            Err(e) => {
                self.stats.rejected += 1;
                warn!(channel = %self.subscription, error = %e, "Dropping unparseable message");
                return;
            }
        };

        match self.store.upsert(&event).await {
            Ok(UpsertOutcome::SkippedRaw) => {
                self.stats.skipped_raw += 1;
                debug!(channel = %self.subscription, key = %event.key(), "Skipped raw message");
            }
            Ok(outcome) => {
                self.stats.persisted += 1;
                debug!(
                    channel = %self.subscription,
                    key = %event.key(),
                    last_ping = %display(event.report_file_processed),
                    outcome = ?outcome,
                    "Recorded device presence"
                );
            }
            Err(e) => {
                self.stats.store_failures += 1;
                error!(
                    channel = %self.subscription,
                    key = %event.key(),
                    error = %e,
                    "Failed to record device presence, dropping message"
                );
            }
        }
    }
}
