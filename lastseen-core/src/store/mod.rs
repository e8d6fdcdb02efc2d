//! Presence store: one row per device key, upserted from inbound events.
//!
//! The store protocol lives in [`PresenceStore`] and is written against the
//! [`DeviceTable`] primitives, so the conflict handling is the same whatever
//! backs the table. The lookup and the write are separate statements and not
//! atomic; concurrent consumers can race between them. An insert that loses
//! that race reports [`InsertOutcome::Duplicate`] and the protocol falls back
//! to an update, so a duplicate key is never surfaced as an error.

pub mod postgres;

use crate::entities::{DeviceRecord, InsertOutcome};
use crate::events::{DeviceKey, InboundEvent};
use crate::utils::clock::{display, now_utc_micros};
use async_trait::async_trait;
use thiserror::Error;
use time::PrimitiveDateTime;
use tokio::sync::Mutex;
use tracing::debug;

pub use postgres::PgDeviceTable;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// A non-SQL table backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("row for {0} vanished while being upserted")]
    Conflict(DeviceKey),
}

/// Row-level primitives the presence protocol is built from.
#[async_trait]
pub trait DeviceTable: Send + Sync {
    async fn find(&self, key: &DeviceKey) -> Result<Option<DeviceRecord>, StoreError>;

    /// Plain insert. A unique-key collision is reported as
    /// [`InsertOutcome::Duplicate`], not as an error.
    async fn insert(
        &self,
        key: &DeviceKey,
        last_ping: PrimitiveDateTime,
    ) -> Result<InsertOutcome, StoreError>;

    /// Advance `last_ping` to `last_ping` unless the row already holds a later
    /// value. Returns whether the row exists.
    async fn touch(&self, key: &DeviceKey, last_ping: PrimitiveDateTime)
    -> Result<bool, StoreError>;

    /// Write `current_heartbeat` on every row. Returns the number of rows.
    async fn stamp_heartbeat(&self, at: PrimitiveDateTime) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Raw events are diagnostic only.
    SkippedRaw,
}

/// Shared handle over a [`DeviceTable`], owned by the supervisor and lent to
/// every consumer and the heartbeat loop through an `Arc`.
pub struct PresenceStore<T> {
    table: T,
    last_heartbeat: Mutex<Option<PrimitiveDateTime>>,
}

impl<T: DeviceTable> PresenceStore<T> {
    pub fn new(table: T) -> Self {
        Self {
            table,
            last_heartbeat: Mutex::new(None),
        }
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    /// Record the event's report time as the device's `last_ping`.
    pub async fn upsert(&self, event: &InboundEvent) -> Result<UpsertOutcome, StoreError> {
        if event.is_raw {
            return Ok(UpsertOutcome::SkippedRaw);
        }

        let key = event.key();
        let last_ping = event.report_file_processed;

        if let Some(existing) = self.table.find(&key).await? {
            debug!(
                %key,
                previous = %display(existing.last_ping),
                last_ping = %display(last_ping),
                "Updating device record"
            );
            if self.table.touch(&key, last_ping).await? {
                return Ok(UpsertOutcome::Updated);
            }
            // Deleted between lookup and update.
        }

        match self.table.insert(&key, last_ping).await? {
            InsertOutcome::Inserted => {
                debug!(%key, last_ping = %display(last_ping), "Inserted device record");
                Ok(UpsertOutcome::Inserted)
            }
            InsertOutcome::Duplicate => {
                debug!(%key, "Lost insert race, falling back to update");
                if self.table.touch(&key, last_ping).await? {
                    Ok(UpsertOutcome::Updated)
                } else {
                    Err(StoreError::Conflict(key))
                }
            }
        }
    }

    /// Stamp `current_heartbeat` with the current time.
    ///
    /// Stamps from one store are strictly increasing even if the clock stalls
    /// or steps backwards.
    pub async fn heartbeat(&self) -> Result<PrimitiveDateTime, StoreError> {
        let mut last = self.last_heartbeat.lock().await;
        let now = now_utc_micros();
        let at = match *last {
            Some(previous) if now <= previous => previous + time::Duration::MICROSECOND,
            _ => now,
        };
        let rows = self.table.stamp_heartbeat(at).await?;
        *last = Some(at);
        debug!(rows, at = %display(at), "Stamped heartbeat");
        Ok(at)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.table.ping().await
    }
}
