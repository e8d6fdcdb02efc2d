//! PostgreSQL-backed [`DeviceTable`].

use super::{DeviceTable, StoreError};
use crate::entities::{
    DeviceRecord, GetDeviceRecord, InsertDeviceRecord, InsertOutcome, PingDatabase,
    StampHeartbeat, TouchDeviceRecord,
};
use crate::events::DeviceKey;
use crate::framework::DatabaseProcessor;
use async_trait::async_trait;
use kanau::processor::Processor;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use time::PrimitiveDateTime;
use tracing::info;

/// `device_test` table reached through a shared connection pool.
#[derive(Clone)]
pub struct PgDeviceTable {
    processor: DatabaseProcessor,
}

impl PgDeviceTable {
    pub fn new(pool: PgPool) -> Self {
        Self {
            processor: DatabaseProcessor { pool },
        }
    }

    /// Open a pool and verify the server answers.
    pub async fn connect(
        options: PgConnectOptions,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(StoreError::Connect)?;
        let table = Self::new(pool);
        table
            .processor
            .process(PingDatabase)
            .await
            .map_err(StoreError::Connect)?;
        info!("Database connection established");
        Ok(table)
    }

    pub fn pool(&self) -> &PgPool {
        &self.processor.pool
    }
}

#[async_trait]
impl DeviceTable for PgDeviceTable {
    async fn find(&self, key: &DeviceKey) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self
            .processor
            .process(GetDeviceRecord { key: key.clone() })
            .await?)
    }

    async fn insert(
        &self,
        key: &DeviceKey,
        last_ping: PrimitiveDateTime,
    ) -> Result<InsertOutcome, StoreError> {
        Ok(self
            .processor
            .process(InsertDeviceRecord {
                key: key.clone(),
                last_ping,
            })
            .await?)
    }

    async fn touch(
        &self,
        key: &DeviceKey,
        last_ping: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        Ok(self
            .processor
            .process(TouchDeviceRecord {
                key: key.clone(),
                last_ping,
            })
            .await?)
    }

    async fn stamp_heartbeat(&self, at: PrimitiveDateTime) -> Result<u64, StoreError> {
        Ok(self.processor.process(StampHeartbeat { at }).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(self.processor.process(PingDatabase).await?)
    }
}

/// Runs against a scratch database named by `DATABASE_URL`:
/// `DATABASE_URL=postgres://... cargo test -p lastseen-core -- --ignored`
#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InboundEvent;
    use crate::store::{PresenceStore, UpsertOutcome};
    use std::sync::Arc;
    use time::macros::datetime;

    const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS device_test (
        client_code       TEXT      NOT NULL,
        device_code       TEXT      NOT NULL,
        msg_code          TEXT      NOT NULL,
        last_ping         TIMESTAMP NOT NULL,
        current_heartbeat TIMESTAMP NULL,
        CONSTRAINT device_test_key UNIQUE (client_code, device_code, msg_code)
    )";

    async fn table() -> PgDeviceTable {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let table = PgDeviceTable::connect(url.parse().unwrap(), 8).await.unwrap();
        sqlx::query(SCHEMA).execute(table.pool()).await.unwrap();
        table
    }

    /// A client code no other run uses, so rows never collide.
    fn unique_key(device: &str) -> DeviceKey {
        let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        DeviceKey::new(format!("test-{}-{nanos}", std::process::id()), device, "M1")
    }

    async fn cleanup(table: &PgDeviceTable, key: &DeviceKey) {
        sqlx::query("DELETE FROM device_test WHERE client_code = $1")
            .bind(&key.client_code)
            .execute(table.pool())
            .await
            .unwrap();
    }

    fn event(key: &DeviceKey, report: PrimitiveDateTime) -> InboundEvent {
        InboundEvent {
            client_code: key.client_code.clone(),
            device_code: key.device_code.clone(),
            message_code: key.message_code.clone(),
            family_name: String::new(),
            report_file_processed: report,
            current_time: report,
            is_raw: false,
        }
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL pointing at a scratch PostgreSQL database"]
    async fn test_duplicate_insert_and_monotonic_touch() {
        let table = table().await;
        let key = unique_key("D9");

        assert_eq!(
            table.insert(&key, datetime!(2024-01-15 09:30:00)).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            table.insert(&key, datetime!(2024-01-15 09:45:00)).await.unwrap(),
            InsertOutcome::Duplicate
        );

        assert!(table.touch(&key, datetime!(2024-01-15 09:45:00)).await.unwrap());
        assert!(table.touch(&key, datetime!(2024-01-15 09:00:00)).await.unwrap());
        let record = table.find(&key).await.unwrap().unwrap();
        assert_eq!(record.key(), key);
        assert_eq!(record.last_ping, datetime!(2024-01-15 09:45:00));

        assert!(!table.touch(&unique_key("absent"), datetime!(2024-01-15 09:45:00)).await.unwrap());
        cleanup(&table, &key).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs DATABASE_URL pointing at a scratch PostgreSQL database"]
    async fn test_concurrent_upserts_leave_one_row() {
        let table = table().await;
        let key = unique_key("D9");
        let store = Arc::new(PresenceStore::new(table));

        let mut handles = Vec::new();
        for minute in 0..8u8 {
            let store = store.clone();
            let event = event(
                &key,
                datetime!(2024-01-15 09:00:00) + time::Duration::minutes(minute.into()),
            );
            handles.push(tokio::spawn(async move { store.upsert(&event).await }));
        }
        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == UpsertOutcome::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM device_test WHERE client_code = $1",
        )
        .bind(&key.client_code)
        .fetch_one(store.table().pool())
        .await
        .unwrap();
        assert_eq!(count, 1);
        let record = store.table().find(&key).await.unwrap().unwrap();
        assert_eq!(record.last_ping, datetime!(2024-01-15 09:07:00));

        let at = store.heartbeat().await.unwrap();
        let record = store.table().find(&key).await.unwrap().unwrap();
        assert_eq!(record.current_heartbeat, Some(at));
        cleanup(store.table(), &key).await;
    }
}
