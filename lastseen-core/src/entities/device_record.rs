//! `device_test` rows and the SQL that reads and writes them.
//!
//! Expected schema (not applied by the relay):
//!
//! ```sql
//! CREATE TABLE device_test (
//!     client_code       TEXT      NOT NULL,
//!     device_code       TEXT      NOT NULL,
//!     msg_code          TEXT      NOT NULL,
//!     last_ping         TIMESTAMP NOT NULL,
//!     current_heartbeat TIMESTAMP NULL,
//!     CONSTRAINT device_test_key UNIQUE (client_code, device_code, msg_code)
//! );
//! ```

use crate::events::DeviceKey;
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use time::PrimitiveDateTime;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeviceRecord {
    pub client_code: String,
    pub device_code: String,
    #[sqlx(rename = "msg_code")]
    pub message_code: String,
    pub last_ping: PrimitiveDateTime,
    pub current_heartbeat: Option<PrimitiveDateTime>,
}

impl DeviceRecord {
    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(&self.client_code, &self.device_code, &self.message_code)
    }
}

/// Result of a plain insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The unique key already existed; nothing was written.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct GetDeviceRecord {
    pub key: DeviceKey,
}

impl Processor<GetDeviceRecord> for DatabaseProcessor {
    type Output = Option<DeviceRecord>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetDeviceRecord")]
    async fn process(&self, query: GetDeviceRecord) -> Result<Option<DeviceRecord>, sqlx::Error> {
        let record = sqlx::query_as::<_, DeviceRecord>(
            r#"
            SELECT client_code, device_code, msg_code, last_ping, current_heartbeat
            FROM device_test
            WHERE client_code = $1 AND device_code = $2 AND msg_code = $3
            "#,
        )
        .bind(&query.key.client_code)
        .bind(&query.key.device_code)
        .bind(&query.key.message_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}

#[derive(Debug, Clone)]
pub struct InsertDeviceRecord {
    pub key: DeviceKey,
    pub last_ping: PrimitiveDateTime,
}

impl Processor<InsertDeviceRecord> for DatabaseProcessor {
    type Output = InsertOutcome;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:InsertDeviceRecord")]
    async fn process(&self, insert: InsertDeviceRecord) -> Result<InsertOutcome, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO device_test (client_code, device_code, msg_code, last_ping)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&insert.key.client_code)
        .bind(&insert.key.device_code)
        .bind(&insert.key.message_code)
        .bind(insert.last_ping)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(e),
        }
    }
}

/// Move `last_ping` forward. Older timestamps leave the row unchanged.
#[derive(Debug, Clone)]
pub struct TouchDeviceRecord {
    pub key: DeviceKey,
    pub last_ping: PrimitiveDateTime,
}

impl Processor<TouchDeviceRecord> for DatabaseProcessor {
    /// Whether a row with the key was found.
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:TouchDeviceRecord")]
    async fn process(&self, touch: TouchDeviceRecord) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE device_test
            SET last_ping = GREATEST(last_ping, $4)
            WHERE client_code = $1 AND device_code = $2 AND msg_code = $3
            "#,
        )
        .bind(&touch.key.client_code)
        .bind(&touch.key.device_code)
        .bind(&touch.key.message_code)
        .bind(touch.last_ping)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StampHeartbeat {
    pub at: PrimitiveDateTime,
}

impl Processor<StampHeartbeat> for DatabaseProcessor {
    type Output = u64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:StampHeartbeat")]
    async fn process(&self, stamp: StampHeartbeat) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE device_test SET current_heartbeat = $1")
            .bind(stamp.at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PingDatabase;

impl Processor<PingDatabase> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:PingDatabase")]
    async fn process(&self, _: PingDatabase) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
