use super::lock;
use crate::entities::{DeviceRecord, InsertOutcome};
use crate::events::DeviceKey;
use crate::store::{DeviceTable, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use time::PrimitiveDateTime;

/// Device table kept in a `HashMap`, enforcing the same unique key as the
/// SQL table.
pub struct InMemoryDeviceTable {
    rows: Mutex<HashMap<DeviceKey, DeviceRecord>>,
    available: AtomicBool,
    hide_next_lookup: AtomicBool,
    calls: AtomicUsize,
}

impl Default for InMemoryDeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDeviceTable {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            hide_next_lookup: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Insert a row directly, bypassing the call counter.
    pub fn seed(&self, key: &DeviceKey, last_ping: PrimitiveDateTime) {
        lock(&self.rows).insert(
            key.clone(),
            DeviceRecord {
                client_code: key.client_code.clone(),
                device_code: key.device_code.clone(),
                message_code: key.message_code.clone(),
                last_ping,
                current_heartbeat: None,
            },
        );
    }

    /// Make the next `find` report no row even if one exists.
    pub fn hide_next_lookup(&self) {
        self.hide_next_lookup.store(true, Ordering::SeqCst);
    }

    /// Simulate losing (or regaining) the connection.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn record(&self, key: &DeviceKey) -> Option<DeviceRecord> {
        lock(&self.rows).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of table operations made through [`DeviceTable`].
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory table offline".to_string()))
        }
    }
}

#[async_trait]
impl DeviceTable for InMemoryDeviceTable {
    async fn find(&self, key: &DeviceKey) -> Result<Option<DeviceRecord>, StoreError> {
        self.enter()?;
        let found = if self.hide_next_lookup.swap(false, Ordering::SeqCst) {
            None
        } else {
            lock(&self.rows).get(key).cloned()
        };
        // Let other tasks run between the lookup and the write.
        tokio::task::yield_now().await;
        Ok(found)
    }

    async fn insert(
        &self,
        key: &DeviceKey,
        last_ping: PrimitiveDateTime,
    ) -> Result<InsertOutcome, StoreError> {
        self.enter()?;
        let mut rows = lock(&self.rows);
        if rows.contains_key(key) {
            return Ok(InsertOutcome::Duplicate);
        }
        rows.insert(
            key.clone(),
            DeviceRecord {
                client_code: key.client_code.clone(),
                device_code: key.device_code.clone(),
                message_code: key.message_code.clone(),
                last_ping,
                current_heartbeat: None,
            },
        );
        Ok(InsertOutcome::Inserted)
    }

    async fn touch(
        &self,
        key: &DeviceKey,
        last_ping: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        self.enter()?;
        match lock(&self.rows).get_mut(key) {
            Some(record) => {
                record.last_ping = record.last_ping.max(last_ping);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stamp_heartbeat(&self, at: PrimitiveDateTime) -> Result<u64, StoreError> {
        self.enter()?;
        let mut rows = lock(&self.rows);
        for record in rows.values_mut() {
            record.current_heartbeat = Some(at);
        }
        Ok(rows.len() as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.enter()
    }
}
