//! Application state shared across all request handlers.

use lastseen_core::store::{PgDeviceTable, PresenceStore};
use std::sync::Arc;
use time::PrimitiveDateTime;
use tokio::sync::watch;

/// Cloneable handle to the relay's store and heartbeat status.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PresenceStore<PgDeviceTable>>,
    /// Latest successful heartbeat, published by the heartbeat loop.
    pub heartbeat: watch::Receiver<Option<PrimitiveDateTime>>,
}

impl AppState {
    pub fn new(
        store: Arc<PresenceStore<PgDeviceTable>>,
        heartbeat: watch::Receiver<Option<PrimitiveDateTime>>,
    ) -> Self {
        Self { store, heartbeat }
    }

    pub fn last_heartbeat(&self) -> Option<PrimitiveDateTime> {
        *self.heartbeat.borrow()
    }
}
