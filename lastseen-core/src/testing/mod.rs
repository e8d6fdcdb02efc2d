//! In-memory bus and table for tests, with failure and race injection.

mod bus;
mod table;

pub use bus::InMemoryBus;
pub use table::InMemoryDeviceTable;

use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
