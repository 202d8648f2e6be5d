// src/link/buffer.rs
//
// Latest-value receive slot.
// Each arrival overwrites whatever is unread; reading consumes and clears.
// There is no queue, so a slow consumer only ever sees the freshest chunk.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::Notify;

/// Zero-argument "data arrived" callback.
pub type DataCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct ReceiveBuffer {
    slot: Mutex<Option<String>>,
    callback: RwLock<Option<DataCallback>>,
    arrived: Notify,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a chunk, replacing any unread one, then signal the arrival.
    /// Empty chunks are dropped.
    pub fn publish(&self, chunk: String) {
        if chunk.is_empty() {
            return;
        }

        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(chunk);

        self.arrived.notify_waiters();
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Take the pending chunk, or `""` if there is none.
    pub fn take(&self) -> String {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default()
    }

    pub fn has_data(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn clear(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Register (or with `None`, remove) the arrival callback.
    pub fn set_callback(&self, callback: Option<DataCallback>) {
        *self
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = callback;
    }

    /// Resolve on the next arrival after this call.
    pub async fn wait_for_data(&self) {
        self.arrived.notified().await;
    }
}
