// Shared fixtures for lifecycle tests.

use std::sync::Arc;
use std::time::Duration;

use super::LinkManager;
use crate::io::virtual_device::{VirtualDevice, VirtualTransport};
use crate::settings::LinkSettings;
use crate::store_manager::MemoryStore;

pub(crate) struct Fixture {
    pub manager: LinkManager,
    pub transport: Arc<VirtualTransport>,
    pub device: Arc<VirtualDevice>,
    pub store: Arc<MemoryStore>,
}

pub(crate) fn settings() -> LinkSettings {
    LinkSettings {
        teardown_timeout_ms: 500,
        write_timeout_ms: 500,
        ..LinkSettings::default()
    }
}

/// Manager over one virtual device (vid 9025, pid 67) that the chooser picks.
pub(crate) fn fixture() -> Fixture {
    fixture_with(settings())
}

/// Same as `fixture`, with teardown and write timeouts of `timeout_ms`.
pub(crate) fn fixture_with_timeouts(timeout_ms: u64) -> Fixture {
    fixture_with(LinkSettings {
        teardown_timeout_ms: timeout_ms,
        write_timeout_ms: timeout_ms,
        ..LinkSettings::default()
    })
}

fn fixture_with(settings: LinkSettings) -> Fixture {
    let transport = Arc::new(VirtualTransport::new());
    let device = VirtualDevice::new("vtty0", Some(9025), Some(67));
    transport.set_selection(Some(device.clone()));
    let store = Arc::new(MemoryStore::new());
    let manager = LinkManager::new(transport.clone(), store.clone(), settings);
    Fixture {
        manager,
        transport,
        device,
        store,
    }
}

pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}
