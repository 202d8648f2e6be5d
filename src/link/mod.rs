// src/link/mod.rs
//
// Link lifecycle: state machine, open handle, read loop, receive buffer and
// write path. LinkManager is the only thing that creates or destroys link
// resources; WriteGateway borrows the writer for the duration of one write.

pub mod buffer;
pub mod gateway;
pub mod manager;
pub(crate) mod read_loop;
#[cfg(test)]
pub(crate) mod testutil;

pub use buffer::{DataCallback, ReceiveBuffer};
pub use gateway::{encode_number, WriteGateway};
pub use manager::LinkManager;

use serde::Serialize;
use std::fmt;
use std::sync::{atomic::AtomicU64, Arc};
use tokio::sync::{watch, Mutex};

use crate::identity::{DeviceIdentity, IdentityStore};
use crate::io::{ByteWriter, DevicePort, SerialTransport};
use crate::settings::LinkSettings;
use read_loop::ReadLoopHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// An open device and the streams derived from it.
pub(crate) struct LinkHandle {
    pub device: Arc<dyn DevicePort>,
    pub identity: DeviceIdentity,
    pub writer: Option<Box<dyn ByteWriter>>,
    pub read_loop: Option<ReadLoopHandle>,
    pub generation: u64,
}

/// State shared by the manager, the gateway and the read loop's fault hook.
pub(crate) struct LinkShared {
    pub transport: Arc<dyn SerialTransport>,
    pub identities: IdentityStore,
    pub settings: LinkSettings,
    pub buffer: Arc<ReceiveBuffer>,
    /// Held across awaits by open, close and writes
    pub link: Mutex<Option<LinkHandle>>,
    pub state_tx: watch::Sender<LinkState>,
    pub next_generation: AtomicU64,
}

impl LinkShared {
    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Only called with `link` locked.
    pub fn set_state(&self, state: LinkState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tlog!("[LinkManager] State {} -> {}", previous, state);
        }
    }
}
