// src/link/manager.rs
//
// Link state machine: open (manual or auto), close, teardown.
//
// Every transition happens with the link mutex held, so the state observed
// through `state()` always matches what the handle slot contains.
// Teardown never aborts early: each step is attempted, bounded by the
// teardown timeout, and its failure is logged and collected.

use std::future::Future;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use super::buffer::{DataCallback, ReceiveBuffer};
use super::gateway::WriteGateway;
use super::read_loop::{FaultHook, ReadLoop, ReadLoopExit};
use super::{LinkHandle, LinkShared, LinkState};
use crate::error::{LinkError, Result};
use crate::identity::{DeviceIdentity, IdentityStore};
use crate::io::{DevicePort, SerialTransport};
use crate::settings::LinkSettings;
use crate::store_manager::KeyValueStore;

/// Owns the one link a host can have open at a time.
pub struct LinkManager {
    shared: Arc<LinkShared>,
}

impl LinkManager {
    pub fn new(
        transport: Arc<dyn SerialTransport>,
        store: Arc<dyn KeyValueStore>,
        settings: LinkSettings,
    ) -> Self {
        let identities = IdentityStore::new(store, settings.storage_key.clone());
        let (state_tx, _) = watch::channel(LinkState::Disconnected);

        Self {
            shared: Arc::new(LinkShared {
                transport,
                identities,
                settings,
                buffer: Arc::new(ReceiveBuffer::new()),
                link: Mutex::new(None),
                state_tx,
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state_tx.subscribe()
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.shared.settings
    }

    pub fn identity_store(&self) -> &IdentityStore {
        &self.shared.identities
    }

    pub fn receive_buffer(&self) -> Arc<ReceiveBuffer> {
        self.shared.buffer.clone()
    }

    pub fn gateway(&self) -> WriteGateway {
        WriteGateway::new(self.shared.clone())
    }

    /// Register the callback invoked once per received chunk.
    pub fn set_on_data_callback(&self, callback: Option<DataCallback>) {
        self.shared.buffer.set_callback(callback);
    }

    /// Identity of the currently open device, if any.
    pub async fn connected_identity(&self) -> Option<DeviceIdentity> {
        self.shared
            .link
            .lock()
            .await
            .as_ref()
            .map(|h| h.identity.clone())
    }

    /// Ask the user for a device, open it and remember it for auto-connect.
    pub async fn open(&self) -> Result<DeviceIdentity> {
        let mut link = self.shared.link.lock().await;
        self.require_disconnected()?;
        self.shared.set_state(LinkState::Connecting);

        let device = match self.shared.transport.request_device_selection().await {
            Ok(device) => device,
            Err(e) => {
                tlog!("[LinkManager] Serial connection failed: {}", e);
                self.shared.set_state(LinkState::Disconnected);
                return Err(e);
            }
        };

        let identity = DeviceIdentity::capture(device.as_ref());
        self.connect_device(&mut link, device, identity.clone())
            .await?;
        self.shared.identities.save(&identity);

        tlog!("[LinkManager] Serial link connected ({})", identity);
        Ok(identity)
    }

    /// Reopen the previously used device without prompting, if it is
    /// currently available.
    pub async fn auto_open(&self) -> Result<DeviceIdentity> {
        let mut link = self.shared.link.lock().await;
        self.require_disconnected()?;

        let Some(stored) = self.shared.identities.load() else {
            tlog!("[LinkManager] Warning: no stored port found");
            return Err(LinkError::NoStoredIdentity);
        };

        self.shared.set_state(LinkState::Connecting);

        let devices = match self.shared.transport.list_authorized_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                tlog!("[LinkManager] Automatic connection failed: {}", e);
                self.shared.set_state(LinkState::Disconnected);
                return Err(LinkError::OpenFailed(e.to_string()));
            }
        };

        let Some(device) = devices
            .into_iter()
            .find(|d| DeviceIdentity::capture(d.as_ref()).matches(&stored))
        else {
            tlog!(
                "[LinkManager] Warning: stored port {} not found",
                stored
            );
            self.shared.set_state(LinkState::Disconnected);
            return Err(LinkError::DeviceNotFound(stored.canonical()));
        };

        let identity = DeviceIdentity::capture(device.as_ref());
        self.connect_device(&mut link, device, identity.clone())
            .await?;

        tlog!(
            "[LinkManager] Automatically connected to stored port ({})",
            identity
        );
        Ok(identity)
    }

    /// Tear the link down. A no-op while disconnected. Returns the faults hit
    /// along the way (including a read fault the loop had stopped on); the
    /// link ends up disconnected regardless.
    pub async fn close(&self) -> Vec<LinkError> {
        let mut link = self.shared.link.lock().await;
        if self.shared.state() == LinkState::Disconnected {
            return Vec::new();
        }
        self.shared.teardown(&mut link).await
    }

    fn require_disconnected(&self) -> Result<()> {
        let state = self.shared.state();
        if state != LinkState::Disconnected {
            tlog!("[LinkManager] Cannot connect while {}", state);
            return Err(LinkError::InvalidState(state));
        }
        Ok(())
    }

    /// Open `device`, move to Connected and start reading. On failure the
    /// state returns to Disconnected and nothing is retained.
    async fn connect_device(
        &self,
        link: &mut Option<LinkHandle>,
        device: Arc<dyn DevicePort>,
        identity: DeviceIdentity,
    ) -> Result<()> {
        let port_name = device.info().port_name;
        let line = self.shared.settings.line_config();

        let (reader, writer) = match device.open(&line).await {
            Ok(pair) => pair,
            Err(e) => {
                tlog!("[LinkManager] Failed to open {}: {}", port_name, e);
                self.shared.set_state(LinkState::Disconnected);
                return Err(LinkError::OpenFailed(format!("{}: {}", port_name, e)));
            }
        };

        let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.set_state(LinkState::Connected);

        let read_loop = ReadLoop::new(
            reader,
            self.shared.buffer.clone(),
            generation,
            Some(fault_hook(&self.shared)),
        )
        .spawn();

        *link = Some(LinkHandle {
            device,
            identity,
            writer: Some(writer),
            read_loop: Some(read_loop),
            generation,
        });

        tlog!(
            "[LinkManager] Opened {} (link {}, {} baud)",
            port_name,
            generation,
            line.baud_rate
        );
        Ok(())
    }
}

/// Schedule teardown of link `generation` when its read loop faults.
fn fault_hook(shared: &Arc<LinkShared>) -> FaultHook {
    let weak = Arc::downgrade(shared);
    Box::new(move |generation| {
        if let Some(shared) = weak.upgrade() {
            tokio::spawn(async move {
                shared.teardown_after_fault(generation).await;
            });
        }
    })
}

/// Await one teardown step, bounded by `timeout`.
async fn run_step<F>(step: &'static str, timeout: Duration, fut: F) -> Option<LinkError>
where
    F: Future<Output = std::io::Result<()>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(step_fault(step, e.to_string())),
        Err(_) => Some(step_fault(step, format!("timed out after {:?}", timeout))),
    }
}

fn step_fault(step: &'static str, reason: String) -> LinkError {
    tlog!("[LinkManager] Teardown step '{}' failed: {}", step, reason);
    LinkError::TeardownStepFault { step, reason }
}

impl LinkShared {
    /// Ordered, best-effort release of everything the link holds.
    /// Caller holds the link mutex.
    pub(crate) async fn teardown(&self, link: &mut Option<LinkHandle>) -> Vec<LinkError> {
        self.set_state(LinkState::Closing);
        let timeout = Duration::from_millis(self.settings.teardown_timeout_ms);
        let mut faults = Vec::new();

        if let Some(mut handle) = link.take() {
            // Stop the read loop, then cancel and release its reader
            if let Some(mut read_loop) = handle.read_loop.take() {
                read_loop.stop();
                let joined = read_loop.join(timeout).await;
                match &joined {
                    // already logged by the read loop
                    Ok(ReadLoopExit::Fault(reason)) => {
                        faults.push(LinkError::ReadFault(reason.clone()))
                    }
                    Ok(_) => {}
                    Err(reason) => faults.push(step_fault("stop read loop", reason.clone())),
                }

                // An aborted loop still hands the reader back unless it was
                // stuck inside a read
                match read_loop.take_reader() {
                    Some(mut reader) => {
                        faults.extend(run_step("cancel reader", timeout, reader.cancel()).await);
                        if let Err(e) = reader.release() {
                            faults.push(step_fault("release reader", e.to_string()));
                        }
                    }
                    None if joined.is_err() => faults.push(step_fault(
                        "cancel reader",
                        "reader still held by the read task".to_string(),
                    )),
                    None => {}
                }
            }

            if let Some(mut writer) = handle.writer.take() {
                faults.extend(run_step("close writer", timeout, writer.close()).await);
                if let Err(e) = writer.release() {
                    faults.push(step_fault("release writer", e.to_string()));
                }
            }

            faults.extend(run_step("close device", timeout, handle.device.close()).await);

            tlog!(
                "[LinkManager] Serial link {} closed ({} fault(s))",
                handle.generation,
                faults.len()
            );
        }

        self.buffer.clear();
        self.set_state(LinkState::Disconnected);
        faults
    }

    /// Teardown requested by a faulted read loop. Ignored if that link has
    /// already been replaced or closed.
    pub(crate) async fn teardown_after_fault(&self, generation: u64) {
        let mut link = self.link.lock().await;
        match link.as_ref() {
            Some(handle) if handle.generation == generation => {}
            _ => return,
        }
        tlog!(
            "[LinkManager] Read fault on link {}, tearing down",
            generation
        );
        self.teardown(&mut link).await;
    }
}
