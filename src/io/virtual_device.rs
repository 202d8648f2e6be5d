// src/io/virtual_device.rs
//
// In-memory serial device and transport.
// The controller side can push inbound bytes, end the stream, fail a read,
// inspect what was written and inject a fault into any lifecycle step.
// Every attempted step is recorded so callers can check what ran.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use super::{ByteReader, ByteWriter, DevicePort, LineConfig, PortInfo, SerialTransport};
use crate::error::LinkError;

// ============================================================================
// Types
// ============================================================================

/// A lifecycle step that can be observed and faulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceStep {
    Open,
    ReaderCancel,
    ReaderRelease,
    WriterWrite,
    WriterClose,
    WriterRelease,
    DeviceClose,
}

enum Inbound {
    Data(Vec<u8>),
    End,
    Error(String),
}

#[derive(Default)]
struct DeviceState {
    open: bool,
    reader_locked: bool,
    writer_locked: bool,
    reader_cancelled: bool,
    inbound: VecDeque<Inbound>,
    writes: Vec<Vec<u8>>,
    faults: HashSet<DeviceStep>,
    hangs: HashSet<DeviceStep>,
    attempts: Vec<DeviceStep>,
    open_count: usize,
    last_line: Option<LineConfig>,
}

impl DeviceState {
    /// Record an attempt at `step` and fail it if a fault is armed.
    fn attempt(&mut self, step: DeviceStep) -> std::io::Result<()> {
        self.attempts.push(step);
        if self.faults.contains(&step) {
            return Err(std::io::Error::other(format!(
                "injected fault at {:?}",
                step
            )));
        }
        Ok(())
    }
}

struct Shared {
    state: Mutex<DeviceState>,
    inbound_ready: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an attempt at an awaited step. A hung step never completes.
    async fn enter(&self, step: DeviceStep) -> std::io::Result<()> {
        let hang = {
            let mut state = self.lock();
            state.attempt(step)?;
            state.hangs.contains(&step)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

// ============================================================================
// Virtual Device
// ============================================================================

/// In-memory device. Clone the `Arc` to keep a controller handle after
/// handing the device to a transport.
pub struct VirtualDevice {
    info: PortInfo,
    shared: Arc<Shared>,
}

impl VirtualDevice {
    pub fn new(port_name: &str, vid: Option<u16>, pid: Option<u16>) -> Arc<Self> {
        Arc::new(Self {
            info: PortInfo {
                port_name: port_name.to_string(),
                port_type: "Virtual".to_string(),
                manufacturer: None,
                product: Some("Virtual Serial Device".to_string()),
                serial_number: None,
                vid,
                pid,
            },
            shared: Arc::new(Shared {
                state: Mutex::new(DeviceState::default()),
                inbound_ready: Notify::new(),
            }),
        })
    }

    fn push(&self, item: Inbound) {
        self.shared.lock().inbound.push_back(item);
        self.shared.inbound_ready.notify_one();
    }

    /// Queue bytes for the reader.
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.push(Inbound::Data(bytes.to_vec()));
    }

    pub fn push_text(&self, text: &str) {
        self.push_bytes(text.as_bytes());
    }

    /// Signal end of data (remote closed the stream).
    pub fn end_stream(&self) {
        self.push(Inbound::End);
    }

    /// Make the next read fail with an I/O error (e.g. cable pulled).
    pub fn fail_read(&self, reason: &str) {
        self.push(Inbound::Error(reason.to_string()));
    }

    /// Arm a fault for every future attempt at `step`.
    pub fn inject_fault(&self, step: DeviceStep) {
        self.shared.lock().faults.insert(step);
    }

    /// Make every future attempt at `step` wait forever. Only the awaited
    /// steps (open, cancel, write, writer close, device close) can hang.
    pub fn inject_hang(&self, step: DeviceStep) {
        self.shared.lock().hangs.insert(step);
    }

    /// Disarm all faults and hangs.
    pub fn clear_faults(&self) {
        let mut state = self.shared.lock();
        state.faults.clear();
        state.hangs.clear();
    }

    /// Steps attempted so far, in order.
    pub fn attempts(&self) -> Vec<DeviceStep> {
        self.shared.lock().attempts.clone()
    }

    pub fn clear_attempts(&self) {
        self.shared.lock().attempts.clear();
    }

    /// Each successful write, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared.lock().writes.clone()
    }

    /// All written bytes concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.shared.lock().writes.concat()
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().open
    }

    pub fn open_count(&self) -> usize {
        self.shared.lock().open_count
    }

    pub fn last_line_config(&self) -> Option<LineConfig> {
        self.shared.lock().last_line.clone()
    }
}

#[async_trait]
impl DevicePort for VirtualDevice {
    fn info(&self) -> PortInfo {
        self.info.clone()
    }

    async fn open(
        &self,
        line: &LineConfig,
    ) -> std::io::Result<(Box<dyn ByteReader>, Box<dyn ByteWriter>)> {
        self.shared.enter(DeviceStep::Open).await?;
        let mut state = self.shared.lock();

        if state.open || state.reader_locked || state.writer_locked {
            return Err(std::io::Error::other(format!(
                "{} is busy",
                self.info.port_name
            )));
        }

        state.open = true;
        state.reader_locked = true;
        state.writer_locked = true;
        state.reader_cancelled = false;
        state.open_count += 1;
        state.last_line = Some(line.clone());

        Ok((
            Box::new(VirtualReader {
                shared: self.shared.clone(),
                released: false,
            }),
            Box::new(VirtualWriter {
                shared: self.shared.clone(),
                released: false,
            }),
        ))
    }

    async fn close(&self) -> std::io::Result<()> {
        self.shared.enter(DeviceStep::DeviceClose).await?;
        {
            let mut state = self.shared.lock();
            state.open = false;
            state.reader_locked = false;
            state.writer_locked = false;
            state.reader_cancelled = true;
        }
        self.shared.inbound_ready.notify_one();
        Ok(())
    }
}

// ============================================================================
// Reader / Writer
// ============================================================================

struct VirtualReader {
    shared: Arc<Shared>,
    released: bool,
}

#[async_trait]
impl ByteReader for VirtualReader {
    async fn read(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        if self.released {
            return Err(std::io::Error::other("reader has been released"));
        }

        loop {
            {
                let mut state = self.shared.lock();
                if state.reader_cancelled {
                    return Ok(None);
                }
                match state.inbound.pop_front() {
                    Some(Inbound::Data(bytes)) => return Ok(Some(bytes)),
                    Some(Inbound::End) => return Ok(None),
                    Some(Inbound::Error(reason)) => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            reason,
                        ))
                    }
                    None => {}
                }
            }
            // notify_one stores a permit, so a push between the check and
            // this await is not lost
            self.shared.inbound_ready.notified().await;
        }
    }

    async fn cancel(&mut self) -> std::io::Result<()> {
        self.shared.enter(DeviceStep::ReaderCancel).await?;
        self.shared.lock().reader_cancelled = true;
        self.shared.inbound_ready.notify_one();
        Ok(())
    }

    fn release(&mut self) -> std::io::Result<()> {
        let mut state = self.shared.lock();
        state.attempt(DeviceStep::ReaderRelease)?;
        state.reader_locked = false;
        self.released = true;
        Ok(())
    }
}

struct VirtualWriter {
    shared: Arc<Shared>,
    released: bool,
}

#[async_trait]
impl ByteWriter for VirtualWriter {
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.shared.enter(DeviceStep::WriterWrite).await?;
        let mut state = self.shared.lock();
        if self.released || !state.open {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "device is not open",
            ));
        }
        state.writes.push(data.to_vec());
        Ok(())
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.shared.enter(DeviceStep::WriterClose).await
    }

    fn release(&mut self) -> std::io::Result<()> {
        let mut state = self.shared.lock();
        state.attempt(DeviceStep::WriterRelease)?;
        state.writer_locked = false;
        self.released = true;
        Ok(())
    }
}

// ============================================================================
// Virtual Transport
// ============================================================================

#[derive(Default)]
struct TransportState {
    authorized: Vec<Arc<VirtualDevice>>,
    selection: Option<Arc<VirtualDevice>>,
    access_count: usize,
}

/// Transport over a set of virtual devices.
#[derive(Default)]
pub struct VirtualTransport {
    state: Mutex<TransportState>,
}

impl VirtualTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grant access to a device so it shows up in `list_authorized_devices`.
    pub fn authorize(&self, device: &Arc<VirtualDevice>) {
        let mut state = self.lock();
        if !state.authorized.iter().any(|d| Arc::ptr_eq(d, device)) {
            state.authorized.push(device.clone());
        }
    }

    /// Preset what the user picks in the chooser. `None` means they cancel.
    pub fn set_selection(&self, device: Option<Arc<VirtualDevice>>) {
        self.lock().selection = device;
    }

    /// Number of enumeration or selection calls made so far.
    pub fn access_count(&self) -> usize {
        self.lock().access_count
    }
}

#[async_trait]
impl SerialTransport for VirtualTransport {
    async fn list_authorized_devices(&self) -> std::io::Result<Vec<Arc<dyn DevicePort>>> {
        let mut state = self.lock();
        state.access_count += 1;
        Ok(state
            .authorized
            .iter()
            .map(|d| d.clone() as Arc<dyn DevicePort>)
            .collect())
    }

    async fn request_device_selection(&self) -> Result<Arc<dyn DevicePort>, LinkError> {
        let mut state = self.lock();
        state.access_count += 1;
        let device = state.selection.clone().ok_or(LinkError::SelectionCancelled)?;
        // Picking a device grants access to it, as the browser chooser does
        if !state.authorized.iter().any(|d| Arc::ptr_eq(d, &device)) {
            state.authorized.push(device.clone());
        }
        Ok(device)
    }
}

// ============================================================================
// Tests
// ============================================================================
