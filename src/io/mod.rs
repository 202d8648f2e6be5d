// src/io/mod.rs
//
// Device transport seam.
// The link manager only ever talks to these traits; concrete backends are the
// system serial ports (desktop) and an in-memory virtual device.

pub mod decoder;
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub mod serial;
pub mod virtual_device;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::LinkError;

// ============================================================================
// Types
// ============================================================================

/// Description of a device as reported by the transport.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// Parity setting for serial port configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Line parameters used when opening a device.
#[derive(Clone, Debug, PartialEq)]
pub struct LineConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Readable half of an open device. Holding one is holding the read lock.
#[async_trait]
pub trait ByteReader: Send {
    /// Wait for the next chunk of bytes. `Ok(None)` means end of data.
    async fn read(&mut self) -> std::io::Result<Option<Vec<u8>>>;

    /// Cancel any outstanding read; subsequent reads report end of data.
    async fn cancel(&mut self) -> std::io::Result<()>;

    /// Give up the read lock on the underlying stream.
    fn release(&mut self) -> std::io::Result<()>;
}

/// Writable half of an open device. Holding one is holding the write lock.
#[async_trait]
pub trait ByteWriter: Send {
    /// Write all bytes and wait until they are handed to the device.
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Flush and close the stream.
    async fn close(&mut self) -> std::io::Result<()>;

    /// Give up the write lock on the underlying stream.
    fn release(&mut self) -> std::io::Result<()>;
}

/// A device that can be opened into a reader/writer pair.
///
/// A device with a live reader or writer cannot be opened again until both
/// are released and the device is closed.
#[async_trait]
pub trait DevicePort: Send + Sync {
    fn info(&self) -> PortInfo;

    async fn open(
        &self,
        line: &LineConfig,
    ) -> std::io::Result<(Box<dyn ByteReader>, Box<dyn ByteWriter>)>;

    async fn close(&self) -> std::io::Result<()>;
}

/// Enumeration and selection of devices.
#[async_trait]
pub trait SerialTransport: Send + Sync {
    /// Devices the user has already granted access to.
    async fn list_authorized_devices(&self) -> std::io::Result<Vec<Arc<dyn DevicePort>>>;

    /// Ask the user to pick a device. Cancelling yields
    /// [`LinkError::SelectionCancelled`].
    async fn request_device_selection(&self) -> Result<Arc<dyn DevicePort>, LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_config_default_is_115200_8n1() {
        let line = LineConfig::default();
        assert_eq!(line.baud_rate, 115_200);
        assert_eq!(line.data_bits, 8);
        assert_eq!(line.stop_bits, 1);
        assert_eq!(line.parity, Parity::None);
    }

    #[test]
    fn test_parity_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Parity::Even).unwrap(), "\"even\"");
        let p: Parity = serde_json::from_str("\"odd\"").unwrap();
        assert_eq!(p, Parity::Odd);
    }
}
