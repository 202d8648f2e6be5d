// src/io/serial/ports.rs
//
// Port enumeration and device selection for the system serial backend.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::reader::SerialPortDevice;
use crate::error::LinkError;
use crate::io::{DevicePort, PortInfo, SerialTransport};
use crate::settings::LinkSettings;

/// Picks a port from the enumerated list, standing in for the permission
/// prompt. Returning `None` cancels the selection.
pub type PortSelector = Arc<dyn Fn(&[PortInfo]) -> Option<String> + Send + Sync>;

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(port: serialport::SerialPortInfo) -> Self {
        let mut info = PortInfo {
            port_name: port.port_name,
            ..PortInfo::default()
        };
        info.port_type = match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                info.vid = Some(usb.vid);
                info.pid = Some(usb.pid);
                info.manufacturer = usb.manufacturer;
                info.product = usb.product;
                info.serial_number = usb.serial_number;
                "USB"
            }
            serialport::SerialPortType::BluetoothPort => "Bluetooth",
            serialport::SerialPortType::PciPort => "PCI",
            serialport::SerialPortType::Unknown => "Unknown",
        }
        .to_string();
        info
    }
}

/// Whether an enumerated port should be offered at all. macOS lists every
/// device twice; only the `/dev/cu.*` call-out node is kept, since opening
/// `/dev/tty.*` blocks until carrier detect.
fn is_listed(port_name: &str) -> bool {
    !(cfg!(target_os = "macos") && port_name.starts_with("/dev/tty."))
}

/// Enumerate the serial ports the OS reports.
pub fn list_serial_ports() -> Result<Vec<PortInfo>, String> {
    let ports =
        serialport::available_ports().map_err(|e| format!("Failed to enumerate ports: {}", e))?;

    Ok(ports
        .into_iter()
        .filter(|p| is_listed(&p.port_name))
        .map(PortInfo::from)
        .collect())
}

/// Transport over the operating system's serial ports.
///
/// "Authorized" devices are the enumerated ports, narrowed to `allowed_ports`
/// when that list is non-empty, plus any port picked through selection during
/// this session.
pub struct SystemSerialTransport {
    port_name: Option<String>,
    allowed_ports: Vec<String>,
    port_timeout: Duration,
    chunk_size: usize,
    selector: Option<PortSelector>,
    granted: Mutex<HashSet<String>>,
    devices: Mutex<Vec<Arc<SerialPortDevice>>>,
}

impl SystemSerialTransport {
    pub fn from_settings(settings: &LinkSettings) -> Self {
        Self {
            port_name: settings.port_name.clone(),
            allowed_ports: settings.allowed_ports.clone(),
            port_timeout: Duration::from_millis(settings.port_timeout_ms.max(1)),
            chunk_size: settings.read_chunk_size,
            selector: None,
            granted: Mutex::new(HashSet::new()),
            devices: Mutex::new(Vec::new()),
        }
    }

    /// Install the callback used by `request_device_selection`.
    pub fn with_selector(mut self, selector: PortSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    fn is_authorized(&self, port_name: &str) -> bool {
        if self.allowed_ports.is_empty() {
            return true;
        }
        if self.allowed_ports.iter().any(|p| p == port_name) {
            return true;
        }
        self.granted
            .lock()
            .map(|g| g.contains(port_name))
            .unwrap_or(false)
    }

    /// Reuse the device object for a port so its lock state survives
    /// re-enumeration.
    fn device_for(&self, info: PortInfo) -> Arc<SerialPortDevice> {
        let mut devices = match self.devices.lock() {
            Ok(d) => d,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = devices
            .iter()
            .find(|d| d.info().port_name == info.port_name)
        {
            return existing.clone();
        }
        let device = Arc::new(SerialPortDevice::new(
            info,
            self.port_timeout,
            self.chunk_size,
        ));
        devices.push(device.clone());
        device
    }

    async fn enumerate() -> std::io::Result<Vec<PortInfo>> {
        tokio::task::spawn_blocking(list_serial_ports)
            .await
            .map_err(|e| std::io::Error::other(format!("Port enumeration task failed: {}", e)))?
            .map_err(std::io::Error::other)
    }
}

#[async_trait]
impl SerialTransport for SystemSerialTransport {
    async fn list_authorized_devices(&self) -> std::io::Result<Vec<Arc<dyn DevicePort>>> {
        let ports = Self::enumerate().await?;
        Ok(ports
            .into_iter()
            .filter(|p| self.is_authorized(&p.port_name))
            .map(|p| self.device_for(p) as Arc<dyn DevicePort>)
            .collect())
    }

    async fn request_device_selection(&self) -> Result<Arc<dyn DevicePort>, LinkError> {
        let ports = Self::enumerate()
            .await
            .map_err(|e| LinkError::OpenFailed(e.to_string()))?;

        let chosen = match &self.selector {
            Some(selector) => selector(&ports),
            None => self.port_name.clone(),
        };
        let Some(chosen) = chosen else {
            return Err(LinkError::SelectionCancelled);
        };

        // Ports that are not enumerated (pty pairs, some adapters) can still
        // be opened by name, they just carry no vendor/product identity
        let info = ports
            .into_iter()
            .find(|p| p.port_name == chosen)
            .unwrap_or_else(|| PortInfo {
                port_name: chosen.clone(),
                port_type: "Unknown".to_string(),
                ..PortInfo::default()
            });

        if let Ok(mut granted) = self.granted.lock() {
            granted.insert(chosen);
        }

        Ok(self.device_for(info) as Arc<dyn DevicePort>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_port_info_carries_identity() {
        let info = PortInfo::from(serialport::SerialPortInfo {
            port_name: "/dev/ttyACM0".to_string(),
            port_type: serialport::SerialPortType::UsbPort(serialport::UsbPortInfo {
                vid: 9025,
                pid: 67,
                serial_number: Some("A1".to_string()),
                manufacturer: Some("Arduino".to_string()),
                product: None,
            }),
        });
        assert_eq!(info.port_type, "USB");
        assert_eq!((info.vid, info.pid), (Some(9025), Some(67)));
        assert_eq!(info.manufacturer.as_deref(), Some("Arduino"));
    }

    #[test]
    fn test_non_usb_port_has_no_identity() {
        let info = PortInfo::from(serialport::SerialPortInfo {
            port_name: "/dev/ttyS0".to_string(),
            port_type: serialport::SerialPortType::PciPort,
        });
        assert_eq!(info.port_type, "PCI");
        assert_eq!((info.vid, info.pid), (None, None));
    }

    #[test]
    fn test_listed_ports() {
        assert!(is_listed("/dev/ttyUSB0"));
        assert!(is_listed("/dev/cu.usbmodem1"));
        assert_eq!(is_listed("/dev/tty.usbmodem1"), !cfg!(target_os = "macos"));
    }

    #[test]
    fn test_authorized_without_allow_list() {
        let transport = SystemSerialTransport::from_settings(&LinkSettings::default());
        assert!(transport.is_authorized("/dev/ttyUSB0"));
    }

    #[test]
    fn test_allow_list_restricts_ports() {
        let settings = LinkSettings {
            allowed_ports: vec!["/dev/ttyACM0".to_string()],
            ..LinkSettings::default()
        };
        let transport = SystemSerialTransport::from_settings(&settings);
        assert!(transport.is_authorized("/dev/ttyACM0"));
        assert!(!transport.is_authorized("/dev/ttyUSB0"));
    }

    #[test]
    fn test_device_object_is_reused_per_port() {
        let transport = SystemSerialTransport::from_settings(&LinkSettings::default());
        let info = PortInfo {
            port_name: "/dev/ttyUSB0".to_string(),
            ..PortInfo::default()
        };
        let a = transport.device_for(info.clone());
        let b = transport.device_for(info);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_selector_declining_cancels() {
        let transport = SystemSerialTransport::from_settings(&LinkSettings::default())
            .with_selector(Arc::new(|_ports: &[PortInfo]| None));
        let result = transport.request_device_selection().await;
        // Enumeration itself may fail on hosts without serial support
        assert!(matches!(
            result,
            Err(LinkError::SelectionCancelled) | Err(LinkError::OpenFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_named_port_selected_without_enumeration_match() {
        let settings = LinkSettings {
            port_name: Some("/dev/serial-link-pty".to_string()),
            ..LinkSettings::default()
        };
        let transport = SystemSerialTransport::from_settings(&settings);
        if let Ok(device) = transport.request_device_selection().await {
            let info = device.info();
            assert_eq!(info.port_name, "/dev/serial-link-pty");
            assert_eq!(info.vid, None);
            assert!(transport.is_authorized("/dev/serial-link-pty"));
        }
    }
}
