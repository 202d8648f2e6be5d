// Managed serial link: connect, background read loop, latest-value receive
// buffer, writes and identity-based auto-reconnect, exposed to a block
// runtime through `SerialExtension`.

#[macro_use]
mod logging;

pub mod error;
pub mod extension;
pub mod identity;
pub mod io;
pub mod link;
pub mod settings;
pub mod store_manager;

pub use error::{LinkError, Result};
pub use extension::{ExtensionHost, ExtensionInfo, ExtensionRegistry, SerialExtension};
pub use identity::{DeviceIdentity, IdentityStore};
pub use link::{LinkManager, LinkState, ReceiveBuffer, WriteGateway};
pub use logging::{init_file_logging, stop_file_logging};
pub use settings::{load_settings, save_settings, LinkSettings};
pub use store_manager::{JsonFileStore, KeyValueStore, MemoryStore};

#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub use io::serial::{PortSelector, SystemSerialTransport};

/// Build an extension over the system serial ports from a settings file.
///
/// Loads (or creates) the settings, starts file logging when a log directory
/// is configured and opens the JSON store the identity is kept in. The caller
/// registers the result with its host.
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub fn system_extension(
    settings_path: &std::path::Path,
    selector: Option<PortSelector>,
) -> Result<std::sync::Arc<SerialExtension>> {
    use std::sync::Arc;

    let settings = load_settings(settings_path).map_err(LinkError::Settings)?;

    if let Some(log_dir) = &settings.log_dir {
        if let Err(e) = init_file_logging(log_dir) {
            tlog!("[SerialExt] Warning: file logging unavailable: {}", e);
        }
    }

    let store = JsonFileStore::open(&settings.store_path).map_err(LinkError::Storage)?;

    let mut transport = SystemSerialTransport::from_settings(&settings);
    if let Some(selector) = selector {
        transport = transport.with_selector(selector);
    }

    tlog!(
        "[SerialExt] Using store {} ({} baud)",
        store.path().display(),
        settings.baud_rate
    );

    Ok(Arc::new(SerialExtension::new(
        Arc::new(transport),
        Arc::new(store),
        settings,
    )))
}
