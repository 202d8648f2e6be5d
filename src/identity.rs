// src/identity.rs
//
// Device identity and its persistence.
//
// Identity is a USB vendor/product pair rendered as "vid:pid" in decimal, with
// "unk" for anything the transport does not report. The string form is the
// equality key, so every device without identifiers collapses to "unk:unk".

use std::fmt;
use std::sync::Arc;

use crate::io::DevicePort;
use crate::store_manager::KeyValueStore;

const UNKNOWN: &str = "unk";

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceIdentity {
    /// A zero identifier is reported as missing.
    pub fn new(vendor_id: Option<u16>, product_id: Option<u16>) -> Self {
        Self {
            vendor_id: vendor_id.filter(|v| *v != 0),
            product_id: product_id.filter(|v| *v != 0),
        }
    }

    /// Read the identifiers from a device descriptor.
    pub fn capture(device: &dyn DevicePort) -> Self {
        let info = device.info();
        Self::new(info.vid, info.pid)
    }

    pub fn canonical(&self) -> String {
        format!(
            "{}:{}",
            render_part(self.vendor_id),
            render_part(self.product_id)
        )
    }

    /// Parse a canonical string. `None` if it is not of the form `a:b`
    /// where each part is a decimal u16 or `unk`.
    pub fn parse(s: &str) -> Option<Self> {
        let (vendor, product) = s.trim().split_once(':')?;
        Some(Self::new(parse_part(vendor)?, parse_part(product)?))
    }

    /// Same device as far as the canonical key can tell.
    pub fn matches(&self, other: &DeviceIdentity) -> bool {
        self.canonical() == other.canonical()
    }
}

fn render_part(value: Option<u16>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => UNKNOWN.to_string(),
    }
}

fn parse_part(s: &str) -> Option<Option<u16>> {
    if s == UNKNOWN {
        return Some(None);
    }
    s.parse::<u16>().ok().map(Some)
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

// ============================================================================
// Identity Store
// ============================================================================

/// Single-slot store for the last successfully connected identity.
/// Storage failures are logged and swallowed.
#[derive(Clone)]
pub struct IdentityStore {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl IdentityStore {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn save(&self, identity: &DeviceIdentity) {
        if let Err(e) = self.store.set(&self.key, &identity.canonical()) {
            tlog!(
                "[IdentityStore] Warning: failed to persist identity {}: {}",
                identity,
                e
            );
        }
    }

    pub fn load(&self) -> Option<DeviceIdentity> {
        let raw = self.store.get(&self.key)?;
        let identity = DeviceIdentity::parse(&raw);
        if identity.is_none() {
            tlog!(
                "[IdentityStore] Warning: discarding malformed stored identity '{}'",
                raw
            );
            self.clear();
        }
        identity
    }

    /// Forget the stored identity (best-effort).
    pub fn clear(&self) {
        if let Err(e) = self.store.delete(&self.key) {
            tlog!("[IdentityStore] Warning: failed to clear identity: {}", e);
        }
    }
}
