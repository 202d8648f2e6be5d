use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::io::{LineConfig, Parity};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LinkSettings {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    /// Port picked when no interactive selector is installed
    #[serde(default)]
    pub port_name: Option<String>,
    /// Ports treated as already authorized (empty = every enumerated port)
    #[serde(default)]
    pub allowed_ports: Vec<String>,
    #[serde(default = "default_port_timeout_ms")]
    pub port_timeout_ms: u64,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_baud_rate() -> u32 {
    115_200
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_port_timeout_ms() -> u64 {
    10
}
fn default_read_chunk_size() -> usize {
    256
}
fn default_write_timeout_ms() -> u64 {
    2000
}
fn default_teardown_timeout_ms() -> u64 {
    1000
}
fn default_storage_key() -> String {
    "serialPortInfo".to_string()
}
fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("serial-link")
        .join("state.json")
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            port_name: None,
            allowed_ports: Vec::new(),
            port_timeout_ms: default_port_timeout_ms(),
            read_chunk_size: default_read_chunk_size(),
            write_timeout_ms: default_write_timeout_ms(),
            teardown_timeout_ms: default_teardown_timeout_ms(),
            storage_key: default_storage_key(),
            store_path: default_store_path(),
            log_dir: None,
        }
    }
}

impl LinkSettings {
    pub fn line_config(&self) -> LineConfig {
        LineConfig {
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity.clone(),
        }
    }
}

/// Load settings from a JSON file. On first run the defaults are written out.
pub fn load_settings(path: &Path) -> Result<LinkSettings, String> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read settings: {}", e))?;

        serde_json::from_str(&content).map_err(|e| format!("Failed to parse settings: {}", e))
    } else {
        let settings = LinkSettings::default();
        save_settings(path, &settings)?;
        Ok(settings)
    }
}

pub fn save_settings(path: &Path, settings: &LinkSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings dir: {}", e))?;
        }
    }

    let content = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;

    std::fs::write(path, content).map_err(|e| format!("Failed to write settings: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = LinkSettings::default();
        assert_eq!(s.baud_rate, 115_200);
        assert_eq!(s.storage_key, "serialPortInfo");
        assert_eq!(s.line_config(), LineConfig::default());
        assert!(s.store_path.ends_with("serial-link/state.json"));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let s: LinkSettings =
            serde_json::from_str(r#"{"baud_rate": 9600, "parity": "even"}"#).unwrap();
        assert_eq!(s.baud_rate, 9600);
        assert_eq!(s.parity, Parity::Even);
        assert_eq!(s.data_bits, 8);
        assert_eq!(s.read_chunk_size, 256);
        assert_eq!(s.storage_key, "serialPortInfo");
    }

    #[test]
    fn test_load_creates_defaults_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("settings.json");

        let first = load_settings(&path).unwrap();
        assert!(path.exists());
        assert_eq!(first, LinkSettings::default());

        let changed = LinkSettings {
            port_name: Some("/dev/ttyACM0".to_string()),
            ..first
        };
        save_settings(&path, &changed).unwrap();
        assert_eq!(load_settings(&path).unwrap(), changed);
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "baud_rate = 9600").unwrap();
        assert!(load_settings(&path).is_err());
    }
}
