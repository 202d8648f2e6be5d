// src/extension.rs
//
// Block-runtime command surface over one LinkManager.
// Every command swallows and logs its error; nothing propagates to the host.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::io::SerialTransport;
use crate::link::{DataCallback, LinkManager, WriteGateway};
use crate::settings::LinkSettings;
use crate::store_manager::KeyValueStore;

pub const EXTENSION_ID: &str = "serialExt";
const DEFAULT_TEXT: &str = "Hallo";
const DEFAULT_NUMBER: f64 = 123.0;

// ============================================================================
// Block metadata
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Command,
    Hat,
    Reporter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentType {
    String,
    Number,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockArgument {
    #[serde(rename = "type")]
    pub arg_type: ArgumentType,
    pub default_value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub opcode: &'static str,
    pub block_type: BlockType,
    pub text: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: BTreeMap<&'static str, BlockArgument>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExtensionInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub blocks: Vec<BlockInfo>,
}

fn block(opcode: &'static str, block_type: BlockType, text: &'static str) -> BlockInfo {
    BlockInfo {
        opcode,
        block_type,
        text,
        arguments: BTreeMap::new(),
    }
}

fn with_argument(
    mut info: BlockInfo,
    name: &'static str,
    arg_type: ArgumentType,
    default_value: Value,
) -> BlockInfo {
    info.arguments.insert(
        name,
        BlockArgument {
            arg_type,
            default_value,
        },
    );
    info
}

// ============================================================================
// Argument coercion
// ============================================================================

/// Number coercion as the block runtime does it: numeric strings parse,
/// booleans are 0/1, anything else is 0.
fn coerce_number(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        _ => 0.0,
    }
}

fn coerce_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if n.is_f64() => format_number(f),
            _ => n.to_string(),
        },
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Render a float the way the block runtime's string cast does: whole
/// values without a fractional part, `-0` as `0`.
fn format_number(f: f64) -> String {
    if f == 0.0 {
        "0".to_string()
    } else if f.fract() == 0.0 && f.abs() < 1e21 {
        format!("{:.0}", f)
    } else {
        f.to_string()
    }
}

// ============================================================================
// Extension
// ============================================================================

/// Receives extensions at host startup.
pub trait ExtensionHost {
    fn register_extension(&mut self, info: ExtensionInfo, extension: Arc<SerialExtension>);
}

pub struct SerialExtension {
    manager: LinkManager,
    gateway: WriteGateway,
}

impl SerialExtension {
    pub fn new(
        transport: Arc<dyn SerialTransport>,
        store: Arc<dyn KeyValueStore>,
        settings: LinkSettings,
    ) -> Self {
        let manager = LinkManager::new(transport, store, settings);
        let gateway = manager.gateway();
        Self { manager, gateway }
    }

    pub fn manager(&self) -> &LinkManager {
        &self.manager
    }

    pub fn register(self: &Arc<Self>, host: &mut dyn ExtensionHost) {
        host.register_extension(Self::info(), self.clone());
        tlog!("[SerialExt] Registered extension '{}'", EXTENSION_ID);
    }

    pub fn info() -> ExtensionInfo {
        ExtensionInfo {
            id: EXTENSION_ID,
            name: "Serielle Schnittstelle",
            blocks: vec![
                block(
                    "connect",
                    BlockType::Command,
                    "verbinde mit serieller Schnittstelle",
                ),
                with_argument(
                    block("sendText", BlockType::Command, "sende Text [TEXT]"),
                    "TEXT",
                    ArgumentType::String,
                    Value::from(DEFAULT_TEXT),
                ),
                with_argument(
                    block("sendNumber", BlockType::Command, "sende Zahl [NUMBER]"),
                    "NUMBER",
                    ArgumentType::Number,
                    Value::from(DEFAULT_NUMBER as i64),
                ),
                block(
                    "onReceive",
                    BlockType::Hat,
                    "bei seriellen Daten empfangen",
                ),
                block(
                    "getReceivedData",
                    BlockType::Reporter,
                    "empfangene serielle Daten",
                ),
                block(
                    "disconnect",
                    BlockType::Command,
                    "schließe serielle Schnittstelle",
                ),
                block(
                    "autoConnect",
                    BlockType::Command,
                    "automatisch mit vorherigem Port verbinden",
                ),
            ],
        }
    }

    pub async fn connect(&self) {
        if let Err(e) = self.manager.open().await {
            tlog!("[SerialExt] connect failed: {}", e);
        }
    }

    pub async fn auto_connect(&self) {
        if let Err(e) = self.manager.auto_open().await {
            tlog!("[SerialExt] autoConnect failed: {}", e);
        }
    }

    pub async fn disconnect(&self) {
        for fault in self.manager.close().await {
            tlog!("[SerialExt] disconnect: {}", fault);
        }
    }

    pub async fn send_text(&self, text: &str) {
        if let Err(e) = self.gateway.send_text(text).await {
            tlog!("[SerialExt] sendText failed: {}", e);
        }
    }

    pub async fn send_number(&self, value: f64) {
        if let Err(e) = self.gateway.send_number(value).await {
            tlog!("[SerialExt] sendNumber failed: {}", e);
        }
    }

    /// Hat predicate: true while an unread chunk is pending.
    pub fn on_receive(&self) -> bool {
        self.gateway.has_received_data()
    }

    pub fn get_received_data(&self) -> String {
        self.gateway.get_received_data()
    }

    pub fn set_on_data_callback(&self, callback: Option<DataCallback>) {
        self.manager.set_on_data_callback(callback);
    }

    /// Run a block by opcode. Commands yield `null`, the hat a bool and the
    /// reporter a string.
    pub async fn dispatch(&self, opcode: &str, args: &Value) -> Value {
        match opcode {
            "connect" => self.connect().await,
            "autoConnect" => self.auto_connect().await,
            "disconnect" => self.disconnect().await,
            "sendText" => self.send_text(&coerce_text(args.get("TEXT"))).await,
            "sendNumber" => self.send_number(coerce_number(args.get("NUMBER"))).await,
            "onReceive" => return Value::Bool(self.on_receive()),
            "getReceivedData" => return Value::String(self.get_received_data()),
            other => tlog!("[SerialExt] Unknown opcode '{}'", other),
        }
        Value::Null
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Minimal host: keeps registered extensions by id and routes opcodes.
#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: HashMap<&'static str, (ExtensionInfo, Arc<SerialExtension>)>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, id: &str) -> Option<&ExtensionInfo> {
        self.extensions.get(id).map(|(info, _)| info)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SerialExtension>> {
        self.extensions.get(id).map(|(_, ext)| ext.clone())
    }

    pub async fn dispatch(&self, id: &str, opcode: &str, args: &Value) -> Value {
        match self.get(id) {
            Some(ext) => ext.dispatch(opcode, args).await,
            None => {
                tlog!("[SerialExt] No extension registered as '{}'", id);
                Value::Null
            }
        }
    }
}

impl ExtensionHost for ExtensionRegistry {
    fn register_extension(&mut self, info: ExtensionInfo, extension: Arc<SerialExtension>) {
        self.extensions.insert(info.id, (info, extension));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::virtual_device::{VirtualDevice, VirtualTransport};
    use crate::link::testutil::{settings, wait_until};
    use crate::link::LinkState;
    use crate::store_manager::MemoryStore;
    use serde_json::json;

    struct Harness {
        ext: Arc<SerialExtension>,
        transport: Arc<VirtualTransport>,
        device: Arc<VirtualDevice>,
        store: Arc<MemoryStore>,
    }

    fn harness() -> Harness {
        let transport = Arc::new(VirtualTransport::new());
        let device = VirtualDevice::new("vtty0", Some(9025), Some(67));
        transport.set_selection(Some(device.clone()));
        let store = Arc::new(MemoryStore::new());
        let ext = Arc::new(SerialExtension::new(
            transport.clone(),
            store.clone(),
            settings(),
        ));
        Harness {
            ext,
            transport,
            device,
            store,
        }
    }

    #[test]
    fn test_info_serializes_block_metadata() {
        let value = serde_json::to_value(SerialExtension::info()).unwrap();
        assert_eq!(value["id"], "serialExt");
        assert_eq!(value["name"], "Serielle Schnittstelle");

        let blocks = value["blocks"].as_array().unwrap();
        let opcodes: Vec<&str> = blocks
            .iter()
            .map(|b| b["opcode"].as_str().unwrap())
            .collect();
        assert_eq!(
            opcodes,
            [
                "connect",
                "sendText",
                "sendNumber",
                "onReceive",
                "getReceivedData",
                "disconnect",
                "autoConnect"
            ]
        );

        assert_eq!(blocks[1]["arguments"]["TEXT"]["type"], "string");
        assert_eq!(blocks[1]["arguments"]["TEXT"]["defaultValue"], "Hallo");
        assert_eq!(blocks[2]["arguments"]["NUMBER"]["type"], "number");
        assert_eq!(blocks[2]["arguments"]["NUMBER"]["defaultValue"], 123);
        assert_eq!(blocks[3]["blockType"], "hat");
        assert_eq!(blocks[4]["blockType"], "reporter");
        assert!(blocks[0].get("arguments").is_none());
    }

    #[test]
    fn test_number_coercion() {
        assert_eq!(coerce_number(Some(&json!(2.5))), 2.5);
        assert_eq!(coerce_number(Some(&json!(" 42 "))), 42.0);
        assert_eq!(coerce_number(Some(&json!("abc"))), 0.0);
        assert_eq!(coerce_number(Some(&json!(true))), 1.0);
        assert_eq!(coerce_number(Some(&json!(null))), 0.0);
        assert_eq!(coerce_number(None), 0.0);
    }

    #[test]
    fn test_text_coercion() {
        assert_eq!(coerce_text(Some(&json!("hi"))), "hi");
        assert_eq!(coerce_text(Some(&json!(7))), "7");
        assert_eq!(coerce_text(Some(&json!(1.0))), "1");
        assert_eq!(coerce_text(Some(&json!(-0.0))), "0");
        assert_eq!(coerce_text(Some(&json!(2.5))), "2.5");
        assert_eq!(coerce_text(Some(&json!(-3.0))), "-3");
        assert_eq!(coerce_text(Some(&json!(false))), "false");
        assert_eq!(coerce_text(Some(&json!(null))), "");
        assert_eq!(coerce_text(None), "");
    }

    #[tokio::test]
    async fn test_commands_swallow_errors() {
        let h = harness();
        h.transport.set_selection(None);

        h.ext.connect().await;
        h.ext.auto_connect().await;
        h.ext.send_text("ignored").await;
        h.ext.disconnect().await;

        assert_eq!(h.ext.manager().state(), LinkState::Disconnected);
        assert!(h.device.writes().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_round_trip() {
        let h = harness();

        assert_eq!(h.ext.dispatch("connect", &json!({})).await, Value::Null);
        assert_eq!(h.ext.manager().state(), LinkState::Connected);
        assert_eq!(h.store.get("serialPortInfo").as_deref(), Some("9025:67"));

        h.ext
            .dispatch("sendText", &json!({ "TEXT": "Hallo" }))
            .await;
        h.ext
            .dispatch("sendNumber", &json!({ "NUMBER": "123.5" }))
            .await;
        let writes = h.device.writes();
        assert_eq!(writes[0], b"Hallo".to_vec());
        assert_eq!(writes[1], 123.5f32.to_le_bytes().to_vec());

        assert_eq!(h.ext.dispatch("onReceive", &json!({})).await, json!(false));
        h.device.push_text("pong");
        wait_until(|| h.ext.on_receive()).await;
        assert_eq!(h.ext.dispatch("onReceive", &json!({})).await, json!(true));
        assert_eq!(
            h.ext.dispatch("getReceivedData", &json!({})).await,
            json!("pong")
        );
        assert_eq!(
            h.ext.dispatch("getReceivedData", &json!({})).await,
            json!("")
        );

        h.ext.dispatch("disconnect", &json!({})).await;
        assert_eq!(h.ext.manager().state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_auto_connect_after_manual_connect() {
        let h = harness();
        h.ext.connect().await;
        h.ext.disconnect().await;

        h.transport.set_selection(None);
        h.ext.dispatch("autoConnect", &json!({})).await;
        assert_eq!(h.ext.manager().state(), LinkState::Connected);
        assert_eq!(h.device.open_count(), 2);

        h.ext.disconnect().await;
    }

    #[tokio::test]
    async fn test_unknown_opcode_returns_null() {
        let h = harness();
        assert_eq!(h.ext.dispatch("blink", &json!({})).await, Value::Null);
    }

    #[tokio::test]
    async fn test_registry_routes_to_registered_extension() {
        let h = harness();
        let mut registry = ExtensionRegistry::new();
        h.ext.register(&mut registry);

        assert_eq!(
            registry.info(EXTENSION_ID).map(|i| i.blocks.len()),
            Some(7)
        );
        registry
            .dispatch(EXTENSION_ID, "connect", &json!({}))
            .await;
        assert!(h.device.is_open());

        assert_eq!(
            registry.dispatch("other", "connect", &json!({})).await,
            Value::Null
        );

        registry
            .dispatch(EXTENSION_ID, "disconnect", &json!({}))
            .await;
        assert!(!h.device.is_open());
    }
}
