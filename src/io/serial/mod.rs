// src/io/serial/mod.rs
//
// System serial port backend built on the serialport crate.
// Blocking port I/O runs on tokio's blocking pool; reads poll with a short
// port timeout so a cancel request is observed promptly.

pub mod ports;
pub mod reader;
pub(crate) mod utils;

pub use ports::{list_serial_ports, PortSelector, SystemSerialTransport};
pub use reader::SerialPortDevice;
