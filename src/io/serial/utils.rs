// src/io/serial/utils.rs
//
// Conversions from our line configuration to the serialport crate's types.

use serialport::{DataBits, Parity as SpParity, StopBits};

use crate::io::Parity;

/// Convert our Parity enum to serialport crate's Parity type
pub fn to_serialport_parity(p: &Parity) -> SpParity {
    match p {
        Parity::None => SpParity::None,
        Parity::Odd => SpParity::Odd,
        Parity::Even => SpParity::Even,
    }
}

/// Convert data bits count to serialport crate's DataBits type
pub fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

/// Convert stop bits count to serialport crate's StopBits type
pub fn to_serialport_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

/// Short line summary for logs, e.g. `115200 8-N-1`
pub fn describe_line(line: &crate::io::LineConfig) -> String {
    format!(
        "{} {}-{}-{}",
        line.baud_rate,
        line.data_bits,
        match line.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        },
        line.stop_bits
    )
}
