// src/error.rs
//
// Fault taxonomy for the serial link.

use crate::link::LinkState;

/// Every fault the link can hit. All of them are handled where they occur and
/// logged; the host-facing command surface never lets one escape.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The user declined or cancelled the device chooser.
    #[error("device selection cancelled")]
    SelectionCancelled,

    /// The device could not be opened (busy, permission denied, gone).
    #[error("failed to open device: {0}")]
    OpenFailed(String),

    /// No permitted device matches the stored identity.
    #[error("no permitted device matches stored identity {0}")]
    DeviceNotFound(String),

    /// Auto-connect was requested but no identity was ever stored.
    #[error("no stored device identity")]
    NoStoredIdentity,

    /// I/O error while reading. Fatal to the current link.
    #[error("read fault: {0}")]
    ReadFault(String),

    /// I/O error while writing. The link stays open.
    #[error("write fault: {0}")]
    WriteFault(String),

    /// One step of the teardown sequence failed.
    #[error("teardown step '{step}' failed: {reason}")]
    TeardownStepFault { step: &'static str, reason: String },

    /// The operation is not allowed in the current link state.
    #[error("operation not allowed while {0}")]
    InvalidState(LinkState),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("settings error: {0}")]
    Settings(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;
