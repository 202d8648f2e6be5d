// src/link/gateway.rs
//
// Outbound path plus the polling side of the receive buffer.
// Writes borrow the link's writer under the link mutex, so a write never
// overlaps a teardown. With no open link every send is a silent no-op.

use std::sync::Arc;
use std::time::Duration;

use super::LinkShared;
use crate::error::{LinkError, Result};

/// Wire form of a number: little-endian IEEE-754 single precision.
pub fn encode_number(value: f64) -> [u8; 4] {
    (value as f32).to_le_bytes()
}

#[derive(Clone)]
pub struct WriteGateway {
    shared: Arc<LinkShared>,
}

impl WriteGateway {
    pub(crate) fn new(shared: Arc<LinkShared>) -> Self {
        Self { shared }
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send_bytes(text.as_bytes()).await
    }

    pub async fn send_number(&self, value: f64) -> Result<()> {
        self.send_bytes(&encode_number(value)).await
    }

    /// Write raw bytes. Dropped without error when no link is open.
    /// A failed or timed-out write is reported but leaves the link up.
    pub async fn send_bytes(&self, data: &[u8]) -> Result<()> {
        let mut link = self.shared.link.lock().await;
        let Some(writer) = link.as_mut().and_then(|h| h.writer.as_mut()) else {
            return Ok(());
        };

        let timeout = Duration::from_millis(self.shared.settings.write_timeout_ms);
        let reason = match tokio::time::timeout(timeout, writer.write(data)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", timeout),
        };

        tlog!(
            "[WriteGateway] Error sending {} byte(s): {}",
            data.len(),
            reason
        );
        Err(LinkError::WriteFault(reason))
    }

    /// Consume the pending chunk, `""` if there is none.
    pub fn get_received_data(&self) -> String {
        self.shared.buffer.take()
    }

    pub fn has_received_data(&self) -> bool {
        self.shared.buffer.has_data()
    }

    /// Resolve on the next chunk arrival.
    pub async fn wait_for_data(&self) {
        self.shared.buffer.wait_for_data().await
    }
}
