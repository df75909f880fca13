/// Session configuration
///
/// Client and server settings with protocol defaults, loadable from JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::RegisterLayout;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Largest packet assumed until the server announces its own PacketSize
    pub packet_size: usize,
    pub ack_timeout_ms: u64,
    /// Transmissions of one packet before giving up on an acknowledgement
    pub max_retries: usize,
    /// Request QStartNoAckMode when the server offers it
    pub no_ack_mode: bool,
    /// Kind field sent with `Z`/`z` packets
    pub breakpoint_kind: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            packet_size: 0x400,
            ack_timeout_ms: 1000,
            max_retries: 10,
            no_ack_mode: true,
            breakpoint_kind: 0,
        }
    }
}

impl ClientConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// PacketSize announced in the qSupported reply
    pub packet_size: usize,
    /// Socket poll period while idle, also the latency of asynchronous stop reports
    pub poll_interval_ms: u64,
    /// Offer QStartNoAckMode to clients
    pub no_ack_mode: bool,
    pub max_retries: usize,
    pub ack_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            packet_size: 0x1000,
            poll_interval_ms: 100,
            no_ack_mode: true,
            max_retries: 10,
            ack_timeout_ms: 1000,
        }
    }
}

impl ServerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Read a register layout from a JSON array of `{ "name", "bits" }` objects
pub fn load_layout(path: impl AsRef<Path>) -> Result<RegisterLayout> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
