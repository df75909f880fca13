/// GDB remote serial protocol for Remora
///
/// This crate speaks the GDB remote serial protocol from both ends: a client
/// stub that drives a remote target over a byte stream, and a server stub that
/// exposes a local [`DebugTarget`] to any GDB-compatible front end.

use thiserror::Error;

pub mod codec;
pub mod commands;
pub mod communication;
pub mod config;
pub mod parser;
pub mod server;
pub mod sim;
pub mod target;
pub mod types;

pub use codec::{Codec, FramingError};
pub use commands::{ClientState, GdbClient};
pub use communication::{Connection, Incoming, InterruptHandle};
pub use config::{ClientConfig, ServerConfig};
pub use server::GdbServer;
pub use sim::SimTarget;
pub use target::{DebugTarget, StopToken, TargetError, TargetResult};
pub use types::*;

#[derive(Error, Debug)]
pub enum RspError {
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("Command not supported by peer: {0}")]
    Unsupported(String),
    #[error("Target reported error E{0:02x}")]
    Target(u8),
    #[error("Target operation failed: {0}")]
    Backend(#[from] TargetError),
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),
    #[error("Peer closed the connection")]
    Disconnected,
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("Failed to parse packet: {0}")]
    Parse(String),
    #[error("Unknown register: {0}")]
    UnknownRegister(String),
    #[error("Target is not running: {0}")]
    TargetExited(StopReply),
    #[error("Target task failed: {0}")]
    TargetTask(String),
    #[error("Target lock poisoned")]
    TargetPoisoned,
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(RspError::Target(0x0e).to_string(), "Target reported error E0e");
        assert_eq!(
            RspError::TargetExited(StopReply::Exited(0)).to_string(),
            "Target is not running: exited with code 0"
        );
        let framing: RspError = FramingError::MissingStart.into();
        assert!(matches!(framing, RspError::Framing(_)));
    }
}
