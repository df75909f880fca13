/// Debug target interface
///
/// The boundary between the server stub and whatever actually executes code:
/// an emulator, a probe, or a traced process. The stub calls into a target,
/// never the reverse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::types::{HaltReason, RegisterDescriptor, SectionOffsets, ThreadId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("cannot access memory at address {0:#x}")]
    MemoryAccess(u64),
    #[error("invalid register: {0}")]
    InvalidRegister(String),
    #[error("operation not supported by target")]
    Unsupported,
    #[error("a breakpoint of the other kind already exists at {0:#x}")]
    BreakpointConflict(u64),
    #[error("target error: {0}")]
    Other(String),
}

impl TargetError {
    /// errno-style code carried in an `E` reply
    pub fn code(&self) -> u8 {
        match self {
            TargetError::MemoryAccess(_) => 0x0e,
            TargetError::InvalidRegister(_) => 0x16,
            TargetError::Unsupported => 0x26,
            TargetError::BreakpointConflict(_) => 0x11,
            TargetError::Other(_) => 0x01,
        }
    }
}

pub type TargetResult<T> = std::result::Result<T, TargetError>;

/// Shared flag asking a running target to stop.
///
/// The server triggers it when an interrupt byte arrives while
/// [`DebugTarget::resume_execution`] is in progress; targets poll it.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    requested: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Operations the server stub needs from a backend.
///
/// Registers are addressed by descriptor, so a backend may key them by name or
/// by wire index. Signals are POSIX numbers as they appear in stop replies.
pub trait DebugTarget: Send + 'static {
    fn read_memory(&mut self, address: u64, length: usize) -> TargetResult<Vec<u8>>;

    fn write_memory(&mut self, address: u64, data: &[u8]) -> TargetResult<()>;

    fn read_register(&mut self, register: &RegisterDescriptor) -> TargetResult<u128>;

    fn write_register(&mut self, register: &RegisterDescriptor, value: u128) -> TargetResult<()>;

    /// Execute one instruction and report the resulting signal
    fn step_instruction(&mut self) -> TargetResult<u8>;

    /// Run until the target halts or `stop` is triggered.
    ///
    /// Runs on a blocking thread; may take arbitrarily long.
    fn resume_execution(&mut self, stop: &StopToken) -> TargetResult<u8>;

    fn set_software_breakpoint(&mut self, address: u64) -> TargetResult<()>;

    fn clear_software_breakpoint(&mut self, address: u64) -> TargetResult<()>;

    fn set_hardware_breakpoint(&mut self, address: u64) -> TargetResult<()>;

    fn clear_hardware_breakpoint(&mut self, address: u64) -> TargetResult<()>;

    /// Signal of the most recent halt
    fn current_halt_signal(&mut self) -> u8;

    /// Full halt description; defaults to the bare signal
    fn halt_reason(&mut self) -> HaltReason {
        HaltReason::signal(self.current_halt_signal())
    }

    /// Let the target run on its own once the debugger detaches
    fn run_free(&mut self) {}

    fn kill(&mut self) -> TargetResult<()> {
        Err(TargetError::Unsupported)
    }

    /// Threads the target knows about; empty means a single implicit thread
    fn threads(&mut self) -> Vec<ThreadId> {
        Vec::new()
    }

    fn section_offsets(&mut self) -> SectionOffsets {
        SectionOffsets::default()
    }

    /// Target description XML served through `qXfer:features:read`
    fn target_description(&self) -> Option<String> {
        None
    }

    /// Memory map XML served through `qXfer:memory-map:read`
    fn memory_map(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_token_is_shared_between_clones() {
        let token = StopToken::new();
        let observer = token.clone();

        assert!(!observer.is_stop_requested());
        token.request_stop();
        assert!(observer.is_stop_requested());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(TargetError::MemoryAccess(0x10).code(), 0x0e);
        assert_eq!(TargetError::Other("x".into()).code(), 0x01);
        assert_eq!(
            TargetError::MemoryAccess(0x1000).to_string(),
            "cannot access memory at address 0x1000"
        );
    }
}
