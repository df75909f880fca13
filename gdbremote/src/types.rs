/// Remote protocol data model
///
/// This module defines the values shared by both ends of a remote serial
/// protocol session: register layouts, negotiated features, breakpoints and
/// the reasons a target stopped.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Register values keyed by register name
pub type RegisterMap = BTreeMap<String, u128>;

/// Interrupted by the user (`0x03` on the wire)
pub const SIGINT: u8 = 2;
/// Breakpoint or single-step completion
pub const SIGTRAP: u8 = 5;

/// Byte order of the target's registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// One entry of a register layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    pub name: String,
    pub bits: u32,
    #[serde(default)]
    pub wire_index: usize,
}

impl RegisterDescriptor {
    /// Number of bytes the register occupies on the wire
    pub fn byte_len(&self) -> usize {
        (self.bits as usize + 7) / 8
    }

    /// Number of hex characters the register occupies on the wire
    pub fn hex_len(&self) -> usize {
        self.byte_len() * 2
    }
}

/// Ordered, closed register table.
///
/// The order is part of the wire contract: both ends of a session must use
/// byte-for-byte the same layout for `g`/`G` packets to line up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<RegisterDescriptor>", into = "Vec<RegisterDescriptor>")]
pub struct RegisterLayout {
    registers: Vec<RegisterDescriptor>,
}

impl RegisterLayout {
    /// Build a layout from `(name, bits)` pairs; wire indices follow the order given
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let registers = entries
            .into_iter()
            .enumerate()
            .map(|(wire_index, (name, bits))| RegisterDescriptor {
                name: name.into(),
                bits,
                wire_index,
            })
            .collect();

        Self { registers }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.registers.iter()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Look a register up by its protocol index (`p`/`P` packets)
    pub fn by_index(&self, wire_index: usize) -> Option<&RegisterDescriptor> {
        self.registers.iter().find(|r| r.wire_index == wire_index)
    }

    pub fn by_name(&self, name: &str) -> Option<&RegisterDescriptor> {
        self.registers.iter().find(|r| r.name == name)
    }

    /// The program counter, recognised by its conventional name
    pub fn program_counter(&self) -> Option<&RegisterDescriptor> {
        ["pc", "rip", "eip"]
            .iter()
            .find_map(|name| self.by_name(name))
    }

    /// Length in hex characters of a complete `g` reply
    pub fn total_hex_len(&self) -> usize {
        self.registers.iter().map(RegisterDescriptor::hex_len).sum()
    }

    /// General purpose registers of x86-64, in GDB's `g` packet order
    pub fn x86_64() -> Self {
        let mut entries: Vec<(&str, u32)> = [
            "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp",
            "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15", "rip",
        ]
        .iter()
        .map(|&name| (name, 64))
        .collect();
        entries.extend(["eflags", "cs", "ss", "ds", "es", "fs", "gs"].iter().map(|&name| (name, 32)));
        Self::new(entries)
    }

    /// ARMv7-M core registers
    pub fn arm_cortex_m() -> Self {
        let names = [
            "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12",
            "sp", "lr", "pc", "xpsr",
        ];
        Self::new(names.iter().map(|&name| (name, 32)))
    }

    /// RV32I integer registers followed by the program counter
    pub fn riscv32() -> Self {
        let names = [
            "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2",
            "a3", "a4", "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9",
            "s10", "s11", "t3", "t4", "t5", "t6", "pc",
        ];
        Self::new(names.iter().map(|&name| (name, 32)))
    }
}

impl From<Vec<RegisterDescriptor>> for RegisterLayout {
    fn from(registers: Vec<RegisterDescriptor>) -> Self {
        Self::new(registers.into_iter().map(|r| (r.name, r.bits)))
    }
}

impl From<RegisterLayout> for Vec<RegisterDescriptor> {
    fn from(layout: RegisterLayout) -> Self {
        layout.registers
    }
}

/// Capabilities exchanged through `qSupported`.
///
/// The set is closed; every field is `None` until the exchange populates it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureTable {
    /// Set once a `qSupported` exchange has completed
    pub supported: bool,
    pub packet_size: Option<usize>,
    pub multiprocess: Option<bool>,
    pub start_no_ack_mode: Option<bool>,
    pub xfer_memory_map_read: Option<bool>,
    pub xfer_features_read: Option<bool>,
    pub pass_signals: Option<bool>,
}

impl FeatureTable {
    /// Record one `name+`, `name-`, `name?` or `name=value` token.
    ///
    /// Returns `false` when the token names a feature outside the table.
    pub fn record(&mut self, token: &str) -> bool {
        let (name, value) = match token.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (token, None),
        };

        if name == "PacketSize" {
            self.packet_size = value.and_then(|v| usize::from_str_radix(v, 16).ok());
            return true;
        }

        let (name, flag) = match name.as_bytes().last() {
            Some(b'+') => (&name[..name.len() - 1], Some(true)),
            Some(b'-') => (&name[..name.len() - 1], Some(false)),
            Some(b'?') => (&name[..name.len() - 1], None),
            _ => (name, None),
        };

        let slot = match name {
            "multiprocess" => &mut self.multiprocess,
            "QStartNoAckMode" => &mut self.start_no_ack_mode,
            "qXfer:memory-map:read" => &mut self.xfer_memory_map_read,
            "qXfer:features:read" => &mut self.xfer_features_read,
            "QPassSignals" => &mut self.pass_signals,
            _ => return false,
        };
        *slot = flag;
        true
    }

    /// Render the table in `qSupported` reply form
    pub fn to_reply(&self) -> String {
        let mut parts = Vec::new();
        if let Some(size) = self.packet_size {
            parts.push(format!("PacketSize={:x}", size));
        }

        let flags = [
            ("QStartNoAckMode", self.start_no_ack_mode),
            ("multiprocess", self.multiprocess),
            ("QPassSignals", self.pass_signals),
            ("qXfer:features:read", self.xfer_features_read),
            ("qXfer:memory-map:read", self.xfer_memory_map_read),
        ];
        for (name, flag) in flags {
            match flag {
                Some(true) => parts.push(format!("{}+", name)),
                Some(false) => parts.push(format!("{}-", name)),
                None => {}
            }
        }

        parts.join(";")
    }

    pub fn no_ack_offered(&self) -> bool {
        self.start_no_ack_mode == Some(true)
    }
}

/// Which breakpoint collection an entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakpointKind {
    Software,
    Hardware,
}

impl BreakpointKind {
    /// The `type` field of `Z`/`z` packets
    pub fn z_type(self) -> u8 {
        match self {
            BreakpointKind::Software => 0,
            BreakpointKind::Hardware => 1,
        }
    }

    /// Watchpoint types (2..=4) have no breakpoint kind
    pub fn from_z_type(z_type: u8) -> Option<Self> {
        match z_type {
            0 => Some(BreakpointKind::Software),
            1 => Some(BreakpointKind::Hardware),
            _ => None,
        }
    }
}

impl fmt::Display for BreakpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakpointKind::Software => write!(f, "software"),
            BreakpointKind::Hardware => write!(f, "hardware"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointRecord {
    pub kind: BreakpointKind,
    pub address: u64,
    pub length_hint: u64,
}

/// Software and hardware breakpoints installed during one session.
///
/// Entries are keyed by `(kind, address)`; backend handles are never stored.
#[derive(Debug, Default)]
pub struct BreakpointSet {
    software: HashMap<u64, BreakpointRecord>,
    hardware: HashMap<u64, BreakpointRecord>,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn collection(&self, kind: BreakpointKind) -> &HashMap<u64, BreakpointRecord> {
        match kind {
            BreakpointKind::Software => &self.software,
            BreakpointKind::Hardware => &self.hardware,
        }
    }

    fn collection_mut(&mut self, kind: BreakpointKind) -> &mut HashMap<u64, BreakpointRecord> {
        match kind {
            BreakpointKind::Software => &mut self.software,
            BreakpointKind::Hardware => &mut self.hardware,
        }
    }

    /// Insert a record; returns `false` if the same `(kind, address)` was already present
    pub fn insert(&mut self, record: BreakpointRecord) -> bool {
        let collection = self.collection_mut(record.kind);
        if collection.contains_key(&record.address) {
            return false;
        }
        collection.insert(record.address, record);
        true
    }

    pub fn remove(&mut self, kind: BreakpointKind, address: u64) -> Option<BreakpointRecord> {
        self.collection_mut(kind).remove(&address)
    }

    pub fn get(&self, kind: BreakpointKind, address: u64) -> Option<&BreakpointRecord> {
        self.collection(kind).get(&address)
    }

    pub fn contains(&self, kind: BreakpointKind, address: u64) -> bool {
        self.collection(kind).contains_key(&address)
    }

    /// True when the other kind already holds a breakpoint at `address`
    pub fn conflicts(&self, kind: BreakpointKind, address: u64) -> bool {
        let other = match kind {
            BreakpointKind::Software => BreakpointKind::Hardware,
            BreakpointKind::Hardware => BreakpointKind::Software,
        };
        self.contains(other, address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BreakpointRecord> {
        self.software.values().chain(self.hardware.values())
    }

    /// Remove and return every record
    pub fn drain(&mut self) -> Vec<BreakpointRecord> {
        self.software
            .drain()
            .chain(self.hardware.drain())
            .map(|(_, record)| record)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.software.len() + self.hardware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Thread identifier as used by `H`, `qC` and thread-list packets.
///
/// `0` means "any thread" and `-1` means "all threads".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub i64);

impl ThreadId {
    pub const ANY: ThreadId = ThreadId(0);
    pub const ALL: ThreadId = ThreadId(-1);
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            write!(f, "-{:x}", self.0.unsigned_abs())
        } else {
            write!(f, "{:x}", self.0)
        }
    }
}

/// Why the target stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HaltReason {
    pub signal: u8,
    /// Register values the stub chose to report with the stop
    pub registers: Option<RegisterMap>,
    pub thread: Option<ThreadId>,
}

impl HaltReason {
    pub fn signal(signal: u8) -> Self {
        Self {
            signal,
            registers: None,
            thread: None,
        }
    }
}

/// A decoded stop-reply packet (`S`, `T`, `W` or `X`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReply {
    Halted(HaltReason),
    Exited(u8),
    Terminated(u8),
}

impl StopReply {
    pub fn signal(&self) -> Option<u8> {
        match self {
            StopReply::Halted(reason) => Some(reason.signal),
            StopReply::Terminated(signal) => Some(*signal),
            StopReply::Exited(_) => None,
        }
    }

    /// The process is gone and cannot be resumed
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StopReply::Halted(_))
    }
}

impl fmt::Display for StopReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReply::Halted(reason) => write!(f, "halted with signal {}", reason.signal),
            StopReply::Exited(code) => write!(f, "exited with code {}", code),
            StopReply::Terminated(signal) => write!(f, "terminated by signal {}", signal),
        }
    }
}

/// Load offsets reported by `qOffsets`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionOffsets {
    pub text: u64,
    pub data: u64,
    pub bss: Option<u64>,
}

impl SectionOffsets {
    /// Translate a link-time text address into a load address
    pub fn relocate(&self, address: u64) -> u64 {
        address.wrapping_add(self.text)
    }
}

/// Lifecycle of the server's accept/dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Bound and waiting for a client
    Startup,
    /// Client accepted, no command seen yet
    RunStart,
    /// Dispatching commands
    Running,
    /// Peer gone; state is discarded before the next accept
    Shutdown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Startup => "startup",
            SessionState::RunStart => "run-start",
            SessionState::Running => "running",
            SessionState::Shutdown => "shutdown",
        };
        write!(f, "{}", s)
    }
}
