/// Client stub
///
/// This module provides a high-level interface for driving a remote target
/// over the serial protocol: handshake, registers, memory, breakpoints,
/// execution control, threads and paged object transfers.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::codec::{self, Codec};
use crate::communication::{Connection, InterruptHandle};
use crate::config::ClientConfig;
use crate::parser;
use crate::types::*;
use crate::{Result, RspError};

/// Features the client announces in its `qSupported` request
const CLIENT_FEATURES: &str = "multiprocess+;swbreak+;hwbreak+;qXfer:features:read+";

/// Thread ids requested per legacy `qL` round trip
const LEGACY_THREAD_BATCH: usize = 0x20;

/// Room left for the command letter, address and length in an `M` packet
const WRITE_HEADER_RESERVE: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Handshaking,
    Attached,
}

/// Drives a remote stub over one connection
pub struct GdbClient<S> {
    conn: Connection<S>,
    codec: Codec,
    config: ClientConfig,
    state: ClientState,
    features: FeatureTable,
    current_thread: ThreadId,
    offsets: Option<SectionOffsets>,
    breakpoints: BreakpointSet,
    last_stop: Option<StopReply>,
}

impl GdbClient<TcpStream> {
    /// Open a TCP connection to a stub. The session is not attached yet.
    pub async fn connect(addr: impl ToSocketAddrs, codec: Codec, config: ClientConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        log::info!("Connected to {}", stream.peer_addr()?);
        Ok(Self::new(stream, codec, config))
    }
}

impl<S> GdbClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, codec: Codec, config: ClientConfig) -> Self {
        let conn = Connection::new(stream, config.max_retries, config.ack_timeout());
        Self {
            conn,
            codec,
            config,
            state: ClientState::Disconnected,
            features: FeatureTable::default(),
            current_thread: ThreadId::ANY,
            offsets: None,
            breakpoints: BreakpointSet::new(),
            last_stop: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn features(&self) -> &FeatureTable {
        &self.features
    }

    pub fn current_thread(&self) -> ThreadId {
        self.current_thread
    }

    /// Load offsets reported during the handshake, if the stub reports any
    pub fn offsets(&self) -> Option<SectionOffsets> {
        self.offsets
    }

    pub fn breakpoints(&self) -> &BreakpointSet {
        &self.breakpoints
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn last_stop(&self) -> Option<&StopReply> {
        self.last_stop.as_ref()
    }

    /// Negotiated packet size, or the configured one before negotiation
    pub fn packet_size(&self) -> usize {
        self.features
            .packet_size
            .unwrap_or(self.config.packet_size)
            .max(8)
    }

    /// Run the connection handshake.
    ///
    /// Negotiates features, enters no-ack mode when both sides allow it,
    /// fetches the initial halt reason, current thread and load offsets.
    pub async fn attach(&mut self) -> Result<StopReply> {
        self.state = ClientState::Handshaking;

        let reply = self.request(&format!("qSupported:{}", CLIENT_FEATURES)).await?;
        self.features = parser::parse_features(&reply);
        log::debug!("Negotiated features: {:?}", self.features);

        if self.config.no_ack_mode && self.features.no_ack_offered() {
            if self.request("QStartNoAckMode").await? == b"OK" {
                self.conn.set_no_ack(true);
            }
        }

        let stop = self.halt_reason().await?;
        if stop.is_terminal() {
            self.state = ClientState::Disconnected;
            return Err(RspError::TargetExited(stop));
        }

        if let Err(e) = self.set_thread(b'c', ThreadId::ANY).await {
            log::debug!("Hc0 not accepted: {}", e);
        }

        let reply = self.request("qC").await?;
        let reported = parser::parse_current_thread(&reply).unwrap_or(ThreadId::ANY);

        if let Err(e) = self.set_thread(b'g', ThreadId::ANY).await {
            log::debug!("Hg0 not accepted: {}", e);
        }
        self.current_thread = reported;

        let reply = self.request("qOffsets").await?;
        self.offsets = match parser::check_error(&reply) {
            Ok([]) => None,
            Ok(reply) => Some(parser::parse_offsets(reply)?),
            Err(e) => {
                log::debug!("Stub cannot report load offsets: {}", e);
                None
            }
        };

        self.state = ClientState::Attached;
        log::info!("Attached, thread {}, target {}", self.current_thread, stop);
        Ok(stop)
    }

    /// Send one command and return the reply body.
    ///
    /// Stop replies the stub sends on its own before the reply are recorded
    /// as the last stop and skipped.
    async fn request(&mut self, command: &str) -> Result<Vec<u8>> {
        self.conn.send_packet(command.as_bytes()).await?;
        loop {
            let reply = self.conn.recv_packet().await?;
            match self.unsolicited_stop(&reply) {
                Some(stop) => {
                    log::info!("Target stopped outside a request: {}", stop);
                    self.last_stop = Some(stop);
                }
                None => return Ok(reply),
            }
        }
    }

    /// A stop reply arriving where no command asked for one
    fn unsolicited_stop(&self, packet: &[u8]) -> Option<StopReply> {
        match packet.first() {
            Some(b'S' | b'T' | b'W' | b'X') => parser::parse_stop_reply(packet, &self.codec).ok(),
            _ => None,
        }
    }

    /// Send a command whose only successful reply is `OK`
    async fn request_ok(&mut self, command: &str) -> Result<()> {
        let reply = self.request(command).await?;
        match parser::check_error(&reply)? {
            b"OK" => Ok(()),
            b"" => Err(RspError::Unsupported(command.to_string())),
            other => Err(RspError::UnexpectedReply(String::from_utf8_lossy(other).into_owned())),
        }
    }

    /// Send a command whose reply carries data; an empty reply means unsupported
    async fn request_data(&mut self, command: &str) -> Result<Vec<u8>> {
        let reply = self.request(command).await?;
        parser::check_error(&reply)?;
        if reply.is_empty() {
            return Err(RspError::Unsupported(command.to_string()));
        }
        Ok(reply)
    }

    /// `?`
    pub async fn halt_reason(&mut self) -> Result<StopReply> {
        self.conn.send_packet(b"?").await?;
        let reply = self.conn.recv_packet().await?;
        if reply.is_empty() {
            return Err(RspError::Unsupported("?".to_string()));
        }
        let stop = parser::parse_stop_reply(&reply, &self.codec)?;
        self.last_stop = Some(stop.clone());
        Ok(stop)
    }

    pub async fn read_registers(&mut self) -> Result<RegisterMap> {
        let reply = self.request_data("g").await?;
        Ok(self.codec.unpack_registers(&reply)?)
    }

    /// Write registers in layout order up to the first one missing from `values`
    pub async fn write_registers(&mut self, values: &RegisterMap) -> Result<()> {
        let packed = self.codec.pack_registers(values);
        self.request_ok(&format!("G{}", packed)).await
    }

    pub async fn read_register(&mut self, index: usize) -> Result<u128> {
        let reply = self.request_data(&format!("p{:x}", index)).await?;
        if reply.iter().all(|&c| c == b'x' || c == b'X') {
            return Err(RspError::UnexpectedReply(format!("register {:#x} unavailable", index)));
        }
        Ok(self.codec.decode_register(&reply)?)
    }

    pub async fn write_register(&mut self, index: usize, value: u128) -> Result<()> {
        let register = self
            .codec
            .layout()
            .by_index(index)
            .ok_or_else(|| RspError::UnknownRegister(format!("{:#x}", index)))?;
        let encoded = self.codec.encode_register(register, value);
        self.request_ok(&format!("P{:x}={}", index, encoded)).await
    }

    /// Read the register named `name` in the layout
    pub async fn read_register_by_name(&mut self, name: &str) -> Result<u128> {
        let index = self
            .codec
            .layout()
            .by_name(name)
            .map(|register| register.wire_index)
            .ok_or_else(|| RspError::UnknownRegister(name.to_string()))?;
        self.read_register(index).await
    }

    /// Read `length` bytes, split into requests that fit the packet size.
    ///
    /// A short reply ends the read early with the bytes received so far.
    pub async fn read_memory(&mut self, address: u64, length: usize) -> Result<Vec<u8>> {
        let chunk = (self.packet_size() / 2).max(1);
        let mut data = Vec::with_capacity(length);

        while data.len() < length {
            let want = chunk.min(length - data.len());
            let at = address.wrapping_add(data.len() as u64);
            let reply = self.request_data(&format!("m{:x},{:x}", at, want)).await?;
            let bytes = codec::decode_hex(&reply)?;

            let short = bytes.len() < want;
            data.extend_from_slice(&bytes);
            if short {
                log::debug!("Short memory read at {:#x}: {} of {} bytes", at, bytes.len(), want);
                break;
            }
        }

        Ok(data)
    }

    pub async fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let chunk = (self.packet_size().saturating_sub(WRITE_HEADER_RESERVE) / 2).max(1);

        for (i, part) in data.chunks(chunk).enumerate() {
            let at = address.wrapping_add((i * chunk) as u64);
            let command = format!("M{:x},{:x}:{}", at, part.len(), codec::encode_hex(part));
            self.request_ok(&command).await?;
        }
        Ok(())
    }

    pub async fn set_breakpoint(&mut self, kind: BreakpointKind, address: u64) -> Result<()> {
        let length_hint = self.config.breakpoint_kind;
        self.request_ok(&format!("Z{},{:x},{:x}", kind.z_type(), address, length_hint))
            .await?;
        self.breakpoints.insert(BreakpointRecord {
            kind,
            address,
            length_hint,
        });
        Ok(())
    }

    pub async fn remove_breakpoint(&mut self, kind: BreakpointKind, address: u64) -> Result<()> {
        let length_hint = self
            .breakpoints
            .get(kind, address)
            .map(|record| record.length_hint)
            .unwrap_or(self.config.breakpoint_kind);
        self.request_ok(&format!("z{},{:x},{:x}", kind.z_type(), address, length_hint))
            .await?;
        self.breakpoints.remove(kind, address);
        Ok(())
    }

    /// Send `c` without waiting for the target to stop
    pub async fn resume(&mut self) -> Result<()> {
        self.conn.send_packet(b"c").await
    }

    /// Continue and wait for the next stop reply. May wait forever.
    pub async fn continue_exec(&mut self) -> Result<StopReply> {
        self.resume().await?;
        self.wait_for_stop().await
    }

    /// Continue from `address`
    pub async fn continue_at(&mut self, address: u64) -> Result<StopReply> {
        self.conn.send_packet(format!("c{:x}", address).as_bytes()).await?;
        self.wait_for_stop().await
    }

    pub async fn step_instruction(&mut self) -> Result<StopReply> {
        self.conn.send_packet(b"s").await?;
        self.wait_for_stop().await
    }

    /// Read packets until a stop reply arrives, logging console output
    pub async fn wait_for_stop(&mut self) -> Result<StopReply> {
        loop {
            let reply = self.conn.recv_packet().await?;
            if let Some(text) = parser::parse_console_output(&reply) {
                log::info!("Target output: {}", text.trim_end());
                continue;
            }

            let stop = parser::parse_stop_reply(&reply, &self.codec)?;
            log::debug!("Target stopped: {}", stop);
            self.last_stop = Some(stop.clone());
            return Ok(stop);
        }
    }

    /// Write the raw interrupt byte
    pub async fn send_interrupt(&self) -> Result<()> {
        self.conn.send_interrupt().await
    }

    /// Interrupt a running target and wait for it to report the stop
    pub async fn interrupt(&mut self) -> Result<StopReply> {
        self.send_interrupt().await?;
        self.wait_for_stop().await
    }

    /// Handle for interrupting from another task while `continue_exec` runs
    pub fn interrupt_handle(&self) -> InterruptHandle<S> {
        self.conn.interrupt_handle()
    }

    /// `H<op><tid>`
    pub async fn set_thread(&mut self, op: u8, thread: ThreadId) -> Result<()> {
        self.request_ok(&format!("H{}{}", op as char, thread)).await?;
        if op == b'g' {
            self.current_thread = thread;
        }
        Ok(())
    }

    /// List thread ids, falling back to the legacy `qL` protocol.
    ///
    /// Empty when the stub supports neither.
    pub async fn list_threads(&mut self) -> Result<Vec<ThreadId>> {
        let reply = self.request("qfThreadInfo").await?;
        if reply.is_empty() {
            return self.list_threads_legacy().await;
        }

        let mut threads = Vec::new();
        let (mut batch, mut done) = parser::parse_thread_list(parser::check_error(&reply)?)?;
        loop {
            threads.append(&mut batch);
            if done {
                break;
            }
            let reply = self.request_data("qsThreadInfo").await?;
            (batch, done) = parser::parse_thread_list(&reply)?;
        }

        Ok(threads)
    }

    async fn list_threads_legacy(&mut self) -> Result<Vec<ThreadId>> {
        let mut threads = Vec::new();
        let mut first = true;
        let mut next = ThreadId::ANY;

        loop {
            let command = format!(
                "qL{}{:02x}{:016x}",
                if first { 1 } else { 0 },
                LEGACY_THREAD_BATCH,
                next.0.max(0)
            );
            let reply = self.request(&command).await?;
            if reply.is_empty() {
                log::debug!("Stub reports no thread list");
                return Ok(threads);
            }

            let batch = parser::parse_legacy_thread_list(parser::check_error(&reply)?)?;
            threads.extend_from_slice(&batch.threads);
            if batch.done || batch.threads.is_empty() {
                return Ok(threads);
            }
            first = false;
            next = batch.next;
        }
    }

    /// Fetch a `qXfer` object in packet-sized pages
    pub async fn fetch_paged(&mut self, object: &str, annex: &str) -> Result<Vec<u8>> {
        // Worst case every byte is escaped, plus the `m`/`l` prefix.
        let page = ((self.packet_size() - 1) / 2).max(1);
        let mut data = Vec::new();

        loop {
            let command = format!("qXfer:{}:read:{}:{:x},{:x}", object, annex, data.len(), page);
            let reply = self.request_data(&command).await?;
            let (chunk, last) = parser::parse_xfer_chunk(&reply)?;

            let short = chunk.len() < page;
            data.extend_from_slice(&chunk);
            if last || short {
                return Ok(data);
            }
        }
    }

    /// Target description XML
    pub async fn target_description(&mut self) -> Result<String> {
        let data = self.fetch_paged("features", "target.xml").await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Memory map XML
    pub async fn memory_map(&mut self) -> Result<String> {
        let data = self.fetch_paged("memory-map", "").await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Signals the stub may deliver to the program without stopping
    pub async fn pass_signals(&mut self, signals: &[u8]) -> Result<()> {
        let list: Vec<String> = signals.iter().map(|s| format!("{:x}", s)).collect();
        self.request_ok(&format!("QPassSignals:{}", list.join(";"))).await
    }

    /// Tell the stub no symbol lookups will be served
    pub async fn symbol_lookup_done(&mut self) -> Result<()> {
        let reply = self.request("qSymbol::").await?;
        match parser::check_error(&reply)? {
            b"OK" | b"" => Ok(()),
            other => {
                log::debug!("Ignoring symbol request: {}", String::from_utf8_lossy(other));
                Ok(())
            }
        }
    }

    /// Release the target and let it run free
    pub async fn detach(&mut self) -> Result<()> {
        let result = self.request_ok("D").await;
        self.state = ClientState::Disconnected;
        self.breakpoints = BreakpointSet::new();
        result
    }

    /// Kill the target. Stubs may close the connection without replying.
    pub async fn kill(&mut self) -> Result<()> {
        self.conn.send_packet(b"k").await?;
        self.state = ClientState::Disconnected;
        self.breakpoints = BreakpointSet::new();
        Ok(())
    }
}
