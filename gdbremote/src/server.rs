/// Server stub
///
/// Exposes a [`DebugTarget`] to a remote debugger. One client is served at a
/// time; when it goes away the session state is dropped and the server
/// accepts the next connection.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::codec::{self, Codec};
use crate::communication::{Connection, Incoming};
use crate::config::ServerConfig;
use crate::parser::{self, Command, LegacyThreadBatch, Query};
use crate::target::{DebugTarget, StopToken, TargetError};
use crate::types::*;
use crate::{Result, RspError};

/// errno-style code for malformed requests
const EINVAL: u8 = 0x16;

pub struct GdbServer<T> {
    target: Arc<Mutex<T>>,
    codec: Codec,
    config: ServerConfig,
    state: watch::Sender<SessionState>,
}

impl<T: DebugTarget> GdbServer<T> {
    pub fn new(target: T, codec: Codec, config: ServerConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Startup);
        Self {
            target: Arc::new(Mutex::new(target)),
            codec,
            config,
            state,
        }
    }

    /// Shared handle to the backend, for inspection outside a session
    pub fn target(&self) -> Arc<Mutex<T>> {
        self.target.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("Session state {} -> {}", previous, state);
        }
    }

    fn lock_target(&self) -> Result<MutexGuard<'_, T>> {
        self.target.lock().map_err(|_| RspError::TargetPoisoned)
    }

    /// Bind the configured address and serve clients until an I/O error
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept and serve clients one at a time
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        log::info!("Listening on {}", listener.local_addr()?);

        loop {
            self.set_state(SessionState::Startup);
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true)?;
            log::info!("Client connected from {}", peer);

            match self.serve_connection(stream).await {
                Ok(()) => log::info!("Session with {} closed", peer),
                Err(e) => log::error!("Session with {} failed: {}", peer, e),
            }
        }
    }

    /// Run one session to completion over an accepted stream
    pub async fn serve_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.set_state(SessionState::RunStart);

        let conn = Connection::new(stream, self.config.max_retries, self.config.ack_timeout());
        let mut session = Session::new(self, conn);
        let result = session.run().await;
        session.teardown();

        self.set_state(SessionState::Shutdown);
        match result {
            Err(RspError::Disconnected) => Ok(()),
            other => other,
        }
    }
}

/// What to do after a command has been handled
enum Response {
    Reply(Vec<u8>),
    /// Reply `OK`, then stop acknowledging packets
    EnterNoAck,
    /// End the session, optionally sending a last reply
    Finish(Option<Vec<u8>>),
}

impl Response {
    fn ok() -> Self {
        Response::Reply(b"OK".to_vec())
    }

    fn empty() -> Self {
        Response::Reply(Vec::new())
    }

    fn text(text: impl Into<String>) -> Self {
        Response::Reply(text.into().into_bytes())
    }
}

/// Per-connection state, discarded when the client goes away
struct Session<'a, T, S> {
    server: &'a GdbServer<T>,
    conn: Connection<S>,
    /// Features the client announced
    client_features: FeatureTable,
    breakpoints: BreakpointSet,
    current_thread: ThreadId,
    /// Next index into the thread list for `qsThreadInfo`
    thread_cursor: usize,
    pass_signals: Vec<u8>,
    /// Target signal at the time of the last stop reply
    last_reported: Option<u8>,
}

impl<'a, T, S> Session<'a, T, S>
where
    T: DebugTarget,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn new(server: &'a GdbServer<T>, conn: Connection<S>) -> Self {
        Self {
            server,
            conn,
            client_features: FeatureTable::default(),
            breakpoints: BreakpointSet::new(),
            current_thread: ThreadId::ANY,
            thread_cursor: 0,
            pass_signals: Vec::new(),
            last_reported: None,
        }
    }

    fn codec(&self) -> &Codec {
        &self.server.codec
    }

    fn packet_size(&self) -> usize {
        self.server.config.packet_size.max(8)
    }

    async fn run(&mut self) -> Result<()> {
        let poll_interval = self.server.config.poll_interval();

        loop {
            let incoming = match tokio::time::timeout(poll_interval, self.conn.next_incoming()).await {
                Ok(incoming) => incoming?,
                Err(_) => {
                    if let Some(reason) = self.poll_halt()? {
                        log::info!("Target halted on its own with signal {}", reason.signal);
                        let reply = parser::format_stop_reply(&reason, self.codec());
                        self.send_reply(reply.as_bytes()).await?;
                    }
                    continue;
                }
            };

            match incoming {
                Incoming::Packet(packet) => {
                    if self.server.state() == SessionState::RunStart {
                        self.server.set_state(SessionState::Running);
                    }
                    if !self.handle_packet(&packet).await? {
                        return Ok(());
                    }
                }
                Incoming::Interrupt => {
                    // The target is already halted; report where.
                    let reason = self.halt_reason(SIGINT)?;
                    let reply = parser::format_stop_reply(&reason, self.codec());
                    self.send_reply(reply.as_bytes()).await?;
                }
                Incoming::Ack | Incoming::Nack => {}
            }
        }
    }

    /// Handle one packet; `false` ends the session
    async fn handle_packet(&mut self, packet: &[u8]) -> Result<bool> {
        let result = match parser::parse_command(packet) {
            Ok(Command::Continue(address)) => self.resume(address).await,
            Ok(command) => self.dispatch(command),
            Err(e) => Err(e),
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => match error_code(&e) {
                Some(code) => {
                    log::warn!("Command {} failed: {}", String::from_utf8_lossy(packet), e);
                    Response::text(format!("E{:02x}", code))
                }
                None => return Err(e),
            },
        };

        match response {
            Response::Reply(body) => {
                self.send_reply(&body).await?;
                Ok(true)
            }
            Response::EnterNoAck => {
                self.send_reply(b"OK").await?;
                self.conn.set_no_ack(true);
                Ok(true)
            }
            Response::Finish(body) => {
                if let Some(body) = body {
                    self.send_reply(&body).await?;
                }
                Ok(false)
            }
        }
    }

    /// Run-length encode and send, truncating to the packet size
    async fn send_reply(&mut self, body: &[u8]) -> Result<()> {
        let limit = self.packet_size();
        let mut encoded = codec::length_encode(body);
        if encoded.len() > limit {
            log::warn!("Reply of {} bytes truncated to packet size {:#x}", encoded.len(), limit);
            encoded = codec::length_encode_bounded(body, limit);
        }
        self.conn.send_packet(&encoded).await
    }

    /// A change of halt signal since the last stop reply
    fn poll_halt(&mut self) -> Result<Option<HaltReason>> {
        let Some(previous) = self.last_reported else {
            return Ok(None);
        };
        let signal = self.server.lock_target()?.current_halt_signal();
        if signal == previous {
            return Ok(None);
        }
        self.halt_reason(signal).map(Some)
    }

    /// Halt reason from the target with `signal` reported, recorded as sent
    fn halt_reason(&mut self, signal: u8) -> Result<HaltReason> {
        let mut target = self.server.lock_target()?;
        let mut reason = target.halt_reason();
        reason.signal = signal;
        if reason.thread.is_none() {
            let threads = target.threads();
            if !threads.is_empty() {
                reason.thread = Some(self.reported_thread(&threads));
            }
        }
        self.last_reported = Some(target.current_halt_signal());
        Ok(reason)
    }

    fn reported_thread(&self, threads: &[ThreadId]) -> ThreadId {
        if self.current_thread.0 > 0 {
            self.current_thread
        } else {
            threads.first().copied().unwrap_or(ThreadId::ANY)
        }
    }

    fn dispatch(&mut self, command: Command) -> Result<Response> {
        log::debug!("Dispatching {:?}", command);

        let response = match command {
            Command::HaltReason => {
                let signal = self.server.lock_target()?.current_halt_signal();
                let reason = self.halt_reason(signal)?;
                Response::text(parser::format_stop_reply(&reason, self.codec()))
            }
            Command::ReadRegisters => Response::text(self.read_registers()?),
            Command::WriteRegisters(hex) => {
                let values = self.codec().unpack_registers(&hex)?;
                let mut target = self.server.lock_target()?;
                for register in self.codec().layout().iter() {
                    if let Some(&value) = values.get(&register.name) {
                        target.write_register(register, value)?;
                    }
                }
                Response::ok()
            }
            Command::ReadRegister(index) => {
                let register = self.register(index)?;
                let value = self.server.lock_target()?.read_register(register)?;
                Response::text(self.codec().encode_register(register, value))
            }
            Command::WriteRegister { index, value } => {
                let register = self.register(index)?;
                let value = self.codec().decode_register(&value)?;
                self.server.lock_target()?.write_register(register, value)?;
                Response::ok()
            }
            Command::Continue(_) => {
                return Err(RspError::Parse("continue outside the resume path".to_string()))
            }
            Command::Step(address) => {
                if let Some(address) = address {
                    self.set_pc(address)?;
                }
                let signal = self.server.lock_target()?.step_instruction()?;
                let reason = self.halt_reason(signal)?;
                Response::text(parser::format_stop_reply(&reason, self.codec()))
            }
            Command::ReadMemory { address, length } => {
                // Hex doubles the size; never read more than one reply can carry.
                let length = length.min(self.packet_size() / 2);
                let data = self.server.lock_target()?.read_memory(address, length)?;
                Response::text(codec::encode_hex(&data))
            }
            Command::WriteMemory { address, data } => {
                self.server.lock_target()?.write_memory(address, &data)?;
                Response::ok()
            }
            Command::InsertBreakpoint { z_type, address, kind } => {
                match BreakpointKind::from_z_type(z_type) {
                    Some(bp_kind) => self.insert_breakpoint(bp_kind, address, kind)?,
                    None => Response::empty(),
                }
            }
            Command::RemoveBreakpoint { z_type, address, .. } => {
                match BreakpointKind::from_z_type(z_type) {
                    Some(bp_kind) => self.remove_breakpoint(bp_kind, address)?,
                    None => Response::empty(),
                }
            }
            Command::SetThread { op, thread } => {
                log::debug!("H{} thread {}", op as char, thread);
                self.current_thread = thread;
                Response::ok()
            }
            Command::ThreadAlive(thread) => {
                let threads = self.server.lock_target()?.threads();
                if threads.is_empty() || threads.contains(&thread) {
                    Response::ok()
                } else {
                    return Err(TargetError::Other(format!("no thread {}", thread)).into());
                }
            }
            Command::Detach => {
                log::info!("Client detached");
                self.teardown();
                self.server.lock_target()?.run_free();
                Response::Finish(Some(b"OK".to_vec()))
            }
            Command::Kill => {
                log::info!("Client killed the target");
                if let Err(e) = self.server.lock_target()?.kill() {
                    log::warn!("Target kill failed: {}", e);
                }
                Response::Finish(None)
            }
            Command::Query(query) => self.query(query)?,
            Command::Unsupported(packet) => {
                log::warn!("Unsupported command: {}", packet);
                Response::empty()
            }
        };

        Ok(response)
    }

    fn query(&mut self, query: Query) -> Result<Response> {
        let response = match query {
            Query::Supported(features) => {
                for feature in &features {
                    self.client_features.record(feature);
                }
                self.client_features.supported = true;
                log::debug!("Client features: {:?}", self.client_features);
                Response::text(self.supported_features()?.to_reply())
            }
            Query::Xfer { object, annex, offset, length } => self.xfer(&object, &annex, offset, length)?,
            Query::CurrentThread => {
                let threads = self.server.lock_target()?.threads();
                Response::text(format!("QC{}", self.reported_thread(&threads)))
            }
            Query::ThreadInfoFirst => {
                self.thread_cursor = 0;
                self.thread_page()?
            }
            Query::ThreadInfoNext => self.thread_page()?,
            Query::LegacyThreadList { first, max, next } => {
                let threads = self.server.lock_target()?.threads();
                let start = if first {
                    0
                } else {
                    threads.iter().position(|&t| t == next).map_or(threads.len(), |i| i + 1)
                };
                let batch: Vec<ThreadId> = threads.iter().skip(start).take(max).copied().collect();
                let done = start + batch.len() >= threads.len();
                let next = batch.last().copied().unwrap_or(next);
                Response::text(parser::format_legacy_thread_list(&LegacyThreadBatch {
                    threads: batch,
                    done,
                    next,
                }))
            }
            Query::TraceStatus => Response::text("T0"),
            Query::Attached => Response::text("1"),
            Query::Offsets => {
                let offsets = self.server.lock_target()?.section_offsets();
                Response::text(format!(
                    "Text={:x};Data={:x};Bss={:x}",
                    offsets.text,
                    offsets.data,
                    offsets.bss.unwrap_or(offsets.data)
                ))
            }
            Query::Symbol => Response::ok(),
            Query::StartNoAckMode => {
                if self.server.config.no_ack_mode {
                    Response::EnterNoAck
                } else {
                    Response::empty()
                }
            }
            Query::PassSignals(signals) => {
                log::debug!("Passing signals {:?}", signals);
                self.pass_signals = signals;
                Response::ok()
            }
        };

        Ok(response)
    }

    fn supported_features(&self) -> Result<FeatureTable> {
        let target = self.server.lock_target()?;
        Ok(FeatureTable {
            supported: true,
            packet_size: Some(self.packet_size()),
            multiprocess: None,
            start_no_ack_mode: Some(self.server.config.no_ack_mode),
            xfer_memory_map_read: Some(target.memory_map().is_some()),
            xfer_features_read: Some(target.target_description().is_some()),
            pass_signals: Some(true),
        })
    }

    fn register(&self, index: usize) -> Result<&'a RegisterDescriptor> {
        let server: &'a GdbServer<T> = self.server;
        server
            .codec
            .layout()
            .by_index(index)
            .ok_or_else(|| TargetError::InvalidRegister(format!("{:#x}", index)).into())
    }

    fn read_registers(&self) -> Result<String> {
        let mut target = self.server.lock_target()?;
        let mut hex = String::with_capacity(self.codec().layout().total_hex_len());

        for register in self.codec().layout().iter() {
            match target.read_register(register) {
                Ok(value) => hex.push_str(&self.codec().encode_register(register, value)),
                Err(TargetError::InvalidRegister(_)) => hex.push_str(&"xx".repeat(register.byte_len())),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(hex)
    }

    fn set_pc(&self, address: u64) -> Result<()> {
        let pc = self
            .codec()
            .layout()
            .program_counter()
            .ok_or_else(|| TargetError::InvalidRegister("pc".to_string()))?;
        self.server.lock_target()?.write_register(pc, u128::from(address))?;
        Ok(())
    }

    fn insert_breakpoint(&mut self, kind: BreakpointKind, address: u64, length_hint: u64) -> Result<Response> {
        if self.breakpoints.contains(kind, address) {
            return Ok(Response::ok());
        }
        if self.breakpoints.conflicts(kind, address) {
            return Err(TargetError::BreakpointConflict(address).into());
        }

        {
            let mut target = self.server.lock_target()?;
            match kind {
                BreakpointKind::Software => target.set_software_breakpoint(address)?,
                BreakpointKind::Hardware => target.set_hardware_breakpoint(address)?,
            }
        }
        log::debug!("{} breakpoint set at {:#x}", kind, address);
        self.breakpoints.insert(BreakpointRecord {
            kind,
            address,
            length_hint,
        });
        Ok(Response::ok())
    }

    fn remove_breakpoint(&mut self, kind: BreakpointKind, address: u64) -> Result<Response> {
        if !self.breakpoints.contains(kind, address) {
            return Ok(Response::ok());
        }

        {
            let mut target = self.server.lock_target()?;
            match kind {
                BreakpointKind::Software => target.clear_software_breakpoint(address)?,
                BreakpointKind::Hardware => target.clear_hardware_breakpoint(address)?,
            }
        }
        log::debug!("{} breakpoint cleared at {:#x}", kind, address);
        self.breakpoints.remove(kind, address);
        Ok(Response::ok())
    }

    /// Serve one `qXfer` page, shortened so the escaped data fits a packet
    fn xfer(&self, object: &str, annex: &str, offset: usize, length: usize) -> Result<Response> {
        let document = {
            let target = self.server.lock_target()?;
            match object {
                "features" if annex == "target.xml" => target.target_description(),
                "features" => None,
                "memory-map" => target.memory_map(),
                _ => {
                    log::warn!("Unsupported qXfer object: {}", object);
                    return Ok(Response::empty());
                }
            }
        };

        let Some(document) = document else {
            return Ok(Response::text("E00"));
        };
        let data = document.as_bytes();
        if offset >= data.len() {
            return Ok(Response::text("l"));
        }

        let budget = self.packet_size() - 1;
        let mut escaped = 0;
        let mut taken = 0;
        for &b in data[offset..].iter().take(length) {
            if escaped + codec::escaped_len(b) > budget {
                break;
            }
            escaped += codec::escaped_len(b);
            taken += 1;
        }

        let end = offset + taken;
        let mut reply = Vec::with_capacity(escaped + 1);
        reply.push(if end >= data.len() { b'l' } else { b'm' });
        reply.extend_from_slice(&codec::escape_binary(&data[offset..end]));
        Ok(Response::Reply(reply))
    }

    /// Thread ids from the cursor onwards, as many as fit one reply
    fn thread_page(&mut self) -> Result<Response> {
        let threads = self.server.lock_target()?.threads();
        if self.thread_cursor >= threads.len() {
            return Ok(Response::text("l"));
        }

        let budget = self.packet_size() - 1;
        let mut reply = String::from("m");
        for thread in &threads[self.thread_cursor..] {
            let id = thread.to_string();
            let needed = if reply.len() > 1 { id.len() + 1 } else { id.len() };
            if reply.len() + needed > budget && reply.len() > 1 {
                break;
            }
            if reply.len() > 1 {
                reply.push(',');
            }
            reply.push_str(&id);
            self.thread_cursor += 1;
        }

        Ok(Response::text(reply))
    }

    /// Resume the target on a blocking thread while watching the socket for
    /// an interrupt
    async fn resume(&mut self, address: Option<u64>) -> Result<Response> {
        if let Some(address) = address {
            self.set_pc(address)?;
        }

        let stop = StopToken::new();
        let token = stop.clone();
        let target = self.server.target.clone();
        let pass_signals = self.pass_signals.clone();

        let mut task = tokio::task::spawn_blocking(move || -> Result<u8> {
            let mut target = target.lock().map_err(|_| RspError::TargetPoisoned)?;
            loop {
                let signal = target.resume_execution(&token)?;
                if pass_signals.contains(&signal) && !token.is_stop_requested() {
                    log::debug!("Passing signal {} to the program", signal);
                    continue;
                }
                return Ok(signal);
            }
        });

        let signal = loop {
            tokio::select! {
                joined = &mut task => {
                    break joined.map_err(|e| RspError::TargetTask(e.to_string()))??;
                }
                incoming = self.conn.next_incoming() => match incoming {
                    Ok(Incoming::Interrupt) => {
                        log::info!("Interrupt received while the target runs");
                        stop.request_stop();
                    }
                    Ok(Incoming::Packet(packet)) => {
                        log::warn!(
                            "Ignoring packet while the target runs: {}",
                            String::from_utf8_lossy(&packet)
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        stop.request_stop();
                        let _ = task.await;
                        return Err(e);
                    }
                }
            }
        };

        let reason = self.halt_reason(signal)?;
        Ok(Response::text(parser::format_stop_reply(&reason, self.codec())))
    }

    /// Clear every breakpoint this session installed
    fn teardown(&mut self) {
        if self.breakpoints.is_empty() {
            return;
        }

        let Ok(mut target) = self.server.lock_target() else {
            log::error!("Cannot clear breakpoints, target lock poisoned");
            return;
        };
        for record in self.breakpoints.drain() {
            let cleared = match record.kind {
                BreakpointKind::Software => target.clear_software_breakpoint(record.address),
                BreakpointKind::Hardware => target.clear_hardware_breakpoint(record.address),
            };
            if let Err(e) = cleared {
                log::warn!("Failed to clear breakpoint at {:#x}: {}", record.address, e);
            }
        }
    }
}

/// The `E` code for errors that leave the session usable
fn error_code(error: &RspError) -> Option<u8> {
    match error {
        RspError::Backend(e) => Some(e.code()),
        RspError::Parse(_) | RspError::Framing(_) | RspError::UnknownRegister(_) => Some(EINVAL),
        RspError::TargetTask(_) => Some(0x01),
        _ => None,
    }
}
