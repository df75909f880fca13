/// Integration tests for the remote protocol stubs
///
/// These tests run the client stub against the server stub over in-memory
/// and TCP streams, with the simulator as the backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gdbremote::*;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};

fn layout() -> RegisterLayout {
    RegisterLayout::new([("r0", 32), ("sp", 32), ("pc", 32)])
}

fn codec() -> Codec {
    Codec::new(layout(), Endian::Little)
}

fn fast_config() -> ServerConfig {
    ServerConfig {
        poll_interval_ms: 20,
        ..ServerConfig::default()
    }
}

/// Start a server session on one end of a duplex stream and return a client
/// on the other end, not yet attached
fn start<T: DebugTarget>(
    target: T,
    config: ServerConfig,
) -> (GdbClient<DuplexStream>, Arc<GdbServer<T>>, JoinHandle<Result<()>>) {
    let (local, remote) = duplex(64 * 1024);
    let server = Arc::new(GdbServer::new(target, codec(), config));

    let session_server = server.clone();
    let session = tokio::spawn(async move { session_server.serve_connection(local).await });

    let client = GdbClient::new(remote, codec(), ClientConfig::default());
    (client, server, session)
}

/// Simulator that counts breakpoint calls reaching the backend
struct CountingTarget {
    inner: SimTarget,
    sets: Arc<AtomicUsize>,
    clears: Arc<AtomicUsize>,
}

impl DebugTarget for CountingTarget {
    fn read_memory(&mut self, address: u64, length: usize) -> TargetResult<Vec<u8>> {
        self.inner.read_memory(address, length)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> TargetResult<()> {
        self.inner.write_memory(address, data)
    }

    fn read_register(&mut self, register: &RegisterDescriptor) -> TargetResult<u128> {
        self.inner.read_register(register)
    }

    fn write_register(&mut self, register: &RegisterDescriptor, value: u128) -> TargetResult<()> {
        self.inner.write_register(register, value)
    }

    fn step_instruction(&mut self) -> TargetResult<u8> {
        self.inner.step_instruction()
    }

    fn resume_execution(&mut self, stop: &StopToken) -> TargetResult<u8> {
        self.inner.resume_execution(stop)
    }

    fn set_software_breakpoint(&mut self, address: u64) -> TargetResult<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set_software_breakpoint(address)
    }

    fn clear_software_breakpoint(&mut self, address: u64) -> TargetResult<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.inner.clear_software_breakpoint(address)
    }

    fn set_hardware_breakpoint(&mut self, address: u64) -> TargetResult<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set_hardware_breakpoint(address)
    }

    fn clear_hardware_breakpoint(&mut self, address: u64) -> TargetResult<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.inner.clear_hardware_breakpoint(address)
    }

    fn current_halt_signal(&mut self) -> u8 {
        self.inner.current_halt_signal()
    }
}

#[tokio::test]
async fn test_attach_negotiates_features() {
    let target = SimTarget::new(layout()).with_offsets(SectionOffsets {
        text: 0x1000,
        data: 0x2000,
        bss: None,
    });
    let (mut client, server, session) = start(target, fast_config());

    let stop = assert_ok!(client.attach().await);
    assert_eq!(stop, StopReply::Halted(HaltReason::signal(SIGTRAP)));
    assert_eq!(client.state(), ClientState::Attached);
    assert_eq!(client.features().packet_size, Some(0x1000));
    assert_eq!(client.features().start_no_ack_mode, Some(true));
    assert_eq!(client.features().pass_signals, Some(true));

    let offsets = client.offsets().unwrap();
    assert_eq!(offsets.relocate(0x10), 0x1010);
    assert_eq!(offsets.data, 0x2000);

    assert_ok!(client.detach().await);
    assert_ok!(session.await.unwrap());
    assert_eq!(server.state(), SessionState::Shutdown);
}

#[tokio::test]
async fn test_read_memory_returns_target_bytes() {
    let mut target = SimTarget::new(layout());
    target.load(0x1000, &[0xde, 0xad, 0xbe, 0xef]);
    let (mut client, _server, session) = start(target, fast_config());

    assert_ok!(client.attach().await);
    let data = assert_ok!(client.read_memory(0x1000, 4).await);
    assert_eq!(data, vec![0xde, 0xad, 0xbe, 0xef]);

    assert_ok!(client.kill().await);
    assert_ok!(session.await.unwrap());
}

#[tokio::test]
async fn test_continue_stops_at_breakpoint() {
    let mut target = SimTarget::new(layout());
    target.set_register("pc", 0x4000);
    let (mut client, _server, session) = start(target, fast_config());

    assert_ok!(client.attach().await);
    assert_ok!(client.set_breakpoint(BreakpointKind::Software, 0x4010).await);

    let stop = assert_ok!(client.continue_exec().await);
    assert_eq!(stop.signal(), Some(SIGTRAP));

    let registers = assert_ok!(client.read_registers().await);
    assert_eq!(registers["pc"], 0x4010);
    assert_eq!(assert_ok!(client.read_register_by_name("pc").await), 0x4010);

    assert_ok!(client.kill().await);
    assert_ok!(session.await.unwrap());
}

#[tokio::test]
async fn test_breakpoints_reach_backend_once() {
    let sets = Arc::new(AtomicUsize::new(0));
    let clears = Arc::new(AtomicUsize::new(0));
    let target = CountingTarget {
        inner: SimTarget::new(layout()),
        sets: sets.clone(),
        clears: clears.clone(),
    };
    let (mut client, _server, session) = start(target, fast_config());

    assert_ok!(client.attach().await);
    for _ in 0..3 {
        assert_ok!(client.set_breakpoint(BreakpointKind::Hardware, 0x8000).await);
    }
    assert_eq!(client.breakpoints().len(), 1);
    for _ in 0..2 {
        assert_ok!(client.remove_breakpoint(BreakpointKind::Hardware, 0x8000).await);
    }
    assert!(client.breakpoints().is_empty());

    assert_ok!(client.detach().await);
    assert_ok!(session.await.unwrap());
    assert_eq!(sets.load(Ordering::SeqCst), 1);
    assert_eq!(clears.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_session_end_clears_breakpoints() {
    let sets = Arc::new(AtomicUsize::new(0));
    let clears = Arc::new(AtomicUsize::new(0));
    let target = CountingTarget {
        inner: SimTarget::new(layout()),
        sets: sets.clone(),
        clears: clears.clone(),
    };
    let (mut client, _server, session) = start(target, fast_config());

    assert_ok!(client.attach().await);
    assert_ok!(client.set_breakpoint(BreakpointKind::Software, 0x100).await);
    assert_ok!(client.set_breakpoint(BreakpointKind::Software, 0x200).await);
    drop(client);

    assert_ok!(session.await.unwrap());
    assert_eq!(sets.load(Ordering::SeqCst), 2);
    assert_eq!(clears.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_target_description_spans_several_packets() {
    let body: String = (0..600).map(|i| ["<reg/>", "#", "}", "$", "*"][i % 5]).collect();
    let xml = format!("<target version=\"1.0\">{}</target>", body);
    let target = SimTarget::new(layout()).with_target_description(xml.clone());
    let config = ServerConfig {
        packet_size: 0x100,
        ..fast_config()
    };
    let (mut client, _server, session) = start(target, config);

    assert_ok!(client.attach().await);
    assert_eq!(client.features().xfer_features_read, Some(true));
    assert!(xml.len() > 0x100 * 4);

    let fetched = assert_ok!(client.target_description().await);
    assert_eq!(fetched, xml);

    assert_ok!(client.kill().await);
    assert_ok!(session.await.unwrap());
}

#[tokio::test]
async fn test_memory_map_is_served() {
    let target = SimTarget::new(layout()).with_region(0x2000_0000, 0x8000);
    let (mut client, _server, session) = start(target, fast_config());

    assert_ok!(client.attach().await);
    assert_eq!(client.features().xfer_memory_map_read, Some(true));
    let map = assert_ok!(client.memory_map().await);
    assert!(map.contains("<memory type=\"ram\" start=\"0x20000000\" length=\"0x8000\"/>"));

    assert_ok!(client.kill().await);
    assert_ok!(session.await.unwrap());
}

#[tokio::test]
async fn test_interrupt_stops_running_target() {
    let (mut client, _server, session) = start(SimTarget::new(layout()), fast_config());
    assert_ok!(client.attach().await);

    let handle = client.interrupt_handle();
    let interrupter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.send().await
    });

    let stop = assert_ok!(client.continue_exec().await);
    assert_ok!(interrupter.await.unwrap());
    assert_eq!(stop, StopReply::Halted(HaltReason::signal(SIGINT)));

    assert_ok!(client.kill().await);
    assert_ok!(session.await.unwrap());
}

#[tokio::test]
async fn test_error_reply_keeps_session_alive() {
    let mut target = SimTarget::new(layout()).with_region(0x1000, 0x100);
    target.load(0x1000, b"ok");
    let (mut client, _server, session) = start(target, fast_config());

    assert_ok!(client.attach().await);
    let err = assert_err!(client.read_memory(0x9000, 4).await);
    assert!(matches!(err, RspError::Target(0x0e)));

    let data = assert_ok!(client.read_memory(0x1000, 2).await);
    assert_eq!(data, b"ok");

    let err = assert_err!(client.write_memory(0x9000, &[1]).await);
    assert!(matches!(err, RspError::Target(0x0e)));

    assert_ok!(client.kill().await);
    assert_ok!(session.await.unwrap());
}

#[tokio::test]
async fn test_register_and_memory_writes() {
    let (mut client, server, session) = start(SimTarget::new(layout()), fast_config());
    assert_ok!(client.attach().await);

    assert_ok!(client.write_register(2, 0x8000).await);
    assert_eq!(assert_ok!(client.read_register(2).await), 0x8000);

    let mut values = RegisterMap::new();
    values.insert("r0".to_string(), 0x11);
    values.insert("sp".to_string(), 0x2000_0000);
    assert_ok!(client.write_registers(&values).await);

    let payload: Vec<u8> = (0..=255).cycle().take(3000).collect();
    assert_ok!(client.write_memory(0x10_0000, &payload).await);
    assert_eq!(assert_ok!(client.read_memory(0x10_0000, payload.len()).await), payload);

    let stop = assert_ok!(client.step_instruction().await);
    assert_eq!(stop.signal(), Some(SIGTRAP));

    assert_ok!(client.kill().await);
    assert_ok!(session.await.unwrap());

    let target = server.target();
    let target = target.lock().unwrap();
    assert_eq!(target.register("r0"), Some(0x11));
    assert_eq!(target.register("sp"), Some(0x2000_0000));
    assert_eq!(target.register("pc"), Some(0x8004));
    assert!(target.is_killed());
}

#[tokio::test]
async fn test_unsolicited_stop_is_reported() {
    let (mut client, server, session) = start(SimTarget::new(layout()), fast_config());
    assert_ok!(client.attach().await);

    server.target().lock().unwrap().set_halt_signal(11);

    let stop = assert_ok!(
        tokio::time::timeout(Duration::from_secs(5), client.wait_for_stop())
            .await
            .unwrap()
    );
    assert_eq!(stop.signal(), Some(11));

    assert_ok!(client.kill().await);
    assert_ok!(session.await.unwrap());
}

#[tokio::test]
async fn test_stop_while_idle_does_not_shift_replies() {
    let mut target = SimTarget::new(layout());
    target.set_register("pc", 0x4010);
    target.load(0x40, b"hello");
    let (mut client, server, session) = start(target, fast_config());
    assert_ok!(client.attach().await);

    server.target().lock().unwrap().set_halt_signal(11);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let registers = assert_ok!(client.read_registers().await);
    assert_eq!(registers.get("pc"), Some(&0x4010));
    assert_eq!(client.last_stop().and_then(StopReply::signal), Some(11));

    let memory = assert_ok!(client.read_memory(0x40, 5).await);
    assert_eq!(memory, b"hello");

    assert_ok!(client.kill().await);
    assert_ok!(session.await.unwrap());
}

#[tokio::test]
async fn test_thread_listing() {
    let target = SimTarget::new(layout()).with_threads(vec![ThreadId(1), ThreadId(2), ThreadId(0x10)]);
    let (mut client, _server, session) = start(target, fast_config());

    assert_ok!(client.attach().await);
    assert_eq!(client.current_thread(), ThreadId(1));

    let threads = assert_ok!(client.list_threads().await);
    assert_eq!(threads, vec![ThreadId(1), ThreadId(2), ThreadId(0x10)]);

    assert_ok!(client.set_thread(b'g', ThreadId(2)).await);
    let stop = assert_ok!(client.step_instruction().await);
    match stop {
        StopReply::Halted(reason) => assert_eq!(reason.thread, Some(ThreadId(2))),
        other => panic!("Expected halt, got {}", other),
    }

    assert_ok!(client.pass_signals(&[0x0e]).await);
    assert_ok!(client.symbol_lookup_done().await);

    assert_ok!(client.kill().await);
    assert_ok!(session.await.unwrap());
}

/// Read one framed packet from a raw stream
async fn read_frame(stream: &mut DuplexStream) -> Vec<u8> {
    let mut frame = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        frame.push(byte[0]);
        if frame.len() >= 3 && frame[frame.len() - 3] == b'#' {
            return frame;
        }
    }
}

#[tokio::test]
async fn test_corrupted_packet_is_retransmitted() {
    let mut target = SimTarget::new(layout());
    target.load(0x1000, &[0xde, 0xad, 0xbe, 0xef]);
    let server = Arc::new(GdbServer::new(target, codec(), fast_config()));

    let (local, mut raw) = duplex(4096);
    let session_server = server.clone();
    let session = tokio::spawn(async move { session_server.serve_connection(local).await });

    let mut reply = [0u8; 1];

    raw.write_all(b"$m1000,4#00").await.unwrap();
    raw.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], b'-');

    raw.write_all(b"$m1000,4#8e").await.unwrap();
    raw.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], b'+');

    let frame = read_frame(&mut raw).await;
    assert_eq!(frame, codec::build_packet(b"deadbeef"));
    raw.write_all(b"+").await.unwrap();

    raw.write_all(&codec::build_packet(b"k")).await.unwrap();
    raw.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], b'+');

    assert_ok!(session.await.unwrap());
}

#[tokio::test]
async fn test_server_accepts_next_client_after_detach() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut target = SimTarget::new(layout());
    target.load(0x40, b"hello");
    let server = Arc::new(GdbServer::new(target, codec(), fast_config()));
    let serving = server.clone();
    let accept_loop = tokio::spawn(async move { serving.serve(listener).await });

    for _ in 0..2 {
        let mut client = assert_ok!(GdbClient::connect(addr, codec(), ClientConfig::default()).await);
        assert_ok!(client.attach().await);
        assert_eq!(assert_ok!(client.read_memory(0x40, 5).await), b"hello");
        assert_ok!(client.detach().await);
    }

    accept_loop.abort();
}
