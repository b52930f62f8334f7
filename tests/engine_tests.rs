//! End-to-end engine tests over real sockets, covering both the polling
//! backend and the blocking `-net` backend.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use weir::{
    Action, Conn, DetachedStream, EngineConfig, Events, LoadBalance, Options, ServerInfo,
};

const GREETING: &[u8] = b"sweetness\r\n";

/// Echo server that greets on open and shuts the engine down once every
/// expected client has disconnected.
struct EchoTest {
    addr_tx: Mutex<Option<mpsc::Sender<weir::EndpointAddr>>>,
    nclients: usize,
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

impl EchoTest {
    fn new(nclients: usize) -> (Self, mpsc::Receiver<weir::EndpointAddr>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                addr_tx: Mutex::new(Some(tx)),
                nclients,
                connected: AtomicUsize::new(0),
                disconnected: AtomicUsize::new(0),
            },
            rx,
        )
    }
}

impl Events for EchoTest {
    fn serving(&self, info: &ServerInfo) -> Action {
        assert!(info.num_loops >= 1);
        if info.loop_id == 0 {
            if let Some(tx) = self.addr_tx.lock().unwrap().take() {
                let _ = tx.send(info.addrs[0].clone());
            }
        }
        Action::None
    }

    fn opened(&self, conn: &mut Conn) -> (Vec<u8>, Options, Action) {
        conn.set_context(conn.remote_addr().to_string());
        self.connected.fetch_add(1, Ordering::SeqCst);
        let opts = Options {
            tcp_keep_alive: Some(Duration::from_secs(300)),
            ..Options::default()
        };
        (GREETING.to_vec(), opts, Action::None)
    }

    fn data(&self, _conn: &mut Conn, input: &[u8]) -> (Vec<u8>, Action) {
        (input.to_vec(), Action::None)
    }

    fn closed(&self, conn: &mut Conn, _err: Option<&io::Error>) -> Action {
        assert!(conn.context::<String>().is_some());
        let done = self.disconnected.fetch_add(1, Ordering::SeqCst) + 1;
        if done == self.nclients {
            Action::Shutdown
        } else {
            Action::None
        }
    }
}

enum Client {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for Client {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Client::Tcp(s) => s.read(buf),
            Client::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Client {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Client::Tcp(s) => s.write(buf),
            Client::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Client::Tcp(s) => s.flush(),
            Client::Unix(s) => s.flush(),
        }
    }
}

fn dial(addr: &weir::EndpointAddr) -> Client {
    match addr {
        weir::EndpointAddr::Ip(sa) => Client::Tcp(TcpStream::connect(sa).unwrap()),
        weir::EndpointAddr::Unix(Some(path)) => Client::Unix(UnixStream::connect(path).unwrap()),
        weir::EndpointAddr::Unix(None) => panic!("unnamed unix listener"),
    }
}

fn run_echo_client(addr: &weir::EndpointAddr, seed: usize) {
    let mut c = dial(addr);
    let mut greeting = [0u8; GREETING.len()];
    c.read_exact(&mut greeting).unwrap();
    assert_eq!(&greeting, GREETING);

    for round in 0..4 {
        let size = 512 * (seed + 1) + 37 * round;
        let payload: Vec<u8> = (0..size).map(|i| (i * 31 + seed + round) as u8).collect();
        c.write_all(&payload).unwrap();
        let mut echoed = vec![0u8; size];
        c.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, payload);
    }
}

fn test_echo(spec: &str, nclients: usize, loops: i32, balance: LoadBalance) {
    let (events, addr_rx) = EchoTest::new(nclients);
    let config = EngineConfig::builder()
        .num_loops(loops)
        .load_balance(balance)
        .build();
    let spec = spec.to_string();
    let server = thread::spawn(move || weir::serve_with_config(events, &config, &[&spec]));

    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let clients: Vec<_> = (0..nclients)
        .map(|seed| {
            let addr = addr.clone();
            thread::spawn(move || run_echo_client(&addr, seed))
        })
        .collect();
    for c in clients {
        c.join().unwrap();
    }
    server.join().unwrap().unwrap();
}

fn unix_path(tag: &str) -> String {
    format!(
        "{}/weir-test-{}-{tag}.sock",
        std::env::temp_dir().display(),
        std::process::id()
    )
}

#[test]
fn echo_poll_tcp_single_loop() {
    test_echo("tcp://127.0.0.1:0", 4, 1, LoadBalance::Random);
}

#[test]
fn echo_poll_tcp_multi_loop() {
    test_echo("tcp://127.0.0.1:0", 6, 3, LoadBalance::LeastConnections);
    test_echo("tcp://127.0.0.1:0", 6, 2, LoadBalance::RoundRobin);
}

#[test]
fn echo_poll_unix() {
    test_echo(&format!("unix://{}", unix_path("poll")), 4, 2, LoadBalance::RoundRobin);
}

#[test]
fn echo_blocking_tcp() {
    test_echo("tcp-net://127.0.0.1:0", 4, 1, LoadBalance::Random);
    test_echo("tcp-net://127.0.0.1:0", 5, 3, LoadBalance::RoundRobin);
}

#[test]
fn echo_blocking_unix() {
    test_echo(
        &format!("unix-net://{}", unix_path("blocking")),
        4,
        2,
        LoadBalance::LeastConnections,
    );
}

struct TickTest {
    count: AtomicUsize,
}

impl Events for TickTest {
    fn tick(&self) -> Option<(Duration, Action)> {
        let n = self.count.fetch_add(1, Ordering::SeqCst);
        if n == 25 {
            Some((Duration::from_millis(10), Action::Shutdown))
        } else {
            Some((Duration::from_millis(10), Action::None))
        }
    }
}

fn test_tick(spec: &str) {
    let start = Instant::now();
    weir::serve_with_config(
        TickTest {
            count: AtomicUsize::new(0),
        },
        &EngineConfig::builder().num_loops(1).build(),
        &[spec],
    )
    .unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "ticks ran too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "ticks ran too slow: {elapsed:?}");
}

#[test]
fn tick_schedules_until_shutdown_poll() {
    test_tick("tcp://127.0.0.1:0");
}

#[test]
fn tick_schedules_until_shutdown_blocking() {
    test_tick("tcp-net://127.0.0.1:0");
}

struct ShutdownTest {
    addr_tx: Mutex<Option<mpsc::Sender<weir::EndpointAddr>>>,
    nclients: usize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    ready: AtomicBool,
}

impl Events for ShutdownTest {
    fn serving(&self, info: &ServerInfo) -> Action {
        if info.loop_id == 0 {
            if let Some(tx) = self.addr_tx.lock().unwrap().take() {
                let _ = tx.send(info.addrs[0].clone());
            }
        }
        Action::None
    }

    fn opened(&self, _conn: &mut Conn) -> (Vec<u8>, Options, Action) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        (Vec::new(), Options::default(), Action::None)
    }

    fn closed(&self, _conn: &mut Conn, _err: Option<&io::Error>) -> Action {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Action::None
    }

    fn tick(&self) -> Option<(Duration, Action)> {
        let all_in = self.opened.load(Ordering::SeqCst) == self.nclients;
        if self.ready.load(Ordering::SeqCst) && all_in {
            Some((Duration::from_millis(20), Action::Shutdown))
        } else {
            Some((Duration::from_millis(20), Action::None))
        }
    }
}

// tick-driven shutdown must close every open connection exactly once
#[test]
fn shutdown_closes_every_connection_poll() {
    let nclients = 6;
    let (tx, rx) = mpsc::channel();
    let events = std::sync::Arc::new(ShutdownTest {
        addr_tx: Mutex::new(Some(tx)),
        nclients,
        opened: AtomicUsize::new(0),
        closed: AtomicUsize::new(0),
        ready: AtomicBool::new(false),
    });
    let server_events = std::sync::Arc::clone(&events);
    let server = thread::spawn(move || {
        weir::serve_with_config(
            ArcEvents(server_events),
            &EngineConfig::builder().num_loops(2).build(),
            &["tcp://127.0.0.1:0"],
        )
    });
    let addr = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let clients: Vec<_> = (0..nclients).map(|_| dial(&addr)).collect();
    events.ready.store(true, Ordering::SeqCst);
    server.join().unwrap().unwrap();
    assert_eq!(
        events.opened.load(Ordering::SeqCst),
        events.closed.load(Ordering::SeqCst)
    );
    assert_eq!(events.closed.load(Ordering::SeqCst), nclients);
    drop(clients);
}

/// Forwards callbacks through an `Arc` so a test can keep a handle on
/// the shared counters while the server owns the `Events` value.
struct ArcEvents<E>(std::sync::Arc<E>);

impl<E: Events> Events for ArcEvents<E> {
    fn serving(&self, info: &ServerInfo) -> Action {
        self.0.serving(info)
    }
    fn opened(&self, conn: &mut Conn) -> (Vec<u8>, Options, Action) {
        self.0.opened(conn)
    }
    fn data(&self, conn: &mut Conn, input: &[u8]) -> (Vec<u8>, Action) {
        self.0.data(conn, input)
    }
    fn closed(&self, conn: &mut Conn, err: Option<&io::Error>) -> Action {
        self.0.closed(conn, err)
    }
    fn tick(&self) -> Option<(Duration, Action)> {
        self.0.tick()
    }
    fn detached(&self, conn: &mut Conn, stream: DetachedStream) -> Action {
        self.0.detached(conn, stream)
    }
}

struct UdpEcho {
    addr_tx: Mutex<Option<mpsc::Sender<weir::EndpointAddr>>>,
    done: AtomicBool,
}

impl Events for UdpEcho {
    fn serving(&self, info: &ServerInfo) -> Action {
        if info.loop_id == 0 {
            if let Some(tx) = self.addr_tx.lock().unwrap().take() {
                let _ = tx.send(info.addrs[0].clone());
            }
        }
        Action::None
    }

    fn data(&self, conn: &mut Conn, input: &[u8]) -> (Vec<u8>, Action) {
        assert!(conn.remote_addr().socket_addr().is_some());
        (input.to_vec(), Action::None)
    }

    fn tick(&self) -> Option<(Duration, Action)> {
        if self.done.load(Ordering::SeqCst) {
            Some((Duration::from_millis(10), Action::Shutdown))
        } else {
            Some((Duration::from_millis(10), Action::None))
        }
    }
}

fn test_udp_echo(spec: &str) {
    let (tx, rx) = mpsc::channel();
    let events = std::sync::Arc::new(UdpEcho {
        addr_tx: Mutex::new(Some(tx)),
        done: AtomicBool::new(false),
    });
    let server_events = std::sync::Arc::clone(&events);
    let spec = spec.to_string();
    let server =
        thread::spawn(move || weir::serve(UdpEvents(server_events), &[spec.as_str()]));

    let addr = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let sa: SocketAddr = addr.socket_addr().unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.send_to(b"ping", sa).unwrap();
    let mut buf = [0u8; 16];
    let (n, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
    events.done.store(true, Ordering::SeqCst);
    server.join().unwrap().unwrap();
}

struct UdpEvents(std::sync::Arc<UdpEcho>);

impl Events for UdpEvents {
    fn serving(&self, info: &ServerInfo) -> Action {
        self.0.serving(info)
    }
    fn data(&self, conn: &mut Conn, input: &[u8]) -> (Vec<u8>, Action) {
        self.0.data(conn, input)
    }
    fn tick(&self) -> Option<(Duration, Action)> {
        self.0.tick()
    }
}

#[test]
fn udp_echo_poll() {
    test_udp_echo("udp://127.0.0.1:0");
}

#[test]
fn udp_echo_blocking() {
    test_udp_echo("udp-net://127.0.0.1:0");
}

struct DetachTest {
    addr_tx: Mutex<Option<mpsc::Sender<weir::EndpointAddr>>>,
    expected: Vec<u8>,
    seen: Mutex<Vec<u8>>,
    done: AtomicBool,
}

impl Events for DetachTest {
    fn serving(&self, info: &ServerInfo) -> Action {
        if info.loop_id == 0 {
            if let Some(tx) = self.addr_tx.lock().unwrap().take() {
                let _ = tx.send(info.addrs[0].clone());
            }
        }
        Action::None
    }

    fn data(&self, _conn: &mut Conn, input: &[u8]) -> (Vec<u8>, Action) {
        let mut seen = self.seen.lock().unwrap();
        seen.extend_from_slice(input);
        if seen.len() >= self.expected.len() {
            assert_eq!(*seen, self.expected, "client to server stream corrupted");
            (seen.clone(), Action::Detach)
        } else {
            (Vec::new(), Action::None)
        }
    }

    fn detached(&self, _conn: &mut Conn, mut stream: DetachedStream) -> Action {
        let expected = self.expected.clone();
        thread::spawn(move || {
            let mut buf = vec![0u8; expected.len()];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(buf, expected);
            stream.write_all(&expected).unwrap();
        });
        Action::None
    }

    fn tick(&self) -> Option<(Duration, Action)> {
        if self.done.load(Ordering::SeqCst) {
            Some((Duration::from_millis(10), Action::Shutdown))
        } else {
            Some((Duration::from_millis(10), Action::None))
        }
    }
}

fn test_detach(spec: &str) {
    let mut expected = vec![0u8; 8 * 1024];
    for (i, b) in expected.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    expected.extend_from_slice(b"--detached--");

    let (tx, rx) = mpsc::channel();
    let events = std::sync::Arc::new(DetachTest {
        addr_tx: Mutex::new(Some(tx)),
        expected: expected.clone(),
        seen: Mutex::new(Vec::new()),
        done: AtomicBool::new(false),
    });
    let server_events = std::sync::Arc::clone(&events);
    let spec = spec.to_string();
    let server =
        thread::spawn(move || weir::serve(ArcEvents(server_events), &[spec.as_str()]));

    let addr = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let mut c = dial(&addr);
    // first exchange answered by the data callback at detach time
    c.write_all(&expected).unwrap();
    let mut buf = vec![0u8; expected.len()];
    c.read_exact(&mut buf).unwrap();
    assert_eq!(buf, expected);
    // second exchange served by the thread holding the detached stream
    c.write_all(&expected).unwrap();
    c.read_exact(&mut buf).unwrap();
    assert_eq!(buf, expected);

    events.done.store(true, Ordering::SeqCst);
    server.join().unwrap().unwrap();
}

#[test]
fn detach_hands_over_the_stream() {
    test_detach("tcp://127.0.0.1:0");
}

#[test]
fn detach_hands_over_the_stream_blocking() {
    test_detach("tcp-net://127.0.0.1:0");
}

struct ServingOnly;

impl Events for ServingOnly {
    fn serving(&self, _info: &ServerInfo) -> Action {
        Action::Shutdown
    }
}

#[test]
fn bad_addresses_fail_before_serving() {
    assert!(weir::serve(ServingOnly, &["tulip://howdy"]).is_err());
    assert!(weir::serve(ServingOnly, &["howdy"]).is_err());
    assert!(weir::serve(ServingOnly, &[]).is_err());
    // empty address is valid: any interface, ephemeral port
    weir::serve(ServingOnly, &["tcp://"]).unwrap();
}

#[test]
fn reuseport_allows_overlapping_binds() {
    let first = thread::spawn(|| weir::serve(ServingOnly, &["tcp://127.0.0.1:19943?reuseport=true"]));
    let second =
        thread::spawn(|| weir::serve(ServingOnly, &["tcp://127.0.0.1:19943?reuseport=true"]));
    first.join().unwrap().unwrap();
    second.join().unwrap().unwrap();
}
