//! Blocking stdlib backend, selected by the `-net` scheme suffix.
//!
//! Same callback contract as the polling engine, different machinery:
//! one accept thread per listener, one reader thread per connection, and
//! one dispatcher thread per event loop. Reader threads never touch
//! connection state; they forward bytes over the loop's channel, so
//! callbacks still run single-threaded on the owning loop.
//!
//! `Action::Detach` hands the descriptor over through the reader
//! thread: the dispatcher signals it, the reader stops at its next wake
//! and surrenders the stream along with any bytes read in the meantime.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tracing::{debug, trace, warn};

use crate::addr::{apply_reuse, resolve_ip, ListenSpec};
use crate::balance::Balancer;
use crate::conn::{Action, Conn, DetachedStream, EndpointAddr};
use crate::error::Result;
use crate::events::{EngineConfig, Events, ServerInfo};

const READ_BUFFER_SIZE: usize = 64 * 1024;
const LISTEN_BACKLOG: i32 = 1024;
/// Upper bound on how long a detach request waits for an idle reader.
const READER_WAKE_INTERVAL: Duration = Duration::from_millis(100);

enum BlockingListener {
    Tcp(std::net::TcpListener),
    Udp(std::net::UdpSocket),
    Unix(UnixListener),
}

struct Listener {
    socket: BlockingListener,
    local: EndpointAddr,
    unix_path: Option<PathBuf>,
}

enum BlockingStream {
    Tcp(std::net::TcpStream),
    Unix(UnixStream),
}

impl BlockingStream {
    fn try_clone(&self) -> io::Result<BlockingStream> {
        Ok(match self {
            BlockingStream::Tcp(s) => BlockingStream::Tcp(s.try_clone()?),
            BlockingStream::Unix(s) => BlockingStream::Unix(s.try_clone()?),
        })
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            BlockingStream::Tcp(s) => s.shutdown(Shutdown::Both),
            BlockingStream::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            BlockingStream::Tcp(s) => s.set_read_timeout(timeout),
            BlockingStream::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    fn into_detached(self, pending: Vec<u8>) -> DetachedStream {
        match self {
            BlockingStream::Tcp(s) => DetachedStream::from_tcp(s, pending),
            BlockingStream::Unix(s) => DetachedStream::from_unix(s, pending),
        }
    }
}

impl Read for BlockingStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BlockingStream::Tcp(s) => s.read(buf),
            BlockingStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for BlockingStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BlockingStream::Tcp(s) => s.write(buf),
            BlockingStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BlockingStream::Tcp(s) => s.flush(),
            BlockingStream::Unix(s) => s.flush(),
        }
    }
}

enum Msg {
    Open {
        id: u64,
        stream: BlockingStream,
        local: EndpointAddr,
        remote: EndpointAddr,
    },
    Data {
        id: u64,
        bytes: Vec<u8>,
    },
    Eof {
        id: u64,
        err: Option<io::Error>,
    },
    /// A reader surrendering its stream after a detach request, with any
    /// bytes it read past the last delivered `Data`.
    Detached {
        id: u64,
        stream: BlockingStream,
        pending: Vec<u8>,
    },
    Packet {
        socket: std::net::UdpSocket,
        local: EndpointAddr,
        peer: SocketAddr,
        bytes: Vec<u8>,
    },
    Shutdown,
}

/// Self-dial targets used to unblock accept and recv calls at shutdown.
enum WakeTarget {
    Tcp(SocketAddr),
    Udp(SocketAddr),
    Unix(PathBuf),
}

struct Shared<E> {
    events: E,
    senders: Mutex<Vec<Sender<Msg>>>,
    wake: Vec<WakeTarget>,
    counts: Arc<[AtomicUsize]>,
    balancer: Balancer,
    shutdown: AtomicBool,
    next_id: AtomicU64,
}

impl<E: Events> Shared<E> {
    fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            debug!("shutdown requested, waking blocking threads");
            for tx in self.senders.lock().unwrap().iter() {
                let _ = tx.send(Msg::Shutdown);
            }
            for target in &self.wake {
                match target {
                    WakeTarget::Tcp(addr) => {
                        let _ =
                            std::net::TcpStream::connect_timeout(addr, Duration::from_millis(200));
                    }
                    WakeTarget::Unix(path) => {
                        let _ = UnixStream::connect(path);
                    }
                    WakeTarget::Udp(addr) => {
                        let bind = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
                        if let Ok(sock) = std::net::UdpSocket::bind(bind) {
                            let _ = sock.send_to(&[], addr);
                        }
                    }
                }
            }
        }
    }
}

pub(crate) fn serve<E: Events>(events: E, config: &EngineConfig, specs: &[ListenSpec]) -> Result<()> {
    let listeners = open_listeners(specs)?;
    let num_loops = config.resolved_loops();
    let addrs: Vec<EndpointAddr> = listeners.iter().map(|l| l.local.clone()).collect();
    let unix_paths: Vec<PathBuf> = listeners.iter().filter_map(|l| l.unix_path.clone()).collect();
    let wake = listeners
        .iter()
        .map(|l| match (&l.socket, &l.local) {
            (BlockingListener::Udp(_), EndpointAddr::Ip(a)) => WakeTarget::Udp(wake_addr(*a)),
            (_, EndpointAddr::Ip(a)) => WakeTarget::Tcp(wake_addr(*a)),
            (_, EndpointAddr::Unix(p)) => {
                WakeTarget::Unix(p.clone().unwrap_or_default())
            }
        })
        .collect();

    let mut senders = Vec::with_capacity(num_loops);
    let mut receivers = Vec::with_capacity(num_loops);
    for _ in 0..num_loops {
        let (tx, rx) = mpsc::channel();
        senders.push(tx);
        receivers.push(rx);
    }
    let counts: Arc<[AtomicUsize]> = (0..num_loops).map(|_| AtomicUsize::new(0)).collect();
    let shared = Arc::new(Shared {
        events,
        senders: Mutex::new(senders.clone()),
        wake,
        counts: Arc::clone(&counts),
        balancer: Balancer::new(config.load_balance, counts),
        shutdown: AtomicBool::new(false),
        next_id: AtomicU64::new(1),
    });

    for loop_id in 0..num_loops {
        let info = ServerInfo {
            addrs: addrs.clone(),
            num_loops,
            loop_id,
        };
        if shared.events.serving(&info) == Action::Shutdown {
            cleanup_unix(&unix_paths);
            return Ok(());
        }
    }
    debug!(loops = num_loops, listeners = addrs.len(), "blocking backend serving");

    let mut accept_handles = Vec::with_capacity(specs.len());
    for (i, listener) in listeners.into_iter().enumerate() {
        let shared = Arc::clone(&shared);
        let senders = senders.clone();
        let handle = thread::Builder::new()
            .name(format!("weir-accept-{i}"))
            .spawn(move || accept_loop(listener, shared, senders))?;
        accept_handles.push(handle);
    }

    let mut loop_handles = Vec::with_capacity(num_loops);
    for (id, rx) in receivers.into_iter().enumerate() {
        let shared = Arc::clone(&shared);
        let tx = senders[id].clone();
        let handle = thread::Builder::new()
            .name(format!("weir-loop-{id}"))
            .spawn(move || dispatch_loop(id, rx, tx, shared))?;
        loop_handles.push(handle);
    }
    drop(senders);

    let mut panicked = false;
    for handle in loop_handles {
        panicked |= handle.join().is_err();
    }
    // loops only exit on shutdown; make sure the accept threads wake too
    shared.request_shutdown();
    for handle in accept_handles {
        panicked |= handle.join().is_err();
    }
    cleanup_unix(&unix_paths);
    if panicked {
        return Err(io::Error::other("blocking backend thread panicked").into());
    }
    Ok(())
}

/// The bound "any" address is not dialable; rewrite it to loopback.
fn wake_addr(mut addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        if addr.is_ipv6() {
            addr.set_ip(std::net::Ipv6Addr::LOCALHOST.into());
        } else {
            addr.set_ip(std::net::Ipv4Addr::LOCALHOST.into());
        }
    }
    addr
}

fn cleanup_unix(paths: &[PathBuf]) {
    for path in paths {
        let _ = fs::remove_file(path);
    }
}

fn open_listeners(specs: &[ListenSpec]) -> Result<Vec<Listener>> {
    let mut out: Vec<Listener> = Vec::with_capacity(specs.len());
    for spec in specs {
        match open_listener(spec) {
            Ok(l) => out.push(l),
            Err(e) => {
                for l in &out {
                    if let Some(path) = &l.unix_path {
                        let _ = fs::remove_file(path);
                    }
                }
                return Err(e);
            }
        }
    }
    Ok(out)
}

fn open_listener(spec: &ListenSpec) -> Result<Listener> {
    if spec.network.is_unix() {
        let path = PathBuf::from(&spec.addr);
        let _ = fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        return Ok(Listener {
            socket: BlockingListener::Unix(listener),
            local: EndpointAddr::Unix(Some(path.clone())),
            unix_path: Some(path),
        });
    }

    let sa = resolve_ip(spec.network, &spec.addr)?;
    let domain = Domain::for_address(sa);
    if spec.network.is_udp() {
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        apply_reuse(&socket, spec.reuse_port)?;
        socket.bind(&sa.into())?;
        let socket: std::net::UdpSocket = socket.into();
        let local = socket.local_addr()?;
        Ok(Listener {
            socket: BlockingListener::Udp(socket),
            local: local.into(),
            unix_path: None,
        })
    } else {
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        apply_reuse(&socket, spec.reuse_port)?;
        socket.bind(&sa.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        let listener: std::net::TcpListener = socket.into();
        let local = listener.local_addr()?;
        Ok(Listener {
            socket: BlockingListener::Tcp(listener),
            local: local.into(),
            unix_path: None,
        })
    }
}

fn accept_loop<E: Events>(listener: Listener, shared: Arc<Shared<E>>, senders: Vec<Sender<Msg>>) {
    match listener.socket {
        BlockingListener::Tcp(l) => loop {
            match l.accept() {
                Ok((stream, peer)) => {
                    if shared.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    dispatch_open(
                        &shared,
                        &senders,
                        BlockingStream::Tcp(stream),
                        listener.local.clone(),
                        peer.into(),
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if shared.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    warn!("accept error: {e}");
                }
            }
        },
        BlockingListener::Unix(l) => loop {
            match l.accept() {
                Ok((stream, peer)) => {
                    if shared.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    let remote = EndpointAddr::Unix(peer.as_pathname().map(Into::into));
                    dispatch_open(
                        &shared,
                        &senders,
                        BlockingStream::Unix(stream),
                        listener.local.clone(),
                        remote,
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if shared.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    warn!("accept error: {e}");
                }
            }
        },
        BlockingListener::Udp(socket) => {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((n, peer)) => {
                        if shared.shutdown.load(Ordering::Acquire) {
                            return;
                        }
                        let Ok(clone) = socket.try_clone() else { continue };
                        let msg = Msg::Packet {
                            socket: clone,
                            local: listener.local.clone(),
                            peer,
                            bytes: buf[..n].to_vec(),
                        };
                        let target = shared.balancer.choose();
                        if senders[target].send(msg).is_err() {
                            return;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        if shared.shutdown.load(Ordering::Acquire) {
                            return;
                        }
                        warn!("udp recv error: {e}");
                    }
                }
            }
        }
    }
}

fn dispatch_open<E: Events>(
    shared: &Shared<E>,
    senders: &[Sender<Msg>],
    stream: BlockingStream,
    local: EndpointAddr,
    remote: EndpointAddr,
) {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let target = shared.balancer.choose();
    trace!(id, assigned = target, %remote, "accepted connection");
    let _ = senders[target].send(Msg::Open {
        id,
        stream,
        local,
        remote,
    });
}

struct LoopConn {
    conn: Conn,
    writer: BlockingStream,
    detach: Sender<()>,
    detaching: bool,
    /// Bytes received between a detach request and the reader hand-off;
    /// they belong to the detached owner.
    buffered: Vec<u8>,
}

fn dispatch_loop<E: Events>(
    id: usize,
    rx: Receiver<Msg>,
    tx: Sender<Msg>,
    shared: Arc<Shared<E>>,
) {
    let mut conns: HashMap<u64, LoopConn> = HashMap::new();
    let mut next_tick = Some(Instant::now());

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        if let Some(due) = next_tick {
            if Instant::now() >= due {
                match shared.events.tick() {
                    None => next_tick = None,
                    Some((delay, action)) => {
                        next_tick = Instant::now().checked_add(delay);
                        if action == Action::Shutdown {
                            shared.request_shutdown();
                            break;
                        }
                    }
                }
            }
        }
        let msg = match next_tick {
            Some(due) => {
                match rx.recv_timeout(due.saturating_duration_since(Instant::now())) {
                    Ok(m) => m,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(m) => m,
                Err(_) => break,
            },
        };
        match msg {
            Msg::Shutdown => break,
            Msg::Open {
                id: conn_id,
                stream,
                local,
                remote,
            } => open_conn(id, conn_id, stream, local, remote, &mut conns, &tx, &shared),
            Msg::Data { id: conn_id, bytes } => {
                let Some(lc) = conns.get_mut(&conn_id) else {
                    continue;
                };
                if lc.detaching {
                    lc.buffered.extend_from_slice(&bytes);
                    continue;
                }
                let (out, action) = shared.events.data(&mut lc.conn, &bytes);
                if !out.is_empty() {
                    if let Err(e) = lc.writer.write_all(&out) {
                        close_conn(id, conn_id, &mut conns, &shared, Some(e));
                        continue;
                    }
                }
                match action {
                    Action::None => {}
                    Action::Close => close_conn(id, conn_id, &mut conns, &shared, None),
                    Action::Detach => detach_conn(id, conn_id, &mut conns, &shared),
                    Action::Shutdown => shared.request_shutdown(),
                }
            }
            Msg::Eof { id: conn_id, err } => close_conn(id, conn_id, &mut conns, &shared, err),
            Msg::Detached {
                id: conn_id,
                stream,
                pending,
            } => {
                let Some(mut lc) = conns.remove(&conn_id) else {
                    continue;
                };
                shared.counts[id].fetch_sub(1, Ordering::Relaxed);
                let mut held = mem::take(&mut lc.buffered);
                held.extend_from_slice(&pending);
                let _ = stream.set_read_timeout(None);
                trace!(loop_id = id, conn_id, "connection detached");
                let action = shared.events.detached(&mut lc.conn, stream.into_detached(held));
                if action == Action::Shutdown {
                    shared.request_shutdown();
                }
            }
            Msg::Packet {
                socket,
                local,
                peer,
                bytes,
            } => {
                let mut conn = Conn::new(None, id, local, peer.into());
                let (out, action) = shared.events.data(&mut conn, &bytes);
                if !out.is_empty() {
                    let _ = socket.send_to(&out, peer);
                }
                if action == Action::Shutdown {
                    shared.request_shutdown();
                }
            }
        }
    }

    for (_, mut lc) in conns.drain() {
        let _ = lc.writer.shutdown();
        shared.counts[id].fetch_sub(1, Ordering::Relaxed);
        let action = shared.events.closed(&mut lc.conn, None);
        if action == Action::Shutdown {
            shared.request_shutdown();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn open_conn<E: Events>(
    loop_id: usize,
    conn_id: u64,
    stream: BlockingStream,
    local: EndpointAddr,
    remote: EndpointAddr,
    conns: &mut HashMap<u64, LoopConn>,
    tx: &Sender<Msg>,
    shared: &Arc<Shared<E>>,
) {
    let mut conn = Conn::new(None, loop_id, local, remote);
    let (out, opts, action) = shared.events.opened(&mut conn);
    conn.opts = opts;
    if let Some(period) = opts.tcp_keep_alive {
        if let BlockingStream::Tcp(s) = &stream {
            let keepalive = TcpKeepalive::new().with_time(period);
            let _ = SockRef::from(s).set_tcp_keepalive(&keepalive);
        }
    }
    shared.counts[loop_id].fetch_add(1, Ordering::Relaxed);

    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            shared.counts[loop_id].fetch_sub(1, Ordering::Relaxed);
            let action = shared.events.closed(&mut conn, Some(&e));
            if action == Action::Shutdown {
                shared.request_shutdown();
            }
            return;
        }
    };
    if !out.is_empty() {
        if let Err(e) = writer.write_all(&out) {
            shared.counts[loop_id].fetch_sub(1, Ordering::Relaxed);
            let action = shared.events.closed(&mut conn, Some(&e));
            if action == Action::Shutdown {
                shared.request_shutdown();
            }
            return;
        }
    }
    let (detach_tx, detach_rx) = mpsc::channel();
    conns.insert(
        conn_id,
        LoopConn {
            conn,
            writer,
            detach: detach_tx,
            detaching: false,
            buffered: Vec::new(),
        },
    );

    match action {
        Action::None => spawn_reader(conn_id, stream, detach_rx, tx.clone()),
        Action::Close => close_conn(loop_id, conn_id, conns, shared, None),
        Action::Detach => {
            // no reader yet, so the stream hands over directly
            let Some(mut lc) = conns.remove(&conn_id) else {
                return;
            };
            shared.counts[loop_id].fetch_sub(1, Ordering::Relaxed);
            let action = shared
                .events
                .detached(&mut lc.conn, stream.into_detached(Vec::new()));
            if action == Action::Shutdown {
                shared.request_shutdown();
            }
        }
        Action::Shutdown => shared.request_shutdown(),
    }
}

/// Marks the connection detaching and signals its reader to surrender
/// the stream. A reader that already exited means the descriptor is
/// gone, so the request degrades to a close.
fn detach_conn<E: Events>(
    loop_id: usize,
    conn_id: u64,
    conns: &mut HashMap<u64, LoopConn>,
    shared: &Arc<Shared<E>>,
) {
    let Some(lc) = conns.get_mut(&conn_id) else {
        return;
    };
    if lc.detaching {
        return;
    }
    lc.detaching = true;
    if lc.detach.send(()).is_err() {
        close_conn(loop_id, conn_id, conns, shared, None);
    }
}

/// Reads from the connection until EOF, error or a detach request,
/// forwarding everything to the owning loop. Reads wake on a short
/// timeout so a detach request cannot sit unobserved while the peer is
/// idle; close still unblocks the reader through `shutdown(Both)` on
/// the shared descriptor.
fn spawn_reader(conn_id: u64, mut stream: BlockingStream, detach: Receiver<()>, tx: Sender<Msg>) {
    let reader_tx = tx.clone();
    let spawned = thread::Builder::new()
        .name(format!("weir-reader-{conn_id}"))
        .spawn(move || {
            let _ = stream.set_read_timeout(Some(READER_WAKE_INTERVAL));
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                let read = stream.read(&mut buf);
                // the detach check comes first so bytes read on this
                // wake reach the detached owner, not the loop
                if detach.try_recv().is_ok() {
                    let pending = match &read {
                        Ok(n) => buf[..*n].to_vec(),
                        Err(_) => Vec::new(),
                    };
                    let _ = reader_tx.send(Msg::Detached {
                        id: conn_id,
                        stream,
                        pending,
                    });
                    return;
                }
                match read {
                    Ok(0) => {
                        let _ = reader_tx.send(Msg::Eof {
                            id: conn_id,
                            err: None,
                        });
                        return;
                    }
                    Ok(n) => {
                        let msg = Msg::Data {
                            id: conn_id,
                            bytes: buf[..n].to_vec(),
                        };
                        if reader_tx.send(msg).is_err() {
                            return;
                        }
                    }
                    Err(ref e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        let _ = reader_tx.send(Msg::Eof {
                            id: conn_id,
                            err: Some(e),
                        });
                        return;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!("failed to spawn reader thread: {e}");
        let _ = tx.send(Msg::Eof {
            id: conn_id,
            err: Some(e),
        });
    }
}

fn close_conn<E: Events>(
    loop_id: usize,
    conn_id: u64,
    conns: &mut HashMap<u64, LoopConn>,
    shared: &Arc<Shared<E>>,
    err: Option<io::Error>,
) {
    let Some(mut lc) = conns.remove(&conn_id) else {
        return;
    };
    let _ = lc.writer.shutdown();
    shared.counts[loop_id].fetch_sub(1, Ordering::Relaxed);
    trace!(loop_id, conn_id, "connection closed");
    let action = shared.events.closed(&mut lc.conn, err.as_ref());
    if action == Action::Shutdown {
        shared.request_shutdown();
    }
}
