//! The multi-loop reactor core.
//!
//! `serve` opens every listener up front, spins up one OS thread per
//! event loop, and hands each accepted connection to exactly one loop
//! chosen by the load balancer. A connection is owned by that loop for
//! its whole life: callbacks for it always run there, so no lock guards
//! connection state. The only cross-thread path is the poller's note
//! queue, used for connection hand-off and the shutdown broadcast.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use mio::{Events as PollEvents, Token};
use socket2::{SockRef, TcpKeepalive};
use tracing::{debug, trace, warn};

use crate::addr::{open_listeners, ListenSpec, Listener, ListenerSocket};
use crate::balance::Balancer;
use crate::conn::{Action, Conn, ConnState, EndpointAddr, StreamSocket};
use crate::error::Result;
use crate::events::{EngineConfig, Events, ServerInfo};
use crate::poll::{Notifier, Poller, WAKE_TOKEN};

const EVENTS_CAPACITY: usize = 1024;
const READ_BUFFER_SIZE: usize = 64 * 1024;
/// Connection tokens start above any plausible listener count.
const FIRST_CONN_TOKEN: usize = 4096;

/// Cross-thread work items delivered through a loop's note queue.
enum Note {
    /// An accepted connection assigned to this loop by the balancer.
    Register {
        socket: StreamSocket,
        local: EndpointAddr,
        remote: EndpointAddr,
    },
    Shutdown,
}

struct Shared<E> {
    events: E,
    notifiers: Vec<Notifier<Note>>,
    counts: Arc<[AtomicUsize]>,
    balancer: Balancer,
    shutdown: AtomicBool,
}

impl<E: Events> Shared<E> {
    /// First caller wins; every loop (including the caller's own) gets a
    /// shutdown note so no wait cycle outlives the request.
    fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            debug!("shutdown requested, broadcasting to all loops");
            for notifier in &self.notifiers {
                let _ = notifier.trigger(Note::Shutdown);
            }
        }
    }
}

pub(crate) fn serve<E: Events>(events: E, config: &EngineConfig, specs: &[ListenSpec]) -> Result<()> {
    let mut listeners = open_listeners(specs)?;
    let num_loops = config.resolved_loops();
    let addrs: Vec<EndpointAddr> = listeners.iter().map(|l| l.local.clone()).collect();
    let unix_paths: Vec<PathBuf> = listeners.iter().filter_map(|l| l.unix_path.clone()).collect();

    let mut pollers = Vec::with_capacity(num_loops);
    for _ in 0..num_loops {
        pollers.push(Poller::new()?);
    }
    let notifiers: Vec<Notifier<Note>> = pollers.iter().map(Poller::notifier).collect();
    let counts: Arc<[AtomicUsize]> = (0..num_loops).map(|_| AtomicUsize::new(0)).collect();
    let shared = Arc::new(Shared {
        events,
        notifiers,
        counts: Arc::clone(&counts),
        balancer: Balancer::new(config.load_balance, counts),
        shutdown: AtomicBool::new(false),
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
    debug!(loops = num_loops, listeners = addrs.len(), "engine serving");

    let mut handles = Vec::with_capacity(num_loops);
    for (id, poller) in pollers.into_iter().enumerate() {
        let loop_listeners = if id == 0 {
            mem::take(&mut listeners)
        } else {
            Vec::new()
        };
        let shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("weir-loop-{id}"))
            .spawn(move || EventLoop::new(id, poller, loop_listeners, shared).run())?;
        handles.push(handle);
    }

    let mut first_err: Option<io::Error> = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
            Err(_) => {
                if first_err.is_none() {
                    first_err = Some(io::Error::other("event loop thread panicked"));
                }
            }
        }
    }
    cleanup_unix(&unix_paths);
    match first_err {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn cleanup_unix(paths: &[PathBuf]) {
    for path in paths {
        let _ = fs::remove_file(path);
    }
}

enum FlushOutcome {
    Drained,
    Blocked,
    Failed(io::Error),
}

/// Writes as much pending output as the socket will take right now.
fn try_flush(conn: &mut Conn) -> FlushOutcome {
    while !conn.out.is_empty() {
        let Some(sock) = conn.socket.as_mut() else {
            return FlushOutcome::Drained;
        };
        match sock.write(&conn.out) {
            Ok(0) => return FlushOutcome::Failed(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                conn.out.drain(..n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return FlushOutcome::Blocked,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return FlushOutcome::Failed(e),
        }
    }
    FlushOutcome::Drained
}

struct EventLoop<E: Events> {
    id: usize,
    poller: Poller<Note>,
    listeners: Vec<Listener>,
    conns: HashMap<Token, Conn>,
    next_token: usize,
    shared: Arc<Shared<E>>,
    read_buf: Vec<u8>,
    next_tick: Option<Instant>,
}

impl<E: Events> EventLoop<E> {
    fn new(id: usize, poller: Poller<Note>, listeners: Vec<Listener>, shared: Arc<Shared<E>>) -> Self {
        Self {
            id,
            poller,
            listeners,
            conns: HashMap::new(),
            next_token: FIRST_CONN_TOKEN,
            shared,
            read_buf: vec![0; READ_BUFFER_SIZE],
            next_tick: None,
        }
    }

    fn run(mut self) -> io::Result<()> {
        for (i, listener) in self.listeners.iter_mut().enumerate() {
            match &mut listener.socket {
                ListenerSocket::Tcp(l) => self.poller.add_read(l, Token(i))?,
                ListenerSocket::Udp(s) => self.poller.add_read(s, Token(i))?,
                ListenerSocket::Unix(l) => self.poller.add_read(l, Token(i))?,
            }
        }

        let mut poll_events = PollEvents::with_capacity(EVENTS_CAPACITY);
        let mut notes: Vec<Note> = Vec::new();
        // first tick fires right after startup; tick() returning None
        // disables the schedule for good
        self.next_tick = Some(Instant::now());

        loop {
            let timeout = self
                .next_tick
                .map(|due| due.saturating_duration_since(Instant::now()));
            self.poller.wait(&mut poll_events, timeout, &mut notes)?;

            for note in notes.drain(..) {
                match note {
                    Note::Shutdown => return self.close_all(),
                    Note::Register {
                        socket,
                        local,
                        remote,
                    } => self.open_conn(socket, local, remote),
                }
            }

            for event in poll_events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                if token.0 < self.listeners.len() {
                    self.listener_ready(token.0);
                } else {
                    self.conn_ready(token, event.is_readable(), event.is_writable());
                }
            }

            if self.shared.shutdown.load(Ordering::Acquire) {
                return self.close_all();
            }

            if let Some(due) = self.next_tick {
                if Instant::now() >= due {
                    self.do_tick();
                }
            }
        }
    }

    fn do_tick(&mut self) {
        match self.shared.events.tick() {
            None => self.next_tick = None,
            Some((delay, action)) => {
                self.next_tick = Instant::now().checked_add(delay);
                if action == Action::Shutdown {
                    self.shared.request_shutdown();
                }
            }
        }
    }

    fn listener_ready(&mut self, idx: usize) {
        if self.listeners[idx].network.is_udp() {
            self.udp_ready(idx);
        } else {
            self.accept_ready(idx);
        }
    }

    fn accept_ready(&mut self, idx: usize) {
        loop {
            let accepted = match &self.listeners[idx].socket {
                ListenerSocket::Tcp(l) => l
                    .accept()
                    .map(|(s, a)| (StreamSocket::Tcp(s), EndpointAddr::from(a))),
                ListenerSocket::Unix(l) => l.accept().map(|(s, a)| {
                    let path = a.as_pathname().map(Path::to_path_buf);
                    (StreamSocket::Unix(s), EndpointAddr::Unix(path))
                }),
                ListenerSocket::Udp(_) => return,
            };
            match accepted {
                Ok((socket, remote)) => {
                    let local = self.listeners[idx].local.clone();
                    let target = self.shared.balancer.choose();
                    trace!(loop_id = self.id, assigned = target, %remote, "accepted connection");
                    if target == self.id {
                        self.open_conn(socket, local, remote);
                    } else {
                        let note = Note::Register {
                            socket,
                            local,
                            remote,
                        };
                        let _ = self.shared.notifiers[target].trigger(note);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(loop_id = self.id, "accept error: {e}");
                    break;
                }
            }
        }
    }

    fn open_conn(&mut self, socket: StreamSocket, local: EndpointAddr, remote: EndpointAddr) {
        let token = Token(self.next_token);
        self.next_token += 1;

        let mut conn = Conn::new(Some(socket), self.id, local, remote);
        let (out, opts, action) = self.shared.events.opened(&mut conn);
        conn.opts = opts;
        if let Some(period) = opts.tcp_keep_alive {
            if let Some(StreamSocket::Tcp(s)) = conn.socket.as_ref() {
                let keepalive = TcpKeepalive::new().with_time(period);
                let _ = SockRef::from(s).set_tcp_keepalive(&keepalive);
            }
        }
        if !out.is_empty() {
            conn.out.extend_from_slice(&out);
        }

        self.shared.counts[self.id].fetch_add(1, Ordering::Relaxed);
        self.conns.insert(token, conn);
        {
            let Some(conn) = self.conns.get_mut(&token) else {
                return;
            };
            let Some(sock) = conn.socket.as_mut() else {
                return;
            };
            if let Err(e) = self.poller.add_read(sock, token) {
                warn!(loop_id = self.id, "failed to register connection: {e}");
                self.finish_close(token, Some(e));
                return;
            }
        }
        self.flush(token);
        if action != Action::None {
            self.handle_action(token, action);
        }
    }

    fn conn_ready(&mut self, token: Token, readable: bool, writable: bool) {
        if writable {
            self.flush(token);
        }
        if readable {
            self.read_ready(token);
        }
    }

    fn read_ready(&mut self, token: Token) {
        // the loop's read buffer moves out while callbacks run so the
        // connection can be mutated without aliasing it
        let mut buf = mem::take(&mut self.read_buf);
        let mut fatal: Option<Option<io::Error>> = None;
        loop {
            let Some(conn) = self.conns.get_mut(&token) else {
                break;
            };
            if conn.state != ConnState::Active {
                break;
            }
            let Some(sock) = conn.socket.as_mut() else {
                break;
            };
            let n = match sock.read(&mut buf) {
                Ok(0) => {
                    fatal = Some(None);
                    break;
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    fatal = Some(Some(e));
                    break;
                }
            };
            let (out, action) = self.shared.events.data(conn, &buf[..n]);
            if !out.is_empty() {
                conn.out.extend_from_slice(&out);
            }
            let has_output = !conn.out.is_empty();
            if has_output {
                self.flush(token);
            }
            if action != Action::None {
                self.handle_action(token, action);
                break;
            }
        }
        self.read_buf = buf;
        if let Some(err) = fatal {
            self.finish_close(token, err);
        }
    }

    fn flush(&mut self, token: Token) {
        let outcome = {
            let Some(conn) = self.conns.get_mut(&token) else {
                return;
            };
            try_flush(conn)
        };
        match outcome {
            FlushOutcome::Drained => {
                let closing = self
                    .conns
                    .get(&token)
                    .is_some_and(|c| c.state == ConnState::Closing);
                if closing {
                    self.finish_close(token, None);
                } else {
                    self.demote_interest(token);
                }
            }
            FlushOutcome::Blocked => self.ensure_write_interest(token),
            FlushOutcome::Failed(e) => self.finish_close(token, Some(e)),
        }
    }

    fn ensure_write_interest(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        if conn.write_interest {
            return;
        }
        if let Some(sock) = conn.socket.as_mut() {
            if self.poller.mod_read_write(sock, token).is_ok() {
                conn.write_interest = true;
            }
        }
    }

    fn demote_interest(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        if !conn.write_interest {
            return;
        }
        if let Some(sock) = conn.socket.as_mut() {
            if self.poller.mod_read(sock, token).is_ok() {
                conn.write_interest = false;
            }
        }
    }

    fn handle_action(&mut self, token: Token, action: Action) {
        match action {
            Action::None => {}
            Action::Close => self.begin_close(token),
            Action::Shutdown => self.shared.request_shutdown(),
            Action::Detach => self.detach(token),
        }
    }

    /// Close once any queued output has been flushed; reads stop now.
    fn begin_close(&mut self, token: Token) {
        let empty = {
            let Some(conn) = self.conns.get_mut(&token) else {
                return;
            };
            conn.state = ConnState::Closing;
            conn.out.is_empty()
        };
        if empty {
            self.finish_close(token, None);
        } else {
            self.ensure_write_interest(token);
        }
    }

    fn finish_close(&mut self, token: Token, err: Option<io::Error>) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        if let Some(sock) = conn.socket.as_mut() {
            let _ = self.poller.mod_detach(sock);
        }
        self.shared.counts[self.id].fetch_sub(1, Ordering::Relaxed);
        trace!(loop_id = self.id, remote = %conn.remote, "connection closed");
        let action = self.shared.events.closed(&mut conn, err.as_ref());
        if action == Action::Shutdown {
            self.shared.request_shutdown();
        }
    }

    /// Moves the descriptor out of the loop and hands it to user code as
    /// a raw blocking stream. Pending output goes out first.
    fn detach(&mut self, token: Token) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        self.shared.counts[self.id].fetch_sub(1, Ordering::Relaxed);
        let Some(mut sock) = conn.socket.take() else {
            return;
        };
        let _ = self.poller.mod_detach(&mut sock);
        match sock.into_blocking() {
            Ok(mut stream) => {
                if !conn.out.is_empty() {
                    let _ = stream.write_all(&conn.out);
                    conn.out.clear();
                }
                debug!(loop_id = self.id, remote = %conn.remote, "connection detached");
                let action = self.shared.events.detached(&mut conn, stream);
                if action == Action::Shutdown {
                    self.shared.request_shutdown();
                }
            }
            Err(e) => {
                warn!(loop_id = self.id, "detach failed: {e}");
                let action = self.shared.events.closed(&mut conn, Some(&e));
                if action == Action::Shutdown {
                    self.shared.request_shutdown();
                }
            }
        }
    }

    fn udp_ready(&mut self, idx: usize) {
        let mut buf = mem::take(&mut self.read_buf);
        loop {
            let received = {
                let ListenerSocket::Udp(sock) = &self.listeners[idx].socket else {
                    break;
                };
                sock.recv_from(&mut buf)
            };
            match received {
                Ok((n, peer)) => {
                    let local = self.listeners[idx].local.clone();
                    // each datagram is its own pseudo-connection
                    let mut conn = Conn::new(None, self.id, local, peer.into());
                    let (out, action) = self.shared.events.data(&mut conn, &buf[..n]);
                    if !out.is_empty() {
                        if let ListenerSocket::Udp(sock) = &self.listeners[idx].socket {
                            let _ = sock.send_to(&out, peer);
                        }
                    }
                    if action == Action::Shutdown {
                        self.shared.request_shutdown();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(loop_id = self.id, "udp recv error: {e}");
                    break;
                }
            }
        }
        self.read_buf = buf;
    }

    /// Shutdown path: every owned connection is closed with no error and
    /// the loop exits its wait cycle.
    fn close_all(&mut self) -> io::Result<()> {
        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        debug!(loop_id = self.id, conns = tokens.len(), "loop shutting down");
        for token in tokens {
            self.finish_close(token, None);
        }
        Ok(())
    }
}
