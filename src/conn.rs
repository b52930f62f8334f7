use std::any::Any;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, IntoRawFd};
use std::path::PathBuf;
use std::time::Duration;

use mio::event::Source;
use mio::{Interest, Registry, Token};

/// Instruction returned by a callback to its event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Keep serving the connection.
    #[default]
    None,
    /// Close the connection once any queued output has been flushed.
    Close,
    /// Stop every loop and make `serve` return.
    Shutdown,
    /// Stop managing the descriptor and hand it to `detached`.
    Detach,
}

/// Per-connection options, set once from the `opened` callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// SO_KEEPALIVE period for TCP connections.
    pub tcp_keep_alive: Option<Duration>,
    /// Input to `data` is always a borrowed slice valid only for the
    /// duration of the call, so callbacks copy whatever they keep. This
    /// flag is advisory and does not change that contract.
    pub reuse_input_buffer: bool,
}

/// A resolved local or peer endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointAddr {
    Ip(SocketAddr),
    Unix(Option<PathBuf>),
}

impl EndpointAddr {
    /// The socket address for IP endpoints, `None` for unix sockets.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            EndpointAddr::Ip(a) => Some(*a),
            EndpointAddr::Unix(_) => None,
        }
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointAddr::Ip(a) => a.fmt(f),
            EndpointAddr::Unix(Some(p)) => p.display().fmt(f),
            EndpointAddr::Unix(None) => f.write_str("@unix"),
        }
    }
}

impl From<SocketAddr> for EndpointAddr {
    fn from(a: SocketAddr) -> Self {
        EndpointAddr::Ip(a)
    }
}

/// Lifecycle of a connection inside its owning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Active,
    /// Close requested, pending writes still flushing.
    Closing,
}

/// A non-blocking stream socket owned by one event loop.
pub(crate) enum StreamSocket {
    Tcp(mio::net::TcpStream),
    Unix(mio::net::UnixStream),
}

impl StreamSocket {
    /// Moves the descriptor out of mio's hands into a blocking stdlib
    /// stream. Used for detach; after this the engine no longer owns the
    /// descriptor's lifecycle.
    pub(crate) fn into_blocking(self) -> io::Result<DetachedStream> {
        let inner = match self {
            StreamSocket::Tcp(s) => {
                let fd = s.into_raw_fd();
                let std = unsafe { std::net::TcpStream::from_raw_fd(fd) };
                std.set_nonblocking(false)?;
                DetachedInner::Tcp(std)
            }
            StreamSocket::Unix(s) => {
                let fd = s.into_raw_fd();
                let std = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
                std.set_nonblocking(false)?;
                DetachedInner::Unix(std)
            }
        };
        Ok(DetachedStream {
            pending: Vec::new(),
            inner,
        })
    }
}

impl Read for StreamSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamSocket::Tcp(s) => s.read(buf),
            StreamSocket::Unix(s) => s.read(buf),
        }
    }
}

impl Write for StreamSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StreamSocket::Tcp(s) => s.write(buf),
            StreamSocket::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            StreamSocket::Tcp(s) => s.flush(),
            StreamSocket::Unix(s) => s.flush(),
        }
    }
}

impl Source for StreamSocket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            StreamSocket::Tcp(s) => s.register(registry, token, interests),
            StreamSocket::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            StreamSocket::Tcp(s) => s.reregister(registry, token, interests),
            StreamSocket::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            StreamSocket::Tcp(s) => s.deregister(registry),
            StreamSocket::Unix(s) => s.deregister(registry),
        }
    }
}

enum DetachedInner {
    Tcp(std::net::TcpStream),
    Unix(std::os::unix::net::UnixStream),
}

/// Raw blocking duplex stream handed to `detached` after an
/// [`Action::Detach`]. Ownership of the descriptor moves with it; the
/// engine performs no further buffering or event dispatch for it. Bytes
/// the engine had read but not yet delivered are replayed ahead of the
/// socket.
pub struct DetachedStream {
    pending: Vec<u8>,
    inner: DetachedInner,
}

impl DetachedStream {
    pub(crate) fn from_tcp(stream: std::net::TcpStream, pending: Vec<u8>) -> Self {
        Self {
            pending,
            inner: DetachedInner::Tcp(stream),
        }
    }

    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream, pending: Vec<u8>) -> Self {
        Self {
            pending,
            inner: DetachedInner::Unix(stream),
        }
    }
}

impl Read for DetachedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        match &mut self.inner {
            DetachedInner::Tcp(s) => s.read(buf),
            DetachedInner::Unix(s) => s.read(buf),
        }
    }
}

impl Write for DetachedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            DetachedInner::Tcp(s) => s.write(buf),
            DetachedInner::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            DetachedInner::Tcp(s) => s.flush(),
            DetachedInner::Unix(s) => s.flush(),
        }
    }
}

/// Connection handle passed to the [`Events`](crate::Events) callbacks.
///
/// A connection is owned exclusively by the loop that registered it; no
/// other thread ever reads or mutates it, which is what makes the
/// lock-free callback contract sound.
pub struct Conn {
    pub(crate) socket: Option<StreamSocket>,
    pub(crate) loop_id: usize,
    pub(crate) local: EndpointAddr,
    pub(crate) remote: EndpointAddr,
    pub(crate) state: ConnState,
    pub(crate) out: Vec<u8>,
    pub(crate) opts: Options,
    pub(crate) write_interest: bool,
    ctx: Option<Box<dyn Any + Send>>,
}

impl Conn {
    pub(crate) fn new(
        socket: Option<StreamSocket>,
        loop_id: usize,
        local: EndpointAddr,
        remote: EndpointAddr,
    ) -> Self {
        Self {
            socket,
            loop_id,
            local,
            remote,
            state: ConnState::Active,
            out: Vec::new(),
            opts: Options::default(),
            write_interest: false,
            ctx: None,
        }
    }

    /// Index of the event loop that owns this connection.
    pub fn loop_index(&self) -> usize {
        self.loop_id
    }

    pub fn local_addr(&self) -> &EndpointAddr {
        &self.local
    }

    pub fn remote_addr(&self) -> &EndpointAddr {
        &self.remote
    }

    /// Stores an opaque user value on the connection. The engine never
    /// inspects it.
    pub fn set_context<T: Any + Send>(&mut self, value: T) {
        self.ctx = Some(Box::new(value));
    }

    pub fn context<T: Any + Send>(&self) -> Option<&T> {
        self.ctx.as_ref()?.downcast_ref::<T>()
    }

    pub fn context_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.ctx.as_mut()?.downcast_mut::<T>()
    }

    pub fn has_context(&self) -> bool {
        self.ctx.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_opaque_and_typed() {
        let mut c = Conn::new(
            None,
            0,
            EndpointAddr::Ip("127.0.0.1:1".parse().unwrap()),
            EndpointAddr::Ip("127.0.0.1:2".parse().unwrap()),
        );
        assert!(!c.has_context());
        c.set_context(41_u32);
        assert_eq!(c.context::<u32>(), Some(&41));
        assert!(c.context::<String>().is_none());
        *c.context_mut::<u32>().unwrap() += 1;
        assert_eq!(c.context::<u32>(), Some(&42));
    }

    #[test]
    fn detached_stream_replays_pending_bytes_first() {
        let (a, mut b) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut detached = DetachedStream::from_unix(a, b"held".to_vec());
        b.write_all(b" more").unwrap();
        let mut buf = [0u8; 4];
        detached.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"held");
        let mut buf = [0u8; 5];
        detached.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b" more");
    }

    #[test]
    fn endpoint_display() {
        let a: EndpointAddr = "127.0.0.1:80".parse::<SocketAddr>().unwrap().into();
        assert_eq!(a.to_string(), "127.0.0.1:80");
        assert_eq!(EndpointAddr::Unix(None).to_string(), "@unix");
    }
}
