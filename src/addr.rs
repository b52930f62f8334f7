//! Listen-specification parsing and listener setup.
//!
//! A specification has the shape `scheme://address[?reuseport=bool]` with
//! schemes `tcp`, `tcp4`, `tcp6`, `udp`, `udp4`, `udp6` and `unix`. A
//! `-net` suffix (`tcp-net://…`) forces the platform's default blocking
//! listener and routes the whole serve call through the blocking backend
//! instead of the poller.

use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use socket2::{Domain, Protocol, Socket, Type};

use crate::conn::EndpointAddr;
use crate::error::{Error, Result};

const LISTEN_BACKLOG: i32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
}

impl Network {
    fn from_scheme(scheme: &str) -> Option<Network> {
        Some(match scheme {
            "tcp" => Network::Tcp,
            "tcp4" => Network::Tcp4,
            "tcp6" => Network::Tcp6,
            "udp" => Network::Udp,
            "udp4" => Network::Udp4,
            "udp6" => Network::Udp6,
            "unix" => Network::Unix,
            _ => return None,
        })
    }

    pub(crate) fn is_udp(self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
    }

    pub(crate) fn is_unix(self) -> bool {
        self == Network::Unix
    }
}

/// One parsed listen specification, not yet bound.
#[derive(Debug, Clone)]
pub(crate) struct ListenSpec {
    pub network: Network,
    pub addr: String,
    pub reuse_port: bool,
    /// `-net` suffix: use the blocking stdlib backend.
    pub stdlib: bool,
}

/// Parses every specification up front so that `serve` fails before any
/// socket is opened when one of them is bad.
pub(crate) fn resolve(specs: &[&str]) -> Result<Vec<ListenSpec>> {
    if specs.is_empty() {
        return Err(Error::InvalidAddress("no address specified".into()));
    }
    specs.iter().map(|s| parse_spec(s)).collect()
}

fn parse_spec(spec: &str) -> Result<ListenSpec> {
    let (scheme, rest) = spec
        .split_once("://")
        .ok_or_else(|| Error::InvalidAddress(format!("{spec}: missing scheme")))?;
    let (scheme, stdlib) = match scheme.strip_suffix("-net") {
        Some(base) => (base, true),
        None => (scheme, false),
    };
    let network = Network::from_scheme(scheme)
        .ok_or_else(|| Error::InvalidAddress(format!("{spec}: unknown scheme {scheme:?}")))?;

    let (addr, query) = match rest.split_once('?') {
        Some((a, q)) => (a, Some(q)),
        None => (rest, None),
    };
    let mut reuse_port = false;
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some((k, v)) = pair.split_once('=') {
                if k == "reuseport" {
                    reuse_port = v
                        .parse::<bool>()
                        .map_err(|_| Error::InvalidAddress(format!("{spec}: bad reuseport value")))?;
                }
            }
        }
    }
    Ok(ListenSpec {
        network,
        addr: addr.to_string(),
        reuse_port,
        stdlib,
    })
}

/// Resolves the host:port part of a spec to one socket address matching
/// the requested family. An empty host means the unspecified address.
pub(crate) fn resolve_ip(network: Network, addr: &str) -> Result<SocketAddr> {
    // an empty address means any interface, ephemeral port
    let candidate;
    let addr = if addr.is_empty() || addr.starts_with(':') {
        let port = if addr.is_empty() { ":0" } else { addr };
        candidate = match network {
            Network::Tcp6 | Network::Udp6 => format!("[::]{port}"),
            _ => format!("0.0.0.0{port}"),
        };
        candidate.as_str()
    } else {
        addr
    };
    let mut resolved = addr
        .to_socket_addrs()
        .map_err(|e| Error::InvalidAddress(format!("{addr}: {e}")))?;
    let pick = match network {
        Network::Tcp4 | Network::Udp4 => resolved.find(SocketAddr::is_ipv4),
        Network::Tcp6 | Network::Udp6 => resolved.find(SocketAddr::is_ipv6),
        _ => resolved.next(),
    };
    pick.ok_or_else(|| Error::InvalidAddress(format!("{addr}: no address for family")))
}

/// A bound listener for the polling backend.
pub(crate) enum ListenerSocket {
    Tcp(mio::net::TcpListener),
    Udp(mio::net::UdpSocket),
    Unix(mio::net::UnixListener),
}

pub(crate) struct Listener {
    pub socket: ListenerSocket,
    pub network: Network,
    pub local: EndpointAddr,
    pub unix_path: Option<PathBuf>,
}

/// Opens one non-blocking listener per specification. All of them must
/// succeed; on the first failure the already-opened sockets are dropped
/// and their unix paths unlinked, so startup is atomic.
pub(crate) fn open_listeners(specs: &[ListenSpec]) -> Result<Vec<Listener>> {
    let mut out = Vec::with_capacity(specs.len());
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
        // a stale socket file from a previous run would fail the bind
        let _ = fs::remove_file(&path);
        let std_listener = std::os::unix::net::UnixListener::bind(&path)?;
        std_listener.set_nonblocking(true)?;
        let listener = mio::net::UnixListener::from_std(std_listener);
        return Ok(Listener {
            socket: ListenerSocket::Unix(listener),
            network: spec.network,
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
        socket.set_nonblocking(true)?;
        let std_socket: std::net::UdpSocket = socket.into();
        let local = std_socket.local_addr()?;
        let socket = mio::net::UdpSocket::from_std(std_socket);
        Ok(Listener {
            socket: ListenerSocket::Udp(socket),
            network: spec.network,
            local: local.into(),
            unix_path: None,
        })
    } else {
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        apply_reuse(&socket, spec.reuse_port)?;
        socket.bind(&sa.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        let std_listener: std::net::TcpListener = socket.into();
        let local = std_listener.local_addr()?;
        let listener = mio::net::TcpListener::from_std(std_listener);
        Ok(Listener {
            socket: ListenerSocket::Tcp(listener),
            network: spec.network,
            local: local.into(),
            unix_path: None,
        })
    }
}

pub(crate) fn apply_reuse(socket: &Socket, reuse_port: bool) -> Result<()> {
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_address_and_query() {
        let specs = resolve(&["tcp://:8080?reuseport=true", "unix:///tmp/weir.sock"]).unwrap();
        assert_eq!(specs[0].network, Network::Tcp);
        assert_eq!(specs[0].addr, ":8080");
        assert!(specs[0].reuse_port);
        assert!(!specs[0].stdlib);
        assert_eq!(specs[1].network, Network::Unix);
        assert_eq!(specs[1].addr, "/tmp/weir.sock");
    }

    #[test]
    fn net_suffix_selects_stdlib_backend() {
        let specs = resolve(&["tcp-net://127.0.0.1:0"]).unwrap();
        assert!(specs[0].stdlib);
        assert_eq!(specs[0].network, Network::Tcp);
    }

    #[test]
    fn rejects_unknown_scheme_and_empty_input() {
        assert!(matches!(
            resolve(&["smtp://:25"]),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(resolve(&[]), Err(Error::InvalidAddress(_))));
        assert!(matches!(
            resolve(&["no-scheme-here"]),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn empty_address_means_ephemeral_any() {
        let specs = resolve(&["tcp://"]).unwrap();
        let sa = resolve_ip(specs[0].network, &specs[0].addr).unwrap();
        assert_eq!(sa.port(), 0);
    }

    #[test]
    fn resolves_empty_host_per_family() {
        let v4 = resolve_ip(Network::Tcp4, ":9000").unwrap();
        assert!(v4.is_ipv4());
        assert_eq!(v4.port(), 9000);
        let v6 = resolve_ip(Network::Tcp6, ":9000").unwrap();
        assert!(v6.is_ipv6());
    }

    #[test]
    fn listener_binds_ephemeral_port() {
        let specs = resolve(&["tcp://127.0.0.1:0"]).unwrap();
        let listeners = open_listeners(&specs).unwrap();
        let addr = listeners[0].local.socket_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }
}
