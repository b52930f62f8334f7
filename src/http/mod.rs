//! HTTP/1.1 layer on top of the engine.
//!
//! [`HttpServer`] wires a [`PatternRouter`] into the engine's callback
//! table: each connection carries an [`InputStream`](crate::InputStream)
//! in its context slot, every `data` callback drains as many complete
//! pipelined requests as the buffer holds, and each one is answered
//! through a [`ResponseWriter`] in a single write.
//!
//! ```rust,no_run
//! use weir::http::{HttpServer, PatternRouter, Request, ResponseWriter};
//!
//! let mut mux = PatternRouter::new();
//! mux.get("/hello/:name", |w: &mut ResponseWriter, r: &mut Request| {
//!     let name = r.param("name").unwrap_or_default();
//!     w.set_body(format!("hello, {name}\n").into_bytes());
//! });
//! HttpServer::new(mux).port(8080).serve().unwrap();
//! ```

mod mux;
mod request;
mod response;

pub use mux::{Handler, PatternRouter};
pub use request::{parse_request, MalformedRequest, Request};
pub use response::{Header, ResponseWriter};

use std::sync::Arc;

use tracing::info;

use crate::conn::{Action, Conn, Options};
use crate::error::{Error, Result};
use crate::events::{EngineConfig, Events, ServerInfo};
use crate::stream::InputStream;

use response::append_response;

/// A multi-loop HTTP server over TCP ports and unix sockets.
pub struct HttpServer {
    router: Arc<PatternRouter>,
    ports: Vec<u16>,
    unix_sockets: Vec<String>,
    loops: i32,
}

impl HttpServer {
    pub fn new(router: PatternRouter) -> Self {
        Self {
            router: Arc::new(router),
            ports: Vec::new(),
            unix_sockets: Vec::new(),
            loops: -1,
        }
    }

    /// Adds a TCP port bound on every interface.
    pub fn port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    /// Adds a unix socket listener.
    pub fn unix_socket(mut self, path: impl Into<String>) -> Self {
        self.unix_sockets.push(path.into());
        self
    }

    /// Overrides the loop count; non-positive means one per processor.
    pub fn num_loops(mut self, loops: i32) -> Self {
        self.loops = loops;
        self
    }

    /// Runs until a handler or signal shuts the engine down. At least
    /// one port or unix socket must have been added.
    pub fn serve(self) -> Result<()> {
        let mut addrs: Vec<String> = Vec::new();
        for port in &self.ports {
            addrs.push(format!("tcp://:{port}"));
        }
        for path in &self.unix_sockets {
            addrs.push(format!("unix://{path}"));
        }
        if addrs.is_empty() {
            return Err(Error::InvalidAddress("no address specified".into()));
        }
        let config = EngineConfig::builder().num_loops(self.loops).build();
        let addrs: Vec<&str> = addrs.iter().map(String::as_str).collect();
        let events = HttpEvents {
            router: self.router,
        };
        crate::serve_with_config(events, &config, &addrs)
    }
}

struct HttpEvents {
    router: Arc<PatternRouter>,
}

impl Events for HttpEvents {
    fn serving(&self, info: &ServerInfo) -> Action {
        if info.loop_id == 0 {
            for addr in &info.addrs {
                info!(loops = info.num_loops, "http server listening on {addr}");
            }
        }
        Action::None
    }

    fn opened(&self, conn: &mut Conn) -> (Vec<u8>, Options, Action) {
        conn.set_context(InputStream::default());
        (Vec::new(), Options::default(), Action::None)
    }

    fn data(&self, conn: &mut Conn, input: &[u8]) -> (Vec<u8>, Action) {
        let remote = conn.remote_addr().to_string();
        if !conn.has_context() {
            conn.set_context(InputStream::default());
        }
        let Some(stream) = conn.context_mut::<InputStream>() else {
            return (Vec::new(), Action::Close);
        };

        let buffered = stream.begin(input);
        let mut data: &[u8] = &buffered;
        let mut out = Vec::new();
        let mut action = Action::None;
        loop {
            if data.is_empty() {
                break;
            }
            let mut req = Request::default();
            match parse_request(data, &mut req) {
                Err(e) => {
                    append_response(&mut out, "500 Error", "", format!("{e}\n").as_bytes());
                    action = Action::Close;
                    break;
                }
                Ok(leftover) => {
                    if leftover.len() == data.len() {
                        break; // request not ready yet
                    }
                    req.remote_addr = remote.clone();
                    let mut writer = ResponseWriter::new();
                    self.router.serve_http(&mut writer, &mut req);
                    out.extend_from_slice(&writer.finish());
                    data = leftover;
                }
            }
        }
        stream.end(data);
        (out, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // exercises the callback directly, the way one loop would
    fn data_roundtrip(events: &HttpEvents, conn: &mut Conn, input: &[u8]) -> (Vec<u8>, Action) {
        events.data(conn, input)
    }

    fn test_conn() -> Conn {
        Conn::new(
            None,
            0,
            crate::EndpointAddr::Ip("127.0.0.1:80".parse().unwrap()),
            crate::EndpointAddr::Ip("127.0.0.1:4242".parse().unwrap()),
        )
    }

    fn hello_events() -> HttpEvents {
        let mut mux = PatternRouter::new();
        mux.get("/hello/:name", |w: &mut ResponseWriter, r: &mut Request| {
            let name = r.param("name").unwrap_or_default();
            w.set_body(format!("hi {name}").into_bytes());
        });
        HttpEvents {
            router: Arc::new(mux),
        }
    }

    #[test]
    fn answers_two_pipelined_requests_in_one_write() {
        let events = hello_events();
        let mut conn = test_conn();
        let input = b"GET /hello/a HTTP/1.1\r\n\r\nGET /hello/b HTTP/1.1\r\n\r\n";
        let (out, action) = data_roundtrip(&events, &mut conn, input);
        assert_eq!(action, Action::None);
        let raw = String::from_utf8(out).unwrap();
        assert_eq!(raw.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(raw.contains("hi a"));
        assert!(raw.contains("hi b"));
        // a fully consumed batch must not grow a trailing error response
        assert!(!raw.contains("500 Error"));
    }

    #[test]
    fn buffers_partial_requests_across_calls() {
        let events = hello_events();
        let mut conn = test_conn();
        let (out, action) =
            data_roundtrip(&events, &mut conn, b"GET /hello/split HTTP/1.1\r\nHost: x");
        assert!(out.is_empty());
        assert_eq!(action, Action::None);
        let (out, action) = data_roundtrip(&events, &mut conn, b"\r\n\r\n");
        assert_eq!(action, Action::None);
        let raw = String::from_utf8(out).unwrap();
        assert!(raw.contains("hi split"));
    }

    #[test]
    fn malformed_request_gets_500_and_close() {
        let events = hello_events();
        let mut conn = test_conn();
        let (out, action) = data_roundtrip(&events, &mut conn, b"complete garbage\r\n\r\n");
        assert_eq!(action, Action::Close);
        assert!(String::from_utf8(out).unwrap().starts_with("HTTP/1.1 500 Error"));
    }

    #[test]
    fn no_listeners_is_an_error() {
        let mux = PatternRouter::new();
        let err = HttpServer::new(mux).serve().unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
    }
}
