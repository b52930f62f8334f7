//! # Weir
//! An embeddable, multi-loop network server engine built on [`mio`],
//! plus a small HTTP/1.1 layer on top of it.
//! Weir runs one reactor thread per event loop, assigns every accepted
//! connection to exactly one loop, and drives all application logic
//! through a non-blocking callback table: no async runtime, no locks
//! around connection state.
//! ## Core Philosophy
//! Weir is for servers that want:
//! - **Predictable performance** from edge-triggered readiness and
//!   per-loop ownership
//! - **A callback contract**, not async/await: return bytes and an
//!   [`Action`] and the engine does the rest
//! - **Direct control** over loop count and connection placement
//! ## Features
//! - **Multi-loop reactor**: one thread per loop, connections balanced
//!   by [`LoadBalance::Random`], [`LoadBalance::RoundRobin`] or
//!   [`LoadBalance::LeastConnections`]
//! - **TCP, UDP and unix sockets** from one `scheme://address` list,
//!   with `?reuseport=true` for kernel-level balancing
//! - **Blocking fallback**: a `-net` scheme suffix (`tcp-net://…`)
//!   selects a portable stdlib backend with the same callback contract
//! - **Connection detach**: hand a raw blocking stream to user code and
//!   walk away
//! - **Input buffering**: [`InputStream`] stitches partial reads back
//!   together for streaming protocol parsers
//! - **HTTP layer**: pattern router, pipelined request parsing and
//!   single-write responses in [`http`]
//! ## Architecture Overview
//! ```text
//! ┌──────────┐    ┌───────────────┐    ┌────────────────┐
//! │  serve   │───▶│  loop 0 .. N  │───▶│ your callbacks │
//! └──────────┘    └───────────────┘    └────────────────┘
//!      │                  ▲
//!      ▼                  │ balancer + notifier hand-off
//! ┌──────────┐    ┌───────────────┐
//! │ listeners│───▶│    accept     │
//! └──────────┘    └───────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use weir::{Action, Conn, Events};
//!
//! struct Echo;
//!
//! impl Events for Echo {
//!     fn data(&self, _conn: &mut Conn, input: &[u8]) -> (Vec<u8>, Action) {
//!         (input.to_vec(), Action::None)
//!     }
//! }
//!
//! fn main() -> weir::Result<()> {
//!     weir::serve(Echo, &["tcp://:5000"])
//! }
//! ```

mod addr;
mod balance;
mod blocking;
mod conn;
mod engine;
mod error;
mod events;
pub mod http;
mod poll;
mod stream;

pub use balance::LoadBalance;
pub use conn::{Action, Conn, DetachedStream, EndpointAddr, Options};
pub use error::{Error, Result};
pub use events::{EngineConfig, EngineConfigBuilder, Events, ServerInfo};
pub use stream::InputStream;

/// Serves `events` over every listed address with the default
/// configuration, blocking until a callback returns
/// [`Action::Shutdown`].
///
/// Addresses have the form `scheme://address[?reuseport=bool]` with
/// schemes `tcp`, `tcp4`, `tcp6`, `udp`, `udp4`, `udp6` and `unix`. If
/// any scheme carries the `-net` suffix the whole call runs on the
/// blocking stdlib backend.
pub fn serve<E: Events>(events: E, addrs: &[&str]) -> Result<()> {
    serve_with_config(events, &EngineConfig::default(), addrs)
}

/// Like [`serve`] with an explicit loop count and balancing strategy.
pub fn serve_with_config<E: Events>(
    events: E,
    config: &EngineConfig,
    addrs: &[&str],
) -> Result<()> {
    let specs = addr::resolve(addrs)?;
    if specs.iter().any(|s| s.stdlib) {
        blocking::serve(events, config, &specs)
    } else {
        engine::serve(events, config, &specs)
    }
}
