use std::io;
use std::time::Duration;

use crate::balance::LoadBalance;
use crate::conn::{Action, Conn, DetachedStream, EndpointAddr, Options};

/// Resolved listener and loop metadata handed to [`Events::serving`].
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Bound listener addresses, in specification order. Ephemeral ports
    /// (`:0`) appear here fully resolved.
    pub addrs: Vec<EndpointAddr>,
    /// Number of event loops this serve call runs.
    pub num_loops: usize,
    /// Index of the loop this invocation belongs to.
    pub loop_id: usize,
}

/// Callback table driving the engine.
///
/// One value implements this trait per [`serve`](crate::serve) call; the
/// engine shares it read-only across every loop, so implementations hold
/// their mutable state in atomics, locks, or the per-connection context
/// slot. All methods default to no-ops.
///
/// A connection's callbacks always run on its owning loop thread, one at
/// a time, so `data` for one connection never races `closed` for the
/// same connection.
pub trait Events: Send + Sync + 'static {
    /// Invoked once per loop before any connection is accepted.
    /// Returning [`Action::Shutdown`] aborts startup.
    fn serving(&self, _info: &ServerInfo) -> Action {
        Action::None
    }

    /// Invoked once per connection, immediately after acceptance and
    /// before any data is read. The returned bytes are queued for write;
    /// the [`Options`] apply for the connection's lifetime.
    fn opened(&self, _conn: &mut Conn) -> (Vec<u8>, Options, Action) {
        (Vec::new(), Options::default(), Action::None)
    }

    /// Invoked whenever new bytes are available. `input` is borrowed for
    /// the duration of the call unless `Options::reuse_input_buffer` is
    /// false, in which case it is a fresh allocation the callback may
    /// retain.
    fn data(&self, _conn: &mut Conn, _input: &[u8]) -> (Vec<u8>, Action) {
        (Vec::new(), Action::None)
    }

    /// Invoked exactly once as the connection reaches its end of life,
    /// with the I/O error that killed it, or `None` for an orderly close.
    fn closed(&self, _conn: &mut Conn, _err: Option<&io::Error>) -> Action {
        Action::None
    }

    /// Periodic per-loop callback; the returned delay schedules the next
    /// invocation for that loop. Returning `None` (the default) disables
    /// ticking entirely.
    fn tick(&self) -> Option<(Duration, Action)> {
        None
    }

    /// Invoked once after an [`Action::Detach`], transferring the raw
    /// descriptor out of the engine.
    fn detached(&self, _conn: &mut Conn, _stream: DetachedStream) -> Action {
        Action::None
    }
}

/// Engine configuration. Immutable for the lifetime of one serve call.
///
/// Built the builder way:
///
/// ```rust
/// use weir::{EngineConfig, LoadBalance};
///
/// let config = EngineConfig::builder()
///     .num_loops(4)
///     .load_balance(LoadBalance::LeastConnections)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of event loops; `0` or negative means one per available
    /// processor, `1` disables balancing.
    pub num_loops: i32,
    /// Strategy for assigning accepted connections to loops.
    pub load_balance: LoadBalance,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_loops: -1,
            load_balance: LoadBalance::default(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// The concrete loop count for this host.
    pub(crate) fn resolved_loops(&self) -> usize {
        if self.num_loops > 0 {
            self.num_loops as usize
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    num_loops: Option<i32>,
    load_balance: Option<LoadBalance>,
}

impl EngineConfigBuilder {
    pub fn num_loops(mut self, n: i32) -> Self {
        self.num_loops = Some(n);
        self
    }

    pub fn load_balance(mut self, lb: LoadBalance) -> Self {
        self.load_balance = Some(lb);
        self
    }

    pub fn build(self) -> EngineConfig {
        let default = EngineConfig::default();
        EngineConfig {
            num_loops: self.num_loops.unwrap_or(default.num_loops),
            load_balance: self.load_balance.unwrap_or(default.load_balance),
        }
    }
}
