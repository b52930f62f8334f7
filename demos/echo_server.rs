//! Multi-loop TCP echo server.
//!
//! ```sh
//! cargo run --example echo_server
//! printf 'hello\n' | nc 127.0.0.1 5000
//! ```

use std::time::Duration;

use tracing::info;
use weir::{Action, Conn, EngineConfig, Events, LoadBalance, Options, ServerInfo};

struct Echo;

impl Events for Echo {
    fn serving(&self, info: &ServerInfo) -> Action {
        if info.loop_id == 0 {
            info!(loops = info.num_loops, "echo server listening on {}", info.addrs[0]);
        }
        Action::None
    }

    fn opened(&self, conn: &mut Conn) -> (Vec<u8>, Options, Action) {
        info!("opened {} on loop {}", conn.remote_addr(), conn.loop_index());
        let opts = Options {
            tcp_keep_alive: Some(Duration::from_secs(300)),
            ..Options::default()
        };
        (Vec::new(), opts, Action::None)
    }

    fn data(&self, _conn: &mut Conn, input: &[u8]) -> (Vec<u8>, Action) {
        (input.to_vec(), Action::None)
    }

    fn closed(&self, conn: &mut Conn, err: Option<&std::io::Error>) -> Action {
        match err {
            Some(err) => info!("closed {} ({err})", conn.remote_addr()),
            None => info!("closed {}", conn.remote_addr()),
        }
        Action::None
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = EngineConfig::builder()
        .num_loops(-1)
        .load_balance(LoadBalance::LeastConnections)
        .build();
    weir::serve_with_config(Echo, &config, &["tcp://:5000"])?;
    Ok(())
}
