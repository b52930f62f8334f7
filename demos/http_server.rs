//! HTTP server with a pattern-routed JSON endpoint.
//!
//! ```sh
//! cargo run --example http_server
//! curl -d '{"A":1,"B":1,"C":1}' http://127.0.0.1:8080/hello/10
//! ```

use serde::{Deserialize, Serialize};
use weir::http::{HttpServer, PatternRouter, Request, ResponseWriter};

#[derive(Serialize, Deserialize, Default)]
struct Counters {
    #[serde(rename = "A")]
    a: i64,
    #[serde(rename = "B")]
    b: i64,
    #[serde(rename = "C")]
    c: i64,
}

fn hello(w: &mut ResponseWriter, r: &mut Request) {
    let mut counters: Counters = serde_json::from_str(&r.body).unwrap_or_default();
    let step: i64 = r
        .param("name")
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    counters.a += step;
    counters.b *= step;
    counters.c = if step == 0 { 0 } else { counters.c / step };
    match serde_json::to_vec(&counters) {
        Ok(body) => w.set_body(body),
        Err(_) => w.write_header(500),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut mux = PatternRouter::new();
    mux.get("/hello/:name", hello);
    mux.post("/hello/:name", hello);

    HttpServer::new(mux).port(8080).serve()?;
    Ok(())
}
