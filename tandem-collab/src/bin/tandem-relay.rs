//! Standalone relay.
//!
//! ```text
//! tandem-relay [BIND_ADDR] [DATA_DIR]
//! ```
//!
//! Falls back to `TANDEM_BIND` / `TANDEM_DATA`, then to `127.0.0.1:9090`
//! in-memory. Log level via `RUST_LOG` (default `info`).

use std::path::PathBuf;

use log::info;
use tandem_collab::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let defaults = RelayConfig::default();

    let bind_addr = args
        .next()
        .or_else(|| std::env::var("TANDEM_BIND").ok())
        .unwrap_or(defaults.bind_addr);
    let storage_path = args
        .next()
        .or_else(|| std::env::var("TANDEM_DATA").ok())
        .map(PathBuf::from);

    let config = RelayConfig {
        bind_addr,
        storage_path,
        ..RelayConfig::default()
    };

    match &config.storage_path {
        Some(path) => info!("Starting tandem relay with storage at {}", path.display()),
        None => info!("Starting tandem relay (in-memory)"),
    }

    let relay = RelayServer::new(config)?;
    relay.run().await
}
