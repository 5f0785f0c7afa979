//! Standalone sync relay.
//!
//! ```text
//! LOGOS_SYNC_BIND=0.0.0.0:9191 RUST_LOG=info sync_relay
//! ```

use logos_sync::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = RelayConfig::from_env();
    log::info!(
        "Starting sync relay on {} (max {} peers per channel)",
        config.bind_addr,
        config.max_peers_per_channel
    );

    if let Err(e) = RelayServer::new(config).run().await {
        log::error!("Sync relay stopped: {e}");
        std::process::exit(1);
    }
}
