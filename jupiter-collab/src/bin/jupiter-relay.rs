//! Standalone relay: `RUST_LOG=info jupiter-relay`.
//!
//! Configured through `JUPITER_BIND_ADDR`, `JUPITER_MAX_PEERS`,
//! `JUPITER_CHANNEL_CAPACITY` and `JUPITER_CHECKSUM_INTERVAL_MS`.

use jupiter_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!(
        "Starting relay (max {} peers per session, checksum every {} ms)",
        config.max_peers_per_session,
        config.checksum_interval_ms
    );
    SyncServer::new(config).run().await
}
