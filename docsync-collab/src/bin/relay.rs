//! docsync-relay: the sequencing authority shared by every docsync-server.

use docsync_collab::{RelayConfig, SequencerRelay};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = RelayConfig::from_env();
    log::info!("Starting docsync relay on {}...", config.bind_addr);

    let relay = SequencerRelay::new(config);
    if let Err(e) = relay.run().await {
        log::error!("Relay stopped: {e}");
        return Err(e.to_string().into());
    }
    Ok(())
}
