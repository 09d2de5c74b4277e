//! docsync-server: HTTP + realtime listeners over one document engine.

use std::sync::Arc;

use docsync_collab::{
    http, DocumentEngine, FanoutRegistry, IngressCoordinator, MemoryStore, RelayChannel,
    RocksStore, ServerConfig, SnapshotStore, StoreConfig, SyncServer,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env()?;
    log::info!("Starting docsync server...");

    let store: Arc<dyn SnapshotStore> = match &config.store_path {
        Some(path) => Arc::new(RocksStore::open(StoreConfig::at(path))?),
        None => Arc::new(MemoryStore::new()),
    };
    log::info!("Snapshot store: {}", store.backend());

    let engine = Arc::new(DocumentEngine::new(store));
    let fanout = Arc::new(FanoutRegistry::new());

    let coordinator = match &config.relay_url {
        Some(relay_url) => {
            let channel = Arc::new(RelayChannel::new(relay_url.clone()));
            let coordinator = Arc::new(IngressCoordinator::sequenced(
                engine.clone(),
                fanout,
                channel,
                config.sequencing_topic.clone(),
            ));
            // Subscribe before accepting any op
            coordinator.start().await?;
            coordinator
        }
        None => Arc::new(IngressCoordinator::direct(engine.clone(), fanout)),
    };

    let app = http::router(engine, &config.allowed_origins);
    let http_listener = TcpListener::bind(config.http_addr()).await?;
    let http_handle = tokio::spawn(http::serve(http_listener, app));

    let server = SyncServer::new(config, coordinator);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Realtime server stopped: {e}");
                return Err(e.to_string().into());
            }
        }
        result = http_handle => {
            match result {
                Ok(Err(e)) => log::error!("HTTP server stopped: {e}"),
                Err(e) => log::error!("HTTP server task failed: {e}"),
                Ok(Ok(())) => log::info!("HTTP server stopped"),
            }
        }
    }

    Ok(())
}
