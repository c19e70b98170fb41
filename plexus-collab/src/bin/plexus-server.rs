//! Standalone sync server.
//!
//! Configured from `PLEXUS_*` environment variables; `RUST_LOG` sets the
//! log level. With `PLEXUS_TOKENS=token=user:role,...` only listed tokens
//! are admitted, otherwise every user joins as an editor.

use std::sync::Arc;

use log::info;
use plexus_collab::{AllowAll, Authenticator, ServerConfig, StaticTokens, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!("Starting plexus-server on {}", config.bind_addr);
    match &config.storage_path {
        Some(path) => info!("Persisting documents to {}", path.display()),
        None => info!("No PLEXUS_STORAGE_PATH set, documents live in memory only"),
    }

    let authenticator: Arc<dyn Authenticator> = match std::env::var("PLEXUS_TOKENS") {
        Ok(spec) => {
            let tokens = StaticTokens::parse(&spec);
            info!("Token authentication enabled ({} tokens)", tokens.len());
            Arc::new(tokens)
        }
        Err(_) => Arc::new(AllowAll),
    };

    let server = SyncServer::new(config)?.with_authenticator(authenticator);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            server.shutdown().await;
            // Let rooms write their final state.
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    }
    Ok(())
}
