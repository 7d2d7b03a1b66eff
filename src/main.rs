//! Rendezvous server binary.
//!
//! Binds the UDP socket and runs the receive loop until the process is
//! stopped. Configuration comes from the environment: `RENDEZVOUS_BIND`
//! overrides the listen address, `RUST_LOG` the log filter.

use tracing::info;
use tracing_subscriber::EnvFilter;

use rendezvous::{RendezvousServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut config = ServerConfig::default();
    if let Ok(bind) = std::env::var("RENDEZVOUS_BIND") {
        config.bind_addr = bind.parse()?;
    }

    info!("rendezvous server v{}", VERSION);
    let server = RendezvousServer::bind(config).await?;
    server.run().await?;
    Ok(())
}
