use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use irc_bridge::backend::ChatBackend;
use irc_bridge::memory::MemoryBackend;
use irc_bridge::msglog::{FileMessageLog, MessageLog, TracingMessageLog};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("irc_bridge=info".parse()?))
        .init();

    let config = irc_bridge::config::ServerConfig::parse();
    tracing::info!("Starting IRC bridge on {}", config.listen_addr);
    if config.tls_enabled() {
        tracing::info!("TLS enabled on {}", config.tls_listen_addr);
    }

    let backend: Arc<dyn ChatBackend> = match config.fixture.as_deref() {
        Some(path) => {
            let backend = MemoryBackend::load_fixture(path)?;
            tracing::info!(fixture = %path.display(), "Loaded in-memory backend");
            Arc::new(backend)
        }
        None => {
            tracing::warn!("No --fixture given; starting with an empty in-memory backend");
            Arc::new(MemoryBackend::new("me"))
        }
    };

    let message_log: Arc<dyn MessageLog> = match config.message_log.as_deref() {
        Some(path) => Arc::new(FileMessageLog::open(path)?),
        None => Arc::new(TracingMessageLog),
    };

    let server = irc_bridge::server::Server::new(config, backend, message_log);
    server.run().await
}
