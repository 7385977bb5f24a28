//! Gateway dependencies and TCP/TLS listeners.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;

use crate::backend::ChatBackend;
use crate::config::ServerConfig;
use crate::connection;
use crate::msglog::MessageLog;

/// Process-wide dependencies handed to every session.
///
/// Built once at startup. Sessions hold an `Arc` to it and share nothing
/// else with each other.
pub struct Gateway {
    pub server_name: Arc<str>,
    pub backend: Arc<dyn ChatBackend>,
    pub message_log: Arc<dyn MessageLog>,
}

pub struct Server {
    config: ServerConfig,
    backend: Arc<dyn ChatBackend>,
    message_log: Arc<dyn MessageLog>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        backend: Arc<dyn ChatBackend>,
        message_log: Arc<dyn MessageLog>,
    ) -> Self {
        Self {
            config,
            backend,
            message_log,
        }
    }

    fn gateway(&self) -> Arc<Gateway> {
        Arc::new(Gateway {
            server_name: Arc::from(self.config.server_name.as_str()),
            backend: Arc::clone(&self.backend),
            message_log: Arc::clone(&self.message_log),
        })
    }

    /// Serve until the plain listener fails.
    pub async fn run(self) -> Result<()> {
        let tls_acceptor = self.build_tls_acceptor()?;
        let gateway = self.gateway();

        let plain_listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        tracing::info!(addr = %self.config.listen_addr, "Accepting plain IRC connections");

        if let Some(acceptor) = tls_acceptor {
            let tls_listener = TcpListener::bind(&self.config.tls_listen_addr)
                .await
                .with_context(|| format!("Failed to bind {}", self.config.tls_listen_addr))?;
            tracing::info!(addr = %self.config.tls_listen_addr, "Accepting IRC over TLS");
            tokio::spawn(accept_tls(tls_listener, acceptor, Arc::clone(&gateway)));
        }

        accept_plain(plain_listener, gateway).await
    }

    /// Bind the plain listener only and accept in the background. Returns the
    /// bound address, so `127.0.0.1:0` works in tests.
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "Gateway listening");
        let handle = tokio::spawn(accept_plain(listener, self.gateway()));
        Ok((addr, handle))
    }

    fn build_tls_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        match (self.config.tls_cert.as_deref(), self.config.tls_key.as_deref()) {
            (Some(cert), Some(key)) => {
                let config = load_tls_config(cert, key)?;
                Ok(Some(TlsAcceptor::from(Arc::new(config))))
            }
            _ => Ok(None),
        }
    }
}

/// Build a rustls server config from a PEM certificate chain and key.
fn load_tls_config(cert: &Path, key: &Path) -> Result<rustls::ServerConfig> {
    let mut cert_reader = BufReader::new(
        File::open(cert).with_context(|| format!("Opening certificate {}", cert.display()))?,
    );
    let chain = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Parsing certificate {}", cert.display()))?;
    if chain.is_empty() {
        bail!("No certificates in {}", cert.display());
    }

    let mut key_reader = BufReader::new(
        File::open(key).with_context(|| format!("Opening private key {}", key.display()))?,
    );
    let Some(private_key) = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("Parsing private key {}", key.display()))?
    else {
        bail!("No private key in {}", key.display());
    };

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)
        .context("Certificate and key do not form a valid TLS identity")
}

async fn accept_plain(listener: TcpListener, gateway: Arc<Gateway>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            if let Err(e) = connection::handle(stream, gateway).await {
                tracing::error!(%peer, "Session ended with error: {e:#}");
            }
        });
    }
}

async fn accept_tls(listener: TcpListener, acceptor: TlsAcceptor, gateway: Arc<Gateway>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!("TLS accept error: {e}");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    let session_id = format!("tls-{addr}");
                    if let Err(e) = connection::handle_generic(tls_stream, session_id, gateway).await {
                        tracing::error!("TLS connection error: {e}");
                    }
                }
                Err(e) => tracing::warn!("TLS handshake failed: {e}"),
            }
        });
    }
}
