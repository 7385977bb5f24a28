use std::path::PathBuf;

use clap::Parser;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:6667";
const DEFAULT_TLS_LISTEN_ADDR: &str = "127.0.0.1:6697";
const DEFAULT_SERVER_NAME: &str = "irc-bridge";

/// IRC front-end for a remote chat backend.
#[derive(Parser, Debug, Clone)]
#[command(name = "irc-bridge", version, about)]
pub struct ServerConfig {
    /// Plain TCP listener address.
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// TLS listener address. Only active if --tls-cert and --tls-key are set.
    #[arg(long, default_value = DEFAULT_TLS_LISTEN_ADDR)]
    pub tls_listen_addr: String,

    /// Path to TLS certificate PEM file.
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Path to TLS private key PEM file.
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Server name used as the prefix of server replies.
    #[arg(long, default_value = DEFAULT_SERVER_NAME)]
    pub server_name: String,

    /// Append every relayed message as JSON lines to this file.
    /// If not set, messages are logged through tracing only.
    #[arg(long)]
    pub message_log: Option<PathBuf>,

    /// JSON fixture describing chats, members and presence for the
    /// in-memory backend.
    #[arg(long)]
    pub fixture: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            tls_listen_addr: DEFAULT_TLS_LISTEN_ADDR.to_string(),
            tls_cert: None,
            tls_key: None,
            server_name: DEFAULT_SERVER_NAME.to_string(),
            message_log: None,
            fixture: None,
        }
    }
}

impl ServerConfig {
    /// Both halves of the TLS identity are present.
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli_defaults() {
        let parsed = ServerConfig::parse_from(["irc-bridge"]);
        let default = ServerConfig::default();
        assert_eq!(parsed.listen_addr, default.listen_addr);
        assert_eq!(parsed.server_name, default.server_name);
        assert!(!parsed.tls_enabled());
    }

    #[test]
    fn tls_requires_cert_and_key() {
        let parsed = ServerConfig::parse_from(["irc-bridge", "--tls-cert", "c.pem"]);
        assert!(!parsed.tls_enabled());
        let parsed =
            ServerConfig::parse_from(["irc-bridge", "--tls-cert", "c.pem", "--tls-key", "k.pem"]);
        assert!(parsed.tls_enabled());
    }
}
