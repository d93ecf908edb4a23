use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use tofcast_core::DEFAULT_PAYLOAD_LIMIT;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub receiver: ReceiverConfig,
    pub publisher: PublisherConfig,
    pub source: SourceConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address for the HTTP server to listen on
    pub http_addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
pub struct ReceiverConfig {
    /// Device name the emitter advertises
    pub target_name: String,
    /// Bytes per broadcast (header + chunk); must match the emitter
    #[serde(default = "default_payload_limit")]
    pub payload_limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct PublisherConfig {
    pub topic: String,
    /// Size of the output buffer; larger messages are dropped
    pub max_payload_bytes: usize,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    Mock {
        /// Interval in milliseconds between simulated records
        interval_ms: u64,
        /// Times each fragment is observed
        repeats: usize,
        /// Number of unrelated advertisers
        noise_devices: usize,
    },
    Tcp {
        addr: SocketAddr,
    },
}

fn default_payload_limit() -> usize {
    DEFAULT_PAYLOAD_LIMIT
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> color_eyre::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                http_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            },
            receiver: ReceiverConfig {
                target_name: "tofcast".to_string(),
                payload_limit: DEFAULT_PAYLOAD_LIMIT,
            },
            publisher: PublisherConfig {
                topic: "tofcast/measurement".to_string(),
                max_payload_bytes: 2048,
            },
            source: SourceConfig::Mock {
                interval_ms: 5000,
                repeats: 3,
                noise_devices: 2,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_source_config_parses_with_default_payload_limit() {
        let config = Config::parse(
            r#"
            [server]
            http_addr = "127.0.0.1:8081"

            [receiver]
            target_name = "tof-node"

            [publisher]
            topic = "lab/tof"
            max_payload_bytes = 1500

            [source]
            type = "mock"
            interval_ms = 250
            repeats = 4
            noise_devices = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.receiver.target_name, "tof-node");
        assert_eq!(config.receiver.payload_limit, DEFAULT_PAYLOAD_LIMIT);
        assert_eq!(config.publisher.max_payload_bytes, 1500);
        assert!(matches!(
            config.source,
            SourceConfig::Mock {
                interval_ms: 250,
                repeats: 4,
                noise_devices: 1
            }
        ));
    }

    #[test]
    fn tcp_source_config_parses() {
        let config = Config::parse(
            r#"
            [server]
            http_addr = "0.0.0.0:8081"

            [receiver]
            target_name = "tof-node"
            payload_limit = 150

            [publisher]
            topic = "lab/tof"
            max_payload_bytes = 1500

            [source]
            type = "tcp"
            addr = "0.0.0.0:9100"
            "#,
        )
        .unwrap();

        assert_eq!(config.receiver.payload_limit, 150);
        let SourceConfig::Tcp { addr } = config.source else {
            panic!("expected tcp source");
        };
        assert_eq!(addr.port(), 9100);
    }

    #[test]
    fn unknown_source_type_is_an_error() {
        let result = Config::parse(
            r#"
            [server]
            http_addr = "0.0.0.0:8081"
            [receiver]
            target_name = "x"
            [publisher]
            topic = "t"
            max_payload_bytes = 10
            [source]
            type = "serial"
            "#,
        );

        assert!(result.is_err());
    }
}
