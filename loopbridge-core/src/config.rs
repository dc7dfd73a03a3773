use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use loopbridge_net::datagram::{DEFAULT_DATAGRAM_PORT, SEND_QUEUE_CAPACITY};
use loopbridge_net::{TransportOptions, DEFAULT_CHANNEL, DEFAULT_DUPLEX_ADDR};

use crate::reconnect::Backoff;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    datagram: DatagramConfig,
    #[serde(default)]
    duplex: DuplexConfig,
    #[serde(default)]
    reconnect: ReconnectConfig,
    #[serde(default)]
    routing: RoutingConfig,
}

#[derive(Debug, Deserialize, Default)]
struct DatagramConfig {
    host: Option<String>,
    port: Option<u16>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DuplexConfig {
    address: Option<String>,
    client_name: Option<String>,
    channels: Option<Vec<String>>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ReconnectConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RoutingConfig {
    datagram_parameters: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct Config {
    datagram: DatagramConfig,
    duplex: DuplexConfig,
    reconnect: ReconnectConfig,
    routing: RoutingConfig,
}

impl Config {
    /// Built-in defaults merged with the user's config file, if any.
    pub fn load() -> Self {
        match user_config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::from_file(embedded()),
        }
    }

    /// Built-in defaults merged with `path`. A missing file is not an error;
    /// an unreadable or malformed one is logged and ignored.
    pub fn load_from(path: &Path) -> Self {
        let mut base = embedded();

        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                    Ok(user) => merge(&mut base, user),
                    Err(e) => {
                        log::warn!(target: "config", "ignoring malformed config {}: {}", path.display(), e)
                    }
                },
                Err(e) => {
                    log::warn!(target: "config", "could not read config {}: {}", path.display(), e)
                }
            }
        }

        Self::from_file(base)
    }

    /// Built-in defaults merged with `contents`.
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        let mut base = embedded();
        merge(&mut base, toml::from_str(contents)?);
        Ok(Self::from_file(base))
    }

    fn from_file(file: ConfigFile) -> Self {
        Config {
            datagram: file.datagram,
            duplex: file.duplex,
            reconnect: file.reconnect,
            routing: file.routing,
        }
    }

    /// Where OSC datagrams are sent. An unparseable host falls back to `0.0.0.0`.
    pub fn datagram_target(&self) -> SocketAddr {
        let port = self.datagram.port.unwrap_or(DEFAULT_DATAGRAM_PORT);
        let ip = match self.datagram.host.as_deref() {
            Some(host) => host.parse::<IpAddr>().unwrap_or_else(|e| {
                log::warn!(target: "config", "invalid datagram host {:?}: {}", host, e);
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            }),
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        SocketAddr::new(ip, port)
    }

    pub fn datagram_queue_capacity(&self) -> usize {
        self.datagram
            .queue_capacity
            .unwrap_or(SEND_QUEUE_CAPACITY)
            .clamp(1, 65_536)
    }

    pub fn transport_options(&self) -> TransportOptions {
        let fallback = TransportOptions::default();
        let channels = match &self.duplex.channels {
            Some(channels) if !channels.is_empty() => channels.clone(),
            _ => vec![DEFAULT_CHANNEL.to_string()],
        };
        TransportOptions {
            address: self
                .duplex
                .address
                .clone()
                .unwrap_or_else(|| DEFAULT_DUPLEX_ADDR.to_string()),
            client_name: self.duplex.client_name.clone().unwrap_or(fallback.client_name),
            channels,
            queue_capacity: self
                .duplex
                .queue_capacity
                .unwrap_or(fallback.queue_capacity)
                .clamp(1, 65_536),
        }
    }

    pub fn backoff(&self) -> Backoff {
        let initial = self
            .reconnect
            .initial_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(250));
        let max = self
            .reconnect
            .max_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(8));
        Backoff::new(initial, max, self.reconnect.max_attempts.unwrap_or(0))
    }

    /// Parameter names routed to the datagram channel.
    pub fn datagram_parameters(&self) -> HashSet<String> {
        self.routing
            .datagram_parameters
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_file(embedded())
    }
}

pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("loopbridge").join("config.toml"))
}

fn embedded() -> ConfigFile {
    toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|e| {
        log::error!(target: "config", "embedded config.toml is invalid: {}", e);
        ConfigFile::default()
    })
}

fn merge(base: &mut ConfigFile, user: ConfigFile) {
    let datagram = user.datagram;
    if datagram.host.is_some() {
        base.datagram.host = datagram.host;
    }
    if datagram.port.is_some() {
        base.datagram.port = datagram.port;
    }
    if datagram.queue_capacity.is_some() {
        base.datagram.queue_capacity = datagram.queue_capacity;
    }

    let duplex = user.duplex;
    if duplex.address.is_some() {
        base.duplex.address = duplex.address;
    }
    if duplex.client_name.is_some() {
        base.duplex.client_name = duplex.client_name;
    }
    if duplex.channels.is_some() {
        base.duplex.channels = duplex.channels;
    }
    if duplex.queue_capacity.is_some() {
        base.duplex.queue_capacity = duplex.queue_capacity;
    }

    let reconnect = user.reconnect;
    if reconnect.initial_delay_ms.is_some() {
        base.reconnect.initial_delay_ms = reconnect.initial_delay_ms;
    }
    if reconnect.max_delay_ms.is_some() {
        base.reconnect.max_delay_ms = reconnect.max_delay_ms;
    }
    if reconnect.max_attempts.is_some() {
        base.reconnect.max_attempts = reconnect.max_attempts;
    }

    if user.routing.datagram_parameters.is_some() {
        base.routing.datagram_parameters = user.routing.datagram_parameters;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_embedded_config() {
        let config = Config::default();
        assert_eq!(config.datagram_target(), "0.0.0.0:1449".parse().unwrap());
        assert_eq!(config.datagram_queue_capacity(), 256);

        let options = config.transport_options();
        assert_eq!(options.address, "127.0.0.1:1450");
        assert_eq!(options.client_name, "loopbridge");
        assert_eq!(options.channels, vec!["default".to_string()]);
        assert_eq!(options.queue_capacity, 256);

        assert_eq!(
            config.backoff(),
            Backoff::new(Duration::from_millis(250), Duration::from_secs(8), 0)
        );
        // Everything goes over the duplex transport unless configured.
        assert!(config.datagram_parameters().is_empty());
    }

    #[test]
    fn test_user_values_override_defaults() {
        let config = Config::from_toml_str(
            r#"
            [datagram]
            port = 9000

            [duplex]
            address = "10.0.0.2:1450"

            [reconnect]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.datagram_target(), "0.0.0.0:9000".parse().unwrap());
        let options = config.transport_options();
        assert_eq!(options.address, "10.0.0.2:1450");
        // Untouched keys keep their defaults.
        assert_eq!(options.client_name, "loopbridge");
        assert_eq!(
            config.backoff(),
            Backoff::new(Duration::from_millis(250), Duration::from_secs(8), 3)
        );
    }

    #[test]
    fn test_routing_list_is_read() {
        let config = Config::from_toml_str("[routing]\ndatagram_parameters = [\"volume\"]\n").unwrap();
        assert!(config.datagram_parameters().contains("volume"));
        assert_eq!(config.datagram_parameters().len(), 1);
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        assert!(Config::from_toml_str("[duplex\naddress = 1").is_err());
        assert!(Config::from_toml_str("[datagram]\nport = \"high\"").is_err());
    }

    #[test]
    fn test_invalid_host_falls_back() {
        let config = Config::from_toml_str("[datagram]\nhost = \"engine.local\"\n").unwrap();
        assert_eq!(config.datagram_target(), "0.0.0.0:1449".parse().unwrap());
    }

    #[test]
    fn test_empty_channel_list_uses_default() {
        let config = Config::from_toml_str("[duplex]\nchannels = []\n").unwrap();
        assert_eq!(config.transport_options().channels, vec!["default".to_string()]);
    }

    #[test]
    fn test_zero_queue_capacity_is_raised() {
        let config = Config::from_toml_str("[duplex]\nqueue_capacity = 0\n").unwrap();
        assert_eq!(config.transport_options().queue_capacity, 1);
    }
}
