//! Server configuration.
//!
//! [`ServerConfig`] can be built directly or loaded from a [`Config`] with
//! namespaced lookups.

use crate::error::Error;
use ::config::Config;
use std::net::{Ipv4Addr, SocketAddrV4};

// ============================================================================
// Defaults
// ============================================================================

/// Port used when no `port` key is configured.
pub const DEFAULT_PORT: u16 = 13371;
/// Advisory connection limit.
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;
/// Upper bound for establishing an outbound connection.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;
/// Size of each chunk read from a socket while draining it.
pub const DEFAULT_MAX_READ_SIZE: usize = 8192;
/// Number of readiness events fetched per poll.
pub const DEFAULT_POLL_CAPACITY: usize = 128;

const DEFAULT_ADDRESS: Ipv4Addr = Ipv4Addr::LOCALHOST;

// ============================================================================
// ServerConfig
// ============================================================================

/// Addressing and tuning parameters for a [`Server`](crate::Server).
///
/// The address is an IPv4 address in host byte order, so `0x7f000001` is
/// `127.0.0.1`. A host always binds the wildcard address and only uses
/// `port`; a client dials `address:port`.
///
/// # Configuration Keys
///
/// ```toml
/// address = "127.0.0.1"
/// port = 13371
/// max_connections = 32
/// connect_timeout_ms = 3000
/// max_read_size = 8192
/// poll_capacity = 128
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub address: u32,
    pub port: u16,
    /// Advisory only. Exceeding it is logged but connections are still
    /// accepted.
    pub max_connections: usize,
    pub connect_timeout_ms: u64,
    pub max_read_size: usize,
    pub poll_capacity: usize,
}

impl ServerConfig {
    /// Creates a configuration for `address:port` with default tuning.
    pub fn new(address: u32, port: u16) -> Self {
        Self {
            address,
            port,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_read_size: DEFAULT_MAX_READ_SIZE,
            poll_capacity: DEFAULT_POLL_CAPACITY,
        }
    }

    /// Loads a configuration from `config`, falling back to defaults for
    /// missing keys.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Loads a named configuration.
    ///
    /// Configuration lookup follows this priority:
    /// 1. `{name}.{key}` (e.g., `relay.port`)
    /// 2. `{key}` (e.g., `port`)
    /// 3. Hard-coded default
    ///
    /// A key that is present but has the wrong type is an error rather than
    /// silently replaced by its default.
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let address = match optional(get_namespaced_string(config, name, "address"))? {
            Some(text) => u32::from(
                text.parse::<Ipv4Addr>()
                    .map_err(|_| Error::InvalidAddress(text))?,
            ),
            None => u32::from(DEFAULT_ADDRESS),
        };

        let port = match optional(get_namespaced_u64(config, name, "port"))? {
            Some(port) => u16::try_from(port).map_err(|_| {
                Error::Config(::config::ConfigError::Message(format!(
                    "port {port} is out of range"
                )))
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            address,
            port,
            max_connections: optional(get_namespaced_usize(config, name, "max_connections"))?
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            connect_timeout_ms: optional(get_namespaced_u64(config, name, "connect_timeout_ms"))?
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            max_read_size: optional(get_namespaced_usize(config, name, "max_read_size"))?
                .unwrap_or(DEFAULT_MAX_READ_SIZE)
                .max(1),
            poll_capacity: optional(get_namespaced_usize(config, name, "poll_capacity"))?
                .unwrap_or(DEFAULT_POLL_CAPACITY)
                .max(1),
        })
    }

    /// The address a client dials.
    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.address), self.port)
    }

    /// The address a host binds: the wildcard address on the configured port.
    pub fn listen_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(u32::from(DEFAULT_ADDRESS), DEFAULT_PORT)
    }
}

// ============================================================================
// Namespaced Lookups
// ============================================================================

// Missing keys become `None`, every other lookup failure is kept.
fn optional<T>(result: Result<T, ::config::ConfigError>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(::config::ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, ::config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, ::config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        match getter(config, &format!("{name}.{key}")) {
            Err(::config::ConfigError::NotFound(_)) => getter(config, key),
            other => other,
        }
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, ::config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, ::config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, ::config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_when_config_is_empty() {
        let config = ServerConfig::from_config(&Config::default()).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.address, 0x7f00_0001);
        assert_eq!(config.port, 13371);
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.connect_timeout_ms, 3000);
    }

    #[test]
    fn host_order_address_renders_as_dotted_quad() {
        let config = ServerConfig::new(0x7f00_0001, 4000);
        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:4000");
        assert_eq!(config.listen_addr().to_string(), "0.0.0.0:4000");
    }

    #[test]
    fn namespaced_keys_take_priority() {
        let config = Config::builder()
            .set_default("port", 1000)
            .unwrap()
            .set_default("relay.port", 2000)
            .unwrap()
            .set_default("connect_timeout_ms", 250)
            .unwrap()
            .build()
            .unwrap();

        let named = ServerConfig::from_config_named(&config, "relay").unwrap();
        assert_eq!(named.port, 2000);
        assert_eq!(named.connect_timeout_ms, 250);

        let plain = ServerConfig::from_config(&config).unwrap();
        assert_eq!(plain.port, 1000);
    }

    #[test]
    fn invalid_address_is_rejected() {
        let config = Config::builder()
            .set_default("address", "not-an-address")
            .unwrap()
            .build()
            .unwrap();
        let err = ServerConfig::from_config(&config).unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(ref a) if a == "not-an-address"));
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let config = Config::builder()
            .set_default("port", 70000)
            .unwrap()
            .build()
            .unwrap();
        assert!(matches!(
            ServerConfig::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn loads_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "address = \"10.1.2.3\"").unwrap();
        writeln!(file, "port = 5555").unwrap();
        writeln!(file, "max_connections = 4").unwrap();
        file.flush().unwrap();

        let config = Config::builder()
            .add_source(::config::File::from(file.path()))
            .build()
            .unwrap();
        let config = ServerConfig::from_config(&config).unwrap();
        assert_eq!(config.socket_addr().to_string(), "10.1.2.3:5555");
        assert_eq!(config.max_connections, 4);
    }
}
