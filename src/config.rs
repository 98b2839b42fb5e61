//! Configuration module for the server framework.
//!
//! Supports command-line arguments and an optional TOML configuration file.
//! CLI arguments take precedence over config file values. The listen address
//! and port are positional because handles embed the server address: the
//! operator must pick a concrete interface, `0.0.0.0` is rejected.

use crate::handle::ServerAddr;
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Wire preamble, first three bytes of every frame.
pub const MSG_PREAMBLE: &[u8; 3] = b"MAI";
/// Total header size: preamble (3) + version (2) + payload size (4).
pub const HEADER_SIZE: usize = 9;

/// Reserved protocol version for framework traffic (keepalive, error,
/// forwarded response, ack, fatal error).
pub const SPECIAL_COMMUNICATION: u16 = 0xFFFF;
/// Version of a session before its first valid frame.
pub const UNINITIALIZED_VERSION: u16 = 0;

/// Single-byte codes following the header when the version is
/// [`SPECIAL_COMMUNICATION`].
pub mod code {
    /// Server to client, no action required; detects zombie connections.
    pub const KEEP_ALIVE: u8 = 0x00;
    /// Server to client, next byte is an application error code.
    pub const ERROR: u8 = 0x01;
    /// Server to server, acknowledges one forwarded response.
    pub const ACK_OF_FORWARDED: u8 = 0x02;
    /// Interpreted locally to force a disconnect; never transmitted.
    pub const FATAL_ERROR: u8 = 0x03;
    /// Marker type for responses carried under an application version.
    pub const ORDINARY: u8 = 0xFF;
}

/// Hard cap on application-declared request/response sizes.
pub const MAX_POSSIBLE_REQUEST_RESPONSE_SIZE: usize = 1024 * 1024;
/// 128 KiB handle-array budget at 8 bytes per registration number.
pub const MAX_HANDLES_IN_FORWARDED_RESPONSE: usize = (128 * 1024) / 8;

/// Event loop tick period.
pub const TICK_INTERVAL: Duration = Duration::from_millis(201);
/// Minimum delay before a failed peer connection is retried.
pub const RETRY_CONNECTION_AFTER: Duration = Duration::from_secs(30);
/// How long a peer may sit without acks before it counts as overflowed.
pub const MAX_OVERFLOWED_TIME: Duration = Duration::from_secs(90);
/// Maximum time a peer connect attempt may stay in progress.
pub const WAIT_FOR_CONNECTION: Duration = Duration::from_secs(150);

/// Upper bound on the worker pool size (platform pool max minus the two
/// threads reserved for the stat sink and the file writer).
pub const MAX_WORKER_THREADS: usize = 62;

/// Parameters common to all protocol versions.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CommonParams {
    /// Per-client response queue limit; must be >= the worker thread count.
    pub max_pending_responses: usize,
    /// Worker pool size.
    pub max_request_processing_threads: usize,
    pub keep_alive_frequency_secs: u64,
    pub status_update_frequency_secs: u64,
}

impl Default for CommonParams {
    fn default() -> Self {
        CommonParams {
            max_pending_responses: 16,
            max_request_processing_threads: 5,
            keep_alive_frequency_secs: 30,
            status_update_frequency_secs: 5,
        }
    }
}

impl CommonParams {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_frequency_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_update_frequency_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_request_processing_threads == 0
            || self.max_request_processing_threads >= MAX_WORKER_THREADS
        {
            return Err(ConfigError::InvalidParameter(
                "max-request-processing-threads must be in 1..62",
            ));
        }
        if self.max_pending_responses < self.max_request_processing_threads {
            return Err(ConfigError::InvalidParameter(
                "max-pending-responses must be >= max-request-processing-threads",
            ));
        }
        Ok(())
    }
}

/// Per-version size limits, declared by the processor registered for the
/// version.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VersionParams {
    pub max_request_size: usize,
    pub max_response_size: usize,
}

impl Default for VersionParams {
    fn default() -> Self {
        VersionParams {
            max_request_size: 64 * 1024,
            max_response_size: 64 * 1024,
        }
    }
}

impl VersionParams {
    /// Parameters of the reserved framework version. A forwarded frame
    /// carries a sender version, a handle count, up to the handle cap of
    /// registration numbers and the original payload, so its limits are
    /// derived from the hard cap rather than declared.
    pub fn for_special_communication() -> Self {
        let max =
            2 + 4 + MAX_HANDLES_IN_FORWARDED_RESPONSE * 8 + MAX_POSSIBLE_REQUEST_RESPONSE_SIZE;
        VersionParams {
            max_request_size: max,
            max_response_size: max,
        }
    }
}

/// Immutable per-version parameter table, built once at startup from the
/// registered processors plus the reserved framework version.
#[derive(Debug)]
pub struct VersionTable {
    params: HashMap<u16, VersionParams>,
    max_request_size: usize,
    max_response_size: usize,
}

impl VersionTable {
    pub fn build(
        registered: impl IntoIterator<Item = (u16, VersionParams)>,
    ) -> Result<Self, ConfigError> {
        let mut params: HashMap<u16, VersionParams> = HashMap::new();

        for (version, vp) in registered {
            if version == UNINITIALIZED_VERSION {
                return Err(ConfigError::InvalidParameter(
                    "version 0 is reserved for uninitialized sessions",
                ));
            }
            if vp.max_request_size == 0 || vp.max_response_size == 0 {
                return Err(ConfigError::InvalidParameter(
                    "per-version request/response sizes must be positive",
                ));
            }
            if version != SPECIAL_COMMUNICATION
                && (vp.max_request_size >= MAX_POSSIBLE_REQUEST_RESPONSE_SIZE
                    || vp.max_response_size >= MAX_POSSIBLE_REQUEST_RESPONSE_SIZE)
            {
                return Err(ConfigError::InvalidParameter(
                    "per-version request/response sizes must be below the 1 MiB cap",
                ));
            }
            params.insert(version, vp);
        }

        params
            .entry(SPECIAL_COMMUNICATION)
            .or_insert_with(VersionParams::for_special_communication);

        let max_request_size = params
            .values()
            .map(|v| v.max_request_size)
            .max()
            .unwrap_or(0);
        let max_response_size = params
            .values()
            .map(|v| v.max_response_size)
            .max()
            .unwrap_or(0);

        Ok(VersionTable {
            params,
            max_request_size,
            max_response_size,
        })
    }

    pub fn get(&self, version: u16) -> Option<&VersionParams> {
        self.params.get(&version)
    }

    pub fn max_request_size_of_all_versions(&self) -> usize {
        self.max_request_size
    }

    pub fn max_response_size_of_all_versions(&self) -> usize {
        self.max_response_size
    }
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "maiplex")]
#[command(about = "High-throughput multiplexing TCP server", long_about = None)]
pub struct CliArgs {
    /// IPv4 address to listen on (a concrete interface address, not 0.0.0.0)
    pub address: String,

    /// TCP port to listen on
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Append periodic status snapshots to this file
    #[arg(long)]
    pub status_file: Option<PathBuf>,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct TomlConfig {
    pub server: CommonParams,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoggingConfig {
    pub level: String,
    pub status_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            status_file: None,
        }
    }
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub address: ServerAddr,
    pub port: u16,
    pub common: CommonParams,
    pub log_level: String,
    pub status_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from CLI args and the optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref path) = cli.config {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let ip: Ipv4Addr = cli
            .address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(cli.address.clone()))?;
        let address = ServerAddr::from(ip);

        if address.is_unspecified() {
            return Err(ConfigError::WildcardAddress);
        }

        let common = toml_config.server;
        common.validate()?;

        Ok(Config {
            address,
            port: cli.port,
            common,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            status_file: cli.status_file.or(toml_config.logging.status_file),
        })
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("failed to parse config file '{0}': {1}")]
    TomlParse(PathBuf, toml::de::Error),
    #[error("invalid IPv4 listen address '{0}'")]
    InvalidAddress(String),
    #[error("0.0.0.0 cannot be the server identity: client handles embed the server address")]
    WildcardAddress,
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(address: &str, port: u16) -> CliArgs {
        CliArgs {
            address: address.to_string(),
            port,
            config: None,
            log_level: "info".to_string(),
            status_file: None,
        }
    }

    #[test]
    fn test_default_common_params() {
        let common = CommonParams::default();
        assert_eq!(common.max_pending_responses, 16);
        assert_eq!(common.max_request_processing_threads, 5);
        assert_eq!(common.keep_alive_frequency_secs, 30);
        assert_eq!(common.status_update_frequency_secs, 5);
        assert!(common.validate().is_ok());
    }

    #[test]
    fn test_wildcard_address_rejected() {
        let err = Config::from_args(args("0.0.0.0", 9000)).unwrap_err();
        assert!(matches!(err, ConfigError::WildcardAddress));
    }

    #[test]
    fn test_concrete_address_accepted() {
        let config = Config::from_args(args("127.0.0.1", 9000)).unwrap();
        assert_eq!(config.address.to_string(), "127.0.0.1");
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            max-pending-responses = 32
            max-request-processing-threads = 8

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.max_pending_responses, 32);
        assert_eq!(config.server.max_request_processing_threads, 8);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_pending_responses_must_cover_threads() {
        let common = CommonParams {
            max_pending_responses: 3,
            max_request_processing_threads: 5,
            ..CommonParams::default()
        };
        assert!(common.validate().is_err());
    }

    #[test]
    fn test_version_table_rejects_oversized_declarations() {
        let vp = VersionParams {
            max_request_size: MAX_POSSIBLE_REQUEST_RESPONSE_SIZE,
            max_response_size: 1024,
        };
        assert!(VersionTable::build([(1, vp)]).is_err());
    }

    #[test]
    fn test_version_table_always_carries_special_version() {
        let table = VersionTable::build([(1, VersionParams::default())]).unwrap();
        let special = table.get(SPECIAL_COMMUNICATION).unwrap();
        assert!(special.max_request_size > MAX_POSSIBLE_REQUEST_RESPONSE_SIZE);
        assert_eq!(
            table.max_request_size_of_all_versions(),
            special.max_request_size
        );
    }
}
