use paddock_broker::BrokerConfig;
use paddock_command::{HeartbeatConfig, ServerConfig};
use paddock_shm::ShmConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Process configuration, one TOML file per process.
///
/// ```toml
/// log_level = "debug"
///
/// [shm]
/// name = "paddock_telemetry"
///
/// [command]
/// name = "receiver"
/// port = 5600
///
/// [[overlays]]
/// name = "standings"
/// port = 5601
/// ```
#[derive(Deserialize, Debug)]
pub struct PaddockConfig {
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default)]
    pub shm: ShmSection,
    #[serde(default)]
    pub command: CommandSection,
    #[serde(default)]
    pub broker: BrokerSection,
    /// Children the receiver supervises over their command channels.
    #[serde(default)]
    pub overlays: Vec<OverlayEntry>,
}

#[derive(Deserialize, Debug)]
pub struct ShmSection {
    #[serde(default = "defaults::shm_name")]
    pub name: String,
    #[serde(default = "defaults::max_msg_size")]
    pub max_msg_size: usize,
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "defaults::retry_interval_ms")]
    pub retry_interval_ms: u64,
}

#[derive(Deserialize, Debug)]
pub struct CommandSection {
    #[serde(default = "defaults::command_name")]
    pub name: String,
    /// 0 lets the OS pick.
    #[serde(default)]
    pub port: u16,
    #[serde(default = "defaults::recv_timeout_ms")]
    pub recv_timeout_ms: u64,
    #[serde(default = "defaults::heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "defaults::heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "defaults::max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,
}

#[derive(Deserialize, Debug, Default)]
pub struct BrokerSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub xsub_port: u16,
    #[serde(default)]
    pub xpub_port: u16,
}

#[derive(Deserialize, Debug, Clone)]
pub struct OverlayEntry {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn log_level() -> String {
        "info".into()
    }

    pub fn shm_name() -> String {
        paddock_shm::DEFAULT_REGION_NAME.into()
    }

    pub fn max_msg_size() -> usize {
        1 << 20 // 1 MiB
    }

    pub fn poll_interval_ms() -> u64 {
        2
    }

    pub fn retry_interval_ms() -> u64 {
        500
    }

    pub fn command_name() -> String {
        "paddock".into()
    }

    pub fn recv_timeout_ms() -> u64 {
        100
    }

    pub fn heartbeat_interval_ms() -> u64 {
        1_000
    }

    pub fn heartbeat_timeout_ms() -> u64 {
        3_000
    }

    pub fn max_missed_heartbeats() -> u32 {
        3
    }
}

impl Default for ShmSection {
    fn default() -> Self {
        Self {
            name: defaults::shm_name(),
            max_msg_size: defaults::max_msg_size(),
            poll_interval_ms: defaults::poll_interval_ms(),
            retry_interval_ms: defaults::retry_interval_ms(),
        }
    }
}

impl Default for CommandSection {
    fn default() -> Self {
        Self {
            name: defaults::command_name(),
            port: 0,
            recv_timeout_ms: defaults::recv_timeout_ms(),
            heartbeat_interval_ms: defaults::heartbeat_interval_ms(),
            heartbeat_timeout_ms: defaults::heartbeat_timeout_ms(),
            max_missed_heartbeats: defaults::max_missed_heartbeats(),
        }
    }
}

impl PaddockConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_to_str)
    }

    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Built-in defaults when no file is given.
    pub fn load_or_default(path: Option<&str>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Self::parse(""),
        }
    }
}

impl ShmSection {
    pub fn to_shm_config(&self) -> ShmConfig {
        ShmConfig::new(self.name.clone())
            .with_max_msg_size(self.max_msg_size)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_retry_interval(Duration::from_millis(self.retry_interval_ms))
    }
}

impl CommandSection {
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig::new(self.name.clone())
            .with_port(self.port)
            .with_recv_timeout(Duration::from_millis(self.recv_timeout_ms))
            .with_heartbeat(HeartbeatConfig {
                interval: Duration::from_millis(self.heartbeat_interval_ms),
                timeout: Duration::from_millis(self.heartbeat_timeout_ms),
                max_missed: self.max_missed_heartbeats,
            })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl BrokerSection {
    pub fn to_broker_config(&self) -> BrokerConfig {
        BrokerConfig::default().with_ports(self.xsub_port, self.xpub_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = PaddockConfig::parse("").unwrap();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.shm.name, "paddock_telemetry");
        assert_eq!(cfg.shm.max_msg_size, 1 << 20);
        assert_eq!(cfg.command.port, 0);
        assert_eq!(cfg.command.max_missed_heartbeats, 3);
        assert!(!cfg.broker.enabled);
        assert!(cfg.overlays.is_empty());
    }

    #[test]
    fn sections_map_onto_component_configs() {
        let cfg = PaddockConfig::parse(
            r#"
            log_level = "debug"

            [shm]
            name = "bus_test"
            max_msg_size = 4096
            poll_interval_ms = 5

            [command]
            name = "standings"
            port = 5601
            heartbeat_timeout_ms = 250

            [broker]
            enabled = true
            xpub_port = 5556

            [[overlays]]
            name = "relative"
            port = 5602
            "#,
        )
        .unwrap();

        let shm = cfg.shm.to_shm_config();
        assert_eq!(shm.name, "bus_test");
        assert_eq!(shm.max_msg_size, 4096);
        assert_eq!(shm.poll_interval, Duration::from_millis(5));
        assert_eq!(shm.retry_interval, Duration::from_millis(500));

        let server = cfg.command.to_server_config();
        assert_eq!(server.name, "standings");
        assert_eq!(server.port, 5601);
        assert_eq!(server.heartbeat.timeout, Duration::from_millis(250));
        assert_eq!(server.heartbeat.interval, Duration::from_secs(1));

        let broker = cfg.broker.to_broker_config();
        assert_eq!((broker.xsub_port, broker.xpub_port), (0, 5556));
        assert_eq!(cfg.overlays[0].name, "relative");
    }

    #[test]
    fn load_reports_path_and_parse_errors() {
        let err = PaddockConfig::load("/nonexistent/paddock.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { ref path, .. } if path == "/nonexistent/paddock.toml"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[command]\nport = \"not a port\"").unwrap();
        let path = file.path().to_str().unwrap().to_owned();
        assert!(matches!(PaddockConfig::load(path), Err(ConfigError::Parse(_))));
    }
}
