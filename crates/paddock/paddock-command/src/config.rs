use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

/// Heartbeat monitor settings.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// How often the monitor checks.
    pub interval: Duration,
    /// Silence longer than this counts as a miss.
    pub timeout: Duration,
    /// Consecutive misses before the callback fires.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            max_missed: DEFAULT_MAX_MISSED_HEARTBEATS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Reported as `source` in replies.
    pub name: String,
    pub host: String,
    /// 0 lets the OS pick; the bound port is available after `bind`.
    pub port: u16,
    /// Upper bound on one blocking receive, so `stop()` is noticed promptly.
    pub recv_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: DEFAULT_HOST.into(),
            port: 0,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            heartbeat: HeartbeatConfig::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_recv_timeout(mut self, recv_timeout: Duration) -> Self {
        self.recv_timeout = recv_timeout;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub(crate) fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
