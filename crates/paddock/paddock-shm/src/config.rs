use crate::error::ShmError;
use std::time::Duration;

pub const DEFAULT_REGION_NAME: &str = "paddock_telemetry";
pub const DEFAULT_MAX_MSG_SIZE: usize = 1 << 20;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Runtime settings shared by the writer and readers of one region.
#[derive(Debug, Clone)]
pub struct ShmConfig {
    /// Region name, resolved by [`paddock_mmap::region_path`].
    pub name: String,
    /// Largest payload a single frame may carry.
    pub max_msg_size: usize,
    /// Reader sleep between reads while attached.
    pub poll_interval: Duration,
    /// Reader sleep between attach attempts.
    pub retry_interval: Duration,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_REGION_NAME.into(),
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl ShmConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ShmError> {
        if self.name.is_empty() {
            return Err(ShmError::InvalidConfig("empty region name".into()));
        }
        if self.max_msg_size == 0 || self.max_msg_size > u32::MAX as usize {
            return Err(ShmError::InvalidConfig(format!(
                "max_msg_size must be in 1..=u32::MAX, got {}",
                self.max_msg_size
            )));
        }
        Ok(())
    }
}
