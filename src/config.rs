use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::auth;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_FAIL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_MAX_RESTARTS: u32 = 10;
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that stop the monitor before the first tick.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid stream id '{0}'")]
    InvalidStreamId(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("restart cooldown of {0:?} is out of range")]
    CooldownOutOfRange(Duration),
    #[error("invalid notification target '{0}'")]
    InvalidNotificationTarget(String),
    #[error("invalid AzuraCast URL '{0}'")]
    InvalidRelayUrl(String),
    #[error("missing credentials: {0}")]
    Credentials(#[from] auth::AuthError),
    #[error("stream '{0}' does not exist")]
    StreamNotFound(String),
    #[error("could not create HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Wait between checks while the stream is healthy.
    pub interval: Duration,
    /// Wait between checks while it is not.
    pub fail_interval: Duration,
    pub failure_threshold: u32,
    pub restart_cooldown: Duration,
    pub auto_restart: bool,
    /// `None` means unlimited.
    pub max_restarts: Option<u32>,
    pub notify_timeout: Duration,
    pub notification_target: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::with_interval(DEFAULT_INTERVAL)
    }
}

impl MonitorConfig {
    /// Defaults around a polling interval. The cooldown is twice the interval.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            fail_interval: DEFAULT_FAIL_INTERVAL.min(interval),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            // Saturates so that `validate` reports the overflow.
            restart_cooldown: interval.checked_mul(2).unwrap_or(Duration::MAX),
            auto_restart: true,
            max_restarts: Some(DEFAULT_MAX_RESTARTS),
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            notification_target: None,
        }
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::Zero("interval"));
        }
        if self.fail_interval.is_zero() {
            return Err(ConfigError::Zero("fail interval"));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Zero("failure threshold"));
        }
        if self.notify_timeout.is_zero() {
            return Err(ConfigError::Zero("notification timeout"));
        }
        if chrono::Duration::from_std(self.restart_cooldown).is_err() {
            return Err(ConfigError::CooldownOutOfRange(self.restart_cooldown));
        }
        if let Some(target) = &self.notification_target {
            let url = reqwest::Url::parse(target)
                .map_err(|_| ConfigError::InvalidNotificationTarget(target.clone()))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidNotificationTarget(target.clone()));
            }
        }

        Ok(self)
    }

    /// End of the cooldown window for a restart initiated at `from`.
    pub fn cooldown_deadline(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.restart_cooldown)
            .ok()
            .and_then(|d| from.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn restarts_exhausted(&self, total_restarts: u32) -> bool {
        self.max_restarts
            .map(|max| total_restarts >= max)
            .unwrap_or(false)
    }
}
