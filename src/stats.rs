use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::util;

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorStatistics {
    pub started_at: DateTime<Utc>,
    pub ticks: u64,
    pub unhealthy_samples: u64,
    pub restarts: u64,
    pub restarts_failed: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
}

impl MonitorStatistics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            ticks: 0,
            unhealthy_samples: 0,
            restarts: 0,
            restarts_failed: 0,
            notifications_sent: 0,
            notifications_failed: 0,
        }
    }

    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    pub fn summary(&self) -> String {
        format!(
            "Ran {} with {} checks ({} unhealthy), {} restarts ({} failed), {} notifications ({} failed)",
            util::format_duration(self.uptime()),
            self.ticks,
            self.unhealthy_samples,
            self.restarts,
            self.restarts_failed,
            self.notifications_sent,
            self.notifications_failed,
        )
    }
}

impl Default for MonitorStatistics {
    fn default() -> Self {
        Self::new()
    }
}
