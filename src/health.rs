//! Health state machine.
//!
//! [`evaluate`] is a pure function of the configuration, the tracked state and
//! the latest sample. It never looks at the clock: the sample timestamp is the
//! only notion of "now", which keeps the policy testable without timers.
//!
//! Every change of [`HealthState`] produces exactly one notification. Samples
//! that leave the state unchanged produce none.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::{
    config::MonitorConfig,
    notify::{Notification, NotificationKind},
    probe::HealthSample,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    /// Receiving data at full quality.
    Healthy,
    /// Receiving data at reduced quality. [`evaluate`] never enters it: any
    /// sample that is receiving data, `ok` included, counts as `Healthy`.
    Degraded,
    /// Unhealthy past the threshold and no restart is in progress.
    Failed,
    /// A restart was issued and its cooldown has not elapsed.
    Restarting,
    /// No conclusive sample yet, or a restart window ended without recovery.
    Unknown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Failed => "failed",
            HealthState::Restarting => "restarting",
            HealthState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    /// The control API confirmed the command. Recovery is up to the next probe.
    Acknowledged,
    Failed(String),
    TimedOut,
}

impl fmt::Display for RestartOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartOutcome::Acknowledged => f.write_str("acknowledged"),
            RestartOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            RestartOutcome::TimedOut => f.write_str("timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestartAttempt {
    pub initiated_at: DateTime<Utc>,
    pub outcome: RestartOutcome,
    pub cooldown_until: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    None,
    Notify(Notification),
    Restart,
    /// Restart first, then notify. The notification is completed with the
    /// restart outcome before it is sent.
    NotifyAndRestart(Notification),
}

impl Action {
    pub fn notification(&self) -> Option<&Notification> {
        match self {
            Action::Notify(n) | Action::NotifyAndRestart(n) => Some(n),
            Action::None | Action::Restart => None,
        }
    }

    pub fn restarts(&self) -> bool {
        matches!(self, Action::Restart | Action::NotifyAndRestart(_))
    }
}

/// Everything the state machine remembers between ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct Tracker {
    pub state: HealthState,
    pub consecutive_failures: u32,
    /// Restarts issued during this run.
    pub restarts: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_attempt: Option<RestartAttempt>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self {
            state: HealthState::Unknown,
            consecutive_failures: 0,
            restarts: 0,
            cooldown_until: None,
            last_attempt: None,
        }
    }
}

impl Tracker {
    pub fn cooldown_active(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|t| now < t).unwrap_or(false)
    }

    /// Stores the controller's answer. The cooldown never shrinks.
    pub fn record_attempt(&mut self, attempt: RestartAttempt) {
        self.cooldown_until = Some(match self.cooldown_until {
            Some(t) => t.max(attempt.cooldown_until),
            None => attempt.cooldown_until,
        });
        self.last_attempt = Some(attempt);
    }

    fn restart_allowed(&self, config: &MonitorConfig, now: DateTime<Utc>) -> bool {
        config.auto_restart
            && !self.cooldown_active(now)
            && !config.restarts_exhausted(self.restarts)
    }

    fn why_no_restart(&self, config: &MonitorConfig, now: DateTime<Utc>) -> String {
        if !config.auto_restart {
            "Auto-restart is disabled.".to_string()
        } else if config.restarts_exhausted(self.restarts) {
            format!(
                "Max restarts ({}) reached, not restarting again.",
                self.restarts
            )
        } else if let Some(until) = self.cooldown_until.filter(|_| self.cooldown_active(now)) {
            format!(
                "Restart cooldown active until {}.",
                until.format("%H:%M:%S UTC")
            )
        } else {
            String::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub tracker: Tracker,
    pub action: Action,
}

pub fn evaluate(config: &MonitorConfig, tracker: &Tracker, sample: &HealthSample) -> Decision {
    let now = sample.timestamp;
    let mut next = tracker.clone();

    if sample.is_receiving_data {
        next.consecutive_failures = 0;
        next.state = HealthState::Healthy;

        let action = if tracker.state == HealthState::Healthy {
            Action::None
        } else {
            Action::Notify(on_receiving(tracker.state, sample))
        };
        return Decision {
            tracker: next,
            action,
        };
    }

    // A restart window that elapsed without recovery hands over to Unknown;
    // inside the window unhealthy samples are expected and ignored.
    let mut from = tracker.state;
    if from == HealthState::Restarting {
        if tracker.cooldown_active(now) {
            return Decision {
                tracker: next,
                action: Action::None,
            };
        }
        from = HealthState::Unknown;
        next.state = HealthState::Unknown;
        next.consecutive_failures = 0;
    }

    next.consecutive_failures = next.consecutive_failures.saturating_add(1);

    let escalate = match from {
        HealthState::Failed => next.restart_allowed(config, now),
        _ => next.consecutive_failures >= config.failure_threshold,
    };

    if escalate {
        if next.restart_allowed(config, now) {
            next.state = HealthState::Restarting;
            next.consecutive_failures = 0;
            next.restarts += 1;
            next.cooldown_until = Some(config.cooldown_deadline(now));
        } else {
            next.state = HealthState::Failed;
        }
    }

    let action = match (tracker.state == next.state, next.state) {
        (true, HealthState::Restarting) => Action::Restart,
        (true, _) => Action::None,
        (false, HealthState::Restarting) => {
            Action::NotifyAndRestart(on_restart(tracker.state, &next, tracker, sample))
        }
        (false, HealthState::Failed) => {
            Action::Notify(on_failed(tracker.state, &next, config, sample))
        }
        (false, to) => Action::Notify(on_restart_elapsed(tracker.state, to, sample)),
    };

    Decision {
        tracker: next,
        action,
    }
}

fn on_receiving(from: HealthState, sample: &HealthSample) -> Notification {
    let title = match from {
        HealthState::Failed | HealthState::Restarting => "Stream Recovered",
        _ => "Stream Healthy",
    };

    Notification::transition(
        NotificationKind::Recovered,
        title,
        from,
        HealthState::Healthy,
        sample.describe(),
    )
}

fn on_failed(
    from: HealthState,
    next: &Tracker,
    config: &MonitorConfig,
    sample: &HealthSample,
) -> Notification {
    let mut reason = format!(
        "{} consecutive unhealthy checks, last {}.",
        next.consecutive_failures,
        sample.describe()
    );
    let why = next.why_no_restart(config, sample.timestamp);
    if !why.is_empty() {
        reason.push('\n');
        reason.push_str(&why);
    }

    Notification::transition(
        NotificationKind::Failure,
        "Stream Failed",
        from,
        HealthState::Failed,
        reason,
    )
}

fn on_restart(
    from: HealthState,
    next: &Tracker,
    prev: &Tracker,
    sample: &HealthSample,
) -> Notification {
    let reason = if from == HealthState::Failed {
        format!("Still unhealthy, last {}.", sample.describe())
    } else {
        format!(
            "{} consecutive unhealthy checks, last {}.",
            prev.consecutive_failures + 1,
            sample.describe()
        )
    };

    Notification::transition(
        NotificationKind::Warning,
        "Restarting Source",
        from,
        HealthState::Restarting,
        format!("{}\nRestart #{} issued.", reason, next.restarts),
    )
}

fn on_restart_elapsed(from: HealthState, to: HealthState, sample: &HealthSample) -> Notification {
    Notification::transition(
        NotificationKind::Failure,
        "Restart Did Not Recover Stream",
        from,
        to,
        format!("Restart window ended, {}.", sample.describe()),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn t0() -> DateTime<Utc> {
        "2024-02-15T08:00:00Z".parse().unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::seconds(secs)
    }

    fn sample(secs: i64, status: &str) -> HealthSample {
        HealthSample {
            timestamp: at(secs),
            is_receiving_data: matches!(status, "good" | "ok"),
            status: status.to_string(),
            stream_status: None,
            detail: None,
        }
    }

    fn config(threshold: u32, cooldown_secs: u64, auto_restart: bool) -> MonitorConfig {
        MonitorConfig {
            failure_threshold: threshold,
            restart_cooldown: Duration::from_secs(cooldown_secs),
            auto_restart,
            max_restarts: None,
            ..MonitorConfig::with_interval(Duration::from_secs(60))
        }
    }

    /// Applies a decision the way the monitor loop does, with an acknowledged
    /// restart.
    fn apply(config: &MonitorConfig, tracker: &Tracker, s: &HealthSample) -> Decision {
        let mut d = evaluate(config, tracker, s);
        if d.action.restarts() {
            d.tracker.record_attempt(RestartAttempt {
                initiated_at: s.timestamp,
                outcome: RestartOutcome::Acknowledged,
                cooldown_until: config.cooldown_deadline(s.timestamp),
            });
        }
        d
    }

    fn healthy_tracker() -> Tracker {
        Tracker {
            state: HealthState::Healthy,
            ..Default::default()
        }
    }

    #[test]
    fn restart_scenario() {
        let config = config(3, 600, true);
        let mut tracker = healthy_tracker();

        for i in 0..2 {
            let d = apply(&config, &tracker, &sample(i * 30, "noData"));
            assert_eq!(d.action, Action::None);
            assert_eq!(d.tracker.state, HealthState::Healthy);
            tracker = d.tracker;
        }
        assert_eq!(tracker.consecutive_failures, 2);

        let d = apply(&config, &tracker, &sample(60, "noData"));
        assert_eq!(d.tracker.state, HealthState::Restarting);
        assert!(matches!(d.action, Action::NotifyAndRestart(_)));
        assert_eq!(d.tracker.restarts, 1);
        tracker = d.tracker;

        // Within the cooldown: no new restart, no notification.
        let d = apply(&config, &tracker, &sample(90, "bad"));
        assert_eq!(d.action, Action::None);
        assert_eq!(d.tracker.state, HealthState::Restarting);
        tracker = d.tracker;

        let d = apply(&config, &tracker, &sample(120, "good"));
        assert_eq!(d.tracker.state, HealthState::Healthy);
        assert_eq!(d.tracker.consecutive_failures, 0);
        let n = d.action.notification().expect("Recovery should notify");
        assert_eq!(n.kind, NotificationKind::Recovered);
        assert_eq!(n.title, "Stream Recovered");
        assert!(!d.action.restarts());
    }

    #[test]
    fn no_restart_when_disabled() {
        let config = config(3, 600, false);
        let mut tracker = healthy_tracker();
        let mut notifications = 0;

        for i in 0..20 {
            let d = apply(&config, &tracker, &sample(i * 30, "error"));
            assert!(!d.action.restarts());
            if d.action.notification().is_some() {
                notifications += 1;
            }
            if i >= 2 {
                assert_eq!(d.tracker.state, HealthState::Failed);
            }
            tracker = d.tracker;
        }

        assert_eq!(notifications, 1);
        assert_eq!(tracker.restarts, 0);
    }

    #[test]
    fn threshold_reached_on_nth_sample() {
        for threshold in 1..=6 {
            let config = config(threshold, 600, false);
            let mut tracker = healthy_tracker();
            for i in 1..=threshold {
                let d = apply(&config, &tracker, &sample(i as i64, "bad"));
                if i < threshold {
                    assert_eq!(d.tracker.state, HealthState::Healthy);
                } else {
                    assert_eq!(d.tracker.state, HealthState::Failed);
                }
                tracker = d.tracker;
            }
        }
    }

    #[test]
    fn healthy_sample_resets_counter() {
        let config = config(3, 600, true);
        let mut tracker = healthy_tracker();
        for (i, status) in ["bad", "bad", "good", "bad", "bad"].iter().enumerate() {
            tracker = apply(&config, &tracker, &sample(i as i64, status)).tracker;
        }
        assert_eq!(tracker.state, HealthState::Healthy);
        assert_eq!(tracker.consecutive_failures, 2);
    }

    #[test]
    fn ok_health_counts_as_healthy() {
        let config = config(2, 600, true);
        let mut tracker = healthy_tracker();

        // Quality swings between good and ok are not state changes.
        for (i, status) in ["ok", "good"].iter().cycle().take(10).enumerate() {
            let d = apply(&config, &tracker, &sample(i as i64, status));
            assert_eq!(d.tracker.state, HealthState::Healthy);
            assert_eq!(d.action, Action::None);
            tracker = d.tracker;
        }

        let d = apply(&config, &tracker, &sample(20, "bad"));
        assert_eq!(d.tracker.state, HealthState::Healthy);
        let d = apply(&config, &d.tracker, &sample(21, "bad"));
        assert_eq!(d.tracker.state, HealthState::Restarting);
    }

    #[test]
    fn ok_sample_recovers_any_state() {
        let config = config(3, 600, true);

        for from in [
            HealthState::Failed,
            HealthState::Restarting,
            HealthState::Unknown,
            HealthState::Degraded,
        ] {
            let tracker = Tracker {
                state: from,
                consecutive_failures: 2,
                cooldown_until: Some(at(600)),
                ..Default::default()
            };

            let d = apply(&config, &tracker, &sample(0, "ok"));
            assert_eq!(d.tracker.state, HealthState::Healthy);
            assert_eq!(d.tracker.consecutive_failures, 0);
            let n = d.action.notification().expect("Recovery should notify");
            assert_eq!(n.kind, NotificationKind::Recovered);
            if matches!(from, HealthState::Failed | HealthState::Restarting) {
                assert_eq!(n.title, "Stream Recovered");
            } else {
                assert_eq!(n.title, "Stream Healthy");
            }
        }
    }

    #[test]
    fn unknown_start_reaches_failed() {
        let config = config(2, 600, false);
        let tracker = Tracker::default();

        let d = apply(&config, &tracker, &sample(0, "error"));
        assert_eq!(d.tracker.state, HealthState::Unknown);
        assert_eq!(d.action, Action::None);

        let d = apply(&config, &d.tracker, &sample(1, "error"));
        assert_eq!(d.tracker.state, HealthState::Failed);
        let n = d.action.notification().expect("Failure should notify");
        assert!(n.message.contains("unknown → failed"));
        assert!(n.message.contains("Auto-restart is disabled."));
    }

    #[test]
    fn restart_window_elapsed_goes_unknown_then_restarts_again() {
        let config = config(2, 100, true);
        let mut tracker = healthy_tracker();

        tracker = apply(&config, &tracker, &sample(0, "bad")).tracker;
        let d = apply(&config, &tracker, &sample(10, "bad"));
        assert!(d.action.restarts());
        tracker = d.tracker;

        let d = apply(&config, &tracker, &sample(109, "bad"));
        assert_eq!(d.tracker.state, HealthState::Restarting);
        assert_eq!(d.action, Action::None);
        tracker = d.tracker;

        let d = apply(&config, &tracker, &sample(110, "bad"));
        assert_eq!(d.tracker.state, HealthState::Unknown);
        assert_eq!(d.tracker.consecutive_failures, 1);
        assert_eq!(
            d.action.notification().map(|n| n.title.as_str()),
            Some("Restart Did Not Recover Stream")
        );
        tracker = d.tracker;

        let d = apply(&config, &tracker, &sample(140, "bad"));
        assert_eq!(d.tracker.state, HealthState::Restarting);
        assert!(matches!(d.action, Action::NotifyAndRestart(_)));
        assert_eq!(d.tracker.restarts, 2);
    }

    #[test]
    fn threshold_one_restarts_again_without_notifying() {
        let config = config(1, 100, true);
        let mut tracker = healthy_tracker();

        let d = apply(&config, &tracker, &sample(0, "bad"));
        assert!(matches!(d.action, Action::NotifyAndRestart(_)));
        tracker = d.tracker;

        let d = apply(&config, &tracker, &sample(100, "bad"));
        assert_eq!(d.tracker.state, HealthState::Restarting);
        assert_eq!(d.action, Action::Restart);
    }

    #[test]
    fn failed_restart_still_sets_cooldown() {
        let config = config(1, 300, true);
        let tracker = healthy_tracker();

        let s = sample(0, "bad");
        let mut d = evaluate(&config, &tracker, &s);
        d.tracker.record_attempt(RestartAttempt {
            initiated_at: at(1),
            outcome: RestartOutcome::Failed("503 Service Unavailable".into()),
            cooldown_until: config.cooldown_deadline(at(1)),
        });
        assert!(d.tracker.cooldown_active(at(300)));
        assert!(!d.tracker.cooldown_active(at(301)));
    }

    #[test]
    fn max_restarts_leaves_stream_failed() {
        let config = MonitorConfig {
            max_restarts: Some(1),
            ..config(1, 60, true)
        };
        let mut tracker = healthy_tracker();
        let mut restarts = 0;

        for i in 0..20 {
            let d = apply(&config, &tracker, &sample(i * 30, "noData"));
            if d.action.restarts() {
                restarts += 1;
            }
            tracker = d.tracker;
        }

        assert_eq!(restarts, 1);
        assert_eq!(tracker.state, HealthState::Failed);
        assert_eq!(tracker.restarts, 1);
    }

    #[test]
    fn failed_restarts_when_cooldown_expires() {
        let config = config(1, 100, true);
        let mut tracker = Tracker {
            state: HealthState::Failed,
            cooldown_until: Some(at(50)),
            ..Default::default()
        };

        let d = apply(&config, &tracker, &sample(0, "bad"));
        assert_eq!(d.action, Action::None);
        tracker = d.tracker;

        let d = apply(&config, &tracker, &sample(50, "bad"));
        assert_eq!(d.tracker.state, HealthState::Restarting);
        let n = d.action.notification().expect("Restart should notify");
        assert!(n.message.contains("Still unhealthy"));
    }

    // Every sequence of good/ok/bad samples up to length 8, checked against
    // the notification, threshold and cooldown rules.
    #[test]
    fn exhaustive_sequences() {
        const STATUSES: [&str; 3] = ["good", "ok", "bad"];
        const LEN: u32 = 8;

        for (threshold, cooldown, auto_restart) in
            [(1, 45, true), (2, 100, true), (3, 600, true), (2, 100, false)]
        {
            let config = config(threshold, cooldown, auto_restart);

            for seq in 0..STATUSES.len().pow(LEN) {
                let mut tracker = Tracker::default();
                let mut rest = seq;
                let mut changes = 0;
                let mut notifies = 0;
                let mut last_restart: Option<DateTime<Utc>> = None;
                let mut unhealthy_run = 0;

                for i in 0..LEN {
                    let status = STATUSES[rest % STATUSES.len()];
                    rest /= STATUSES.len();

                    let s = sample(i as i64 * 30, status);
                    let before = tracker.state;
                    let d = apply(&config, &tracker, &s);

                    if d.tracker.state != before {
                        changes += 1;
                    }
                    if d.action.notification().is_some() {
                        notifies += 1;
                    }
                    if d.action.restarts() {
                        assert!(auto_restart);
                        if let Some(prev) = last_restart {
                            assert!(
                                s.timestamp - prev
                                    >= chrono::Duration::seconds(cooldown as i64)
                            );
                        }
                        last_restart = Some(s.timestamp);
                    }

                    if s.is_receiving_data {
                        unhealthy_run = 0;
                        assert_eq!(d.tracker.state, HealthState::Healthy);
                    } else {
                        unhealthy_run += 1;
                        if before == HealthState::Healthy && unhealthy_run < threshold {
                            assert_eq!(d.tracker.state, HealthState::Healthy);
                        }
                    }

                    tracker = d.tracker;
                }

                assert_eq!(
                    changes, notifies,
                    "sequence {} (threshold {})",
                    seq, threshold
                );
            }
        }
    }
}
