//! Monitor loop driver.
//!
//! Owns the tracked health state and the cadence. A tick (probe, evaluate,
//! effects) always runs to completion; cancellation is only observed between
//! ticks and while waiting for the next one.

use std::{collections::VecDeque, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    azuracast::RestartControl,
    config::MonitorConfig,
    health::{self, Action, Decision, HealthState, RestartAttempt, RestartOutcome, Tracker},
    notify::{Notification, NotificationKind, Notifier},
    probe::{HealthSample, StatusProbe, StreamIdentity},
    stats::MonitorStatistics,
    util,
};

const ATTEMPT_LOG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Running,
    Stopping,
    Stopped,
}

/// What the operator sees when monitoring starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartupInfo {
    pub stream_title: String,
    pub initial_health: String,
    pub station_name: Option<String>,
    pub now_playing: Option<String>,
    pub broadcast_title: Option<String>,
    pub broadcast_status: Option<String>,
    pub broadcast_url: Option<String>,
}

pub struct Monitor {
    stream: StreamIdentity,
    config: MonitorConfig,
    prober: Box<dyn StatusProbe>,
    restarter: Option<Box<dyn RestartControl>>,
    notifier: Box<dyn Notifier>,
    tracker: Tracker,
    attempts: VecDeque<RestartAttempt>,
    stats: MonitorStatistics,
    state: DriverState,
}

impl Monitor {
    pub fn new(
        stream: StreamIdentity,
        config: MonitorConfig,
        prober: Box<dyn StatusProbe>,
        restarter: Option<Box<dyn RestartControl>>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            stream,
            config,
            prober,
            restarter,
            notifier,
            tracker: Tracker::default(),
            attempts: VecDeque::with_capacity(ATTEMPT_LOG_LEN),
            stats: MonitorStatistics::new(),
            state: DriverState::Stopped,
        }
    }

    pub fn health(&self) -> HealthState {
        self.tracker.state
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn stats(&self) -> &MonitorStatistics {
        &self.stats
    }

    pub fn driver_state(&self) -> DriverState {
        self.state
    }

    /// Most recent restart attempts, oldest first.
    pub fn attempts(&self) -> impl Iterator<Item = &RestartAttempt> {
        self.attempts.iter()
    }

    pub async fn announce(&mut self, info: &StartupInfo) {
        info!("Stream: {} ({})", info.stream_title, self.stream);
        if let Some(title) = &info.broadcast_title {
            info!(
                "Broadcast: {} [{}] {}",
                title,
                info.broadcast_status.as_deref().unwrap_or("-"),
                info.broadcast_url.as_deref().unwrap_or("")
            );
        }
        if let Some(station) = &info.station_name {
            info!("Station: {}", station);
        }
        if let Some(track) = &info.now_playing {
            info!("Now playing: {}", track);
        }
        info!("Current health: {}", info.initial_health);
        info!(
            "Interval {}, fail interval {}, {} failures before action, cooldown {}, auto-restart {}",
            util::format_duration(self.config.interval),
            util::format_duration(self.config.fail_interval),
            self.config.failure_threshold,
            util::format_duration(self.config.restart_cooldown),
            self.config.auto_restart,
        );

        let notification = self.startup_notification(info);
        self.send(notification).await;
    }

    fn startup_notification(&self, info: &StartupInfo) -> Notification {
        let mut msg = String::new();
        if let Some(station) = &info.station_name {
            msg += &format!("**Station:** {}\n", station);
        }
        if let Some(title) = &info.broadcast_title {
            match &info.broadcast_url {
                Some(url) => msg += &format!("**Broadcast:** [{}]({})\n", title, url),
                None => msg += &format!("**Broadcast:** {}\n", title),
            }
            if let Some(status) = &info.broadcast_status {
                msg += &format!("**Status:** {}\n", status);
            }
        }
        msg += &format!("**Stream:** {} (`{}`)\n", info.stream_title, self.stream);
        msg += &format!("**Stream Health:** {}\n", info.initial_health);
        if let Some(track) = &info.now_playing {
            msg += &format!("**Now Playing:** {}\n", track);
        }
        msg += "\n**Settings:**\n";
        msg += &format!(
            "• Check interval: {}\n",
            util::format_duration(self.config.interval)
        );
        msg += &format!(
            "• Fail interval: {}\n",
            util::format_duration(self.config.fail_interval)
        );
        msg += &format!(
            "• Failures before restart: {}\n",
            self.config.failure_threshold
        );
        msg += &format!(
            "• Restart cooldown: {}\n",
            util::format_duration(self.config.restart_cooldown)
        );
        msg += &format!("• Auto-restart: {}", self.config.auto_restart);

        Notification::new(NotificationKind::Info, "Stream Monitor Started", msg)
    }

    /// Runs until `token` is cancelled.
    pub async fn run(&mut self, token: CancellationToken) {
        self.state = DriverState::Running;
        info!("Watching stream {}", self.stream);

        while !token.is_cancelled() {
            self.tick().await;

            let wait = self.next_wait();
            debug!("Next check in {}", util::format_duration(wait));
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.state = DriverState::Stopping;
        info!("Monitoring stopped. {}", self.stats.summary());

        let notification = Notification::new(
            NotificationKind::Info,
            "Stream Monitor Stopped",
            format!(
                "Stream `{}` was **{}**.\nTotal restarts: {}\n{}.",
                self.stream,
                self.tracker.state,
                self.tracker.restarts,
                self.stats.summary()
            ),
        );
        self.send(notification).await;

        self.state = DriverState::Stopped;
    }

    fn next_wait(&self) -> Duration {
        // Any failure since the last good sample switches to the fast cadence.
        match (self.tracker.state, self.tracker.consecutive_failures) {
            (HealthState::Healthy, 0) => self.config.interval,
            _ => self.config.fail_interval,
        }
    }

    /// One probe, one decision and its effects.
    pub async fn tick(&mut self) -> HealthState {
        let sample = self.prober.probe(&self.stream).await;
        let Decision {
            mut tracker,
            action,
        } = health::evaluate(&self.config, &self.tracker, &sample);

        self.log_sample(&sample, &tracker);
        self.stats.ticks += 1;
        if !sample.is_receiving_data {
            self.stats.unhealthy_samples += 1;
        }

        match action {
            Action::None => (),
            Action::Notify(n) => self.send(n).await,
            Action::Restart => {
                let attempt = self.restart().await;
                tracker.record_attempt(attempt);
            }
            Action::NotifyAndRestart(n) => {
                let attempt = self.restart().await;
                let n = n.with_line(&format!("Restart {}.", attempt.outcome));
                tracker.record_attempt(attempt);
                self.send(n).await;
            }
        }

        if tracker.state != self.tracker.state {
            info!(
                "Stream {} is now {} (was {})",
                self.stream, tracker.state, self.tracker.state
            );
        }
        self.tracker = tracker;
        self.tracker.state
    }

    fn log_sample(&self, sample: &HealthSample, next: &Tracker) {
        if sample.is_good() {
            info!("Health: {} [{}]", sample.status, next.state);
        } else if sample.is_receiving_data {
            info!(
                "Health: {} [{}] (reduced quality)",
                sample.describe(),
                next.state
            );
        } else {
            warn!(
                "Health: {} [{}] (failures: {}/{})",
                sample.describe(),
                next.state,
                next.consecutive_failures,
                self.config.failure_threshold
            );
        }
    }

    async fn restart(&mut self) -> RestartAttempt {
        let attempt = match &self.restarter {
            Some(r) => r.restart(&self.stream).await,
            None => {
                let now = chrono::Utc::now();
                RestartAttempt {
                    initiated_at: now,
                    outcome: RestartOutcome::Failed("no restart controller configured".into()),
                    cooldown_until: self.config.cooldown_deadline(now),
                }
            }
        };

        self.stats.restarts += 1;
        match &attempt.outcome {
            RestartOutcome::Acknowledged => info!(
                "Restart acknowledged (total restarts: {})",
                self.stats.restarts
            ),
            outcome => {
                self.stats.restarts_failed += 1;
                error!("Restart {}", outcome);
            }
        }

        if self.attempts.len() == ATTEMPT_LOG_LEN {
            self.attempts.pop_front();
        }
        self.attempts.push_back(attempt.clone());

        attempt
    }

    /// Delivers within the configured timeout or gives up. Never fails.
    async fn send(&mut self, notification: Notification) {
        match tokio::time::timeout(
            self.config.notify_timeout,
            self.notifier.notify(&notification),
        )
        .await
        {
            Ok(Ok(())) => self.stats.notifications_sent += 1,
            Ok(Err(e)) => {
                self.stats.notifications_failed += 1;
                warn!("Notification '{}' failed: {}", notification.title, e);
            }
            Err(_) => {
                self.stats.notifications_failed += 1;
                warn!(
                    "Notification '{}' abandoned after {}",
                    notification.title,
                    util::format_duration(self.config.notify_timeout)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio::time::Instant;

    use super::*;
    use crate::notify::NotifyError;

    /// Wall-clock timestamps that follow tokio's (paused) clock.
    #[derive(Clone)]
    struct TestClock {
        base: DateTime<Utc>,
        start: Instant,
    }

    impl TestClock {
        fn new() -> Self {
            Self {
                base: "2024-02-15T08:00:00Z".parse().unwrap(),
                start: Instant::now(),
            }
        }

        fn now(&self) -> DateTime<Utc> {
            self.base + chrono::Duration::from_std(self.start.elapsed()).unwrap()
        }
    }

    struct ScriptedProbe {
        clock: TestClock,
        script: Mutex<VecDeque<&'static str>>,
        calls: Arc<AtomicUsize>,
        /// Cancelled once the script is used up.
        done: Option<CancellationToken>,
    }

    #[async_trait]
    impl StatusProbe for ScriptedProbe {
        async fn probe(&self, _stream: &StreamIdentity) -> HealthSample {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            let status = script.pop_front().unwrap_or("good");
            if script.is_empty() {
                if let Some(token) = &self.done {
                    token.cancel();
                }
            }

            if status == "error" {
                return HealthSample::from_error("connection reset", self.clock.now());
            }
            HealthSample {
                timestamp: self.clock.now(),
                is_receiving_data: matches!(status, "good" | "ok"),
                status: status.to_string(),
                stream_status: None,
                detail: None,
            }
        }
    }

    struct FakeRestarter {
        clock: TestClock,
        config: MonitorConfig,
        outcome: RestartOutcome,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RestartControl for FakeRestarter {
        async fn restart(&self, _stream: &StreamIdentity) -> RestartAttempt {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.clock.now();
            RestartAttempt {
                initiated_at: now,
                outcome: self.outcome.clone(),
                cooldown_until: self.config.cooldown_deadline(now),
            }
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        sent: Arc<Mutex<Vec<Notification>>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    impl RecordingNotifier {
        fn titles(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|n| n.title.clone())
                .collect()
        }
    }

    struct Harness {
        monitor: Monitor,
        probes: Arc<AtomicUsize>,
        restarts: Arc<AtomicUsize>,
        notifier: RecordingNotifier,
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(300),
            fail_interval: Duration::from_secs(30),
            failure_threshold: 3,
            restart_cooldown: Duration::from_secs(600),
            auto_restart: true,
            max_restarts: None,
            notify_timeout: Duration::from_secs(10),
            notification_target: None,
        }
    }

    fn harness(
        config: MonitorConfig,
        script: &[&'static str],
        outcome: Option<RestartOutcome>,
        notifier: RecordingNotifier,
        done: Option<CancellationToken>,
    ) -> Harness {
        let clock = TestClock::new();
        let probes = Arc::new(AtomicUsize::new(0));
        let restarts = Arc::new(AtomicUsize::new(0));

        let prober = ScriptedProbe {
            clock: clock.clone(),
            script: Mutex::new(script.iter().copied().collect()),
            calls: probes.clone(),
            done,
        };
        let restarter = outcome.map(|outcome| {
            Box::new(FakeRestarter {
                clock,
                config: config.clone(),
                outcome,
                calls: restarts.clone(),
            }) as Box<dyn RestartControl>
        });

        Harness {
            monitor: Monitor::new(
                StreamIdentity::parse("stream-1").unwrap(),
                config,
                Box::new(prober),
                restarter,
                Box::new(notifier.clone()),
            ),
            probes,
            restarts,
            notifier,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restart_and_recover() {
        let token = CancellationToken::new();
        let mut h = harness(
            config(),
            &["good", "noData", "noData", "noData", "bad", "good"],
            Some(RestartOutcome::Acknowledged),
            RecordingNotifier::default(),
            Some(token.clone()),
        );

        h.monitor.run(token).await;

        assert_eq!(h.probes.load(Ordering::SeqCst), 6);
        assert_eq!(h.restarts.load(Ordering::SeqCst), 1);
        assert_eq!(h.monitor.health(), HealthState::Healthy);
        assert_eq!(h.monitor.driver_state(), DriverState::Stopped);
        assert_eq!(
            h.notifier.titles(),
            vec![
                "Stream Healthy",
                "Restarting Source",
                "Stream Recovered",
                "Stream Monitor Stopped"
            ]
        );

        let sent = h.notifier.sent.lock().unwrap();
        assert!(sent[1].message.contains("Restart acknowledged."));
        assert_eq!(h.monitor.stats().ticks, 6);
        assert_eq!(h.monitor.stats().unhealthy_samples, 4);
        assert_eq!(h.monitor.attempts().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_sleep_stops_before_next_probe() {
        let token = CancellationToken::new();
        let h = harness(
            config(),
            &["good"; 10],
            Some(RestartOutcome::Acknowledged),
            RecordingNotifier::default(),
            None,
        );
        let probes = h.probes.clone();
        let mut monitor = h.monitor;

        let start = Instant::now();
        let handle = {
            let token = token.clone();
            tokio::spawn(async move {
                monitor.run(token).await;
                monitor
            })
        };

        tokio::time::sleep(Duration::from_secs(100)).await;
        token.cancel();
        let monitor = handle.await.unwrap();

        assert_eq!(probes.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(300));
        assert_eq!(monitor.driver_state(), DriverState::Stopped);
        assert_eq!(monitor.stats().ticks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_restart_is_reported_and_not_repeated_in_cooldown() {
        let token = CancellationToken::new();
        let mut h = harness(
            config(),
            &["error"; 12],
            Some(RestartOutcome::Failed("403 Forbidden".into())),
            RecordingNotifier::default(),
            Some(token.clone()),
        );

        h.monitor.run(token).await;

        // 12 checks 30s apart span 330s, inside the 600s cooldown.
        assert_eq!(h.restarts.load(Ordering::SeqCst), 1);
        assert_eq!(h.monitor.health(), HealthState::Restarting);
        assert_eq!(h.monitor.stats().restarts_failed, 1);

        let sent = h.notifier.sent.lock().unwrap();
        let restart = sent
            .iter()
            .find(|n| n.title == "Restarting Source")
            .expect("Restart should be notified");
        assert!(restart.message.contains("Restart failed: 403 Forbidden."));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_only_mode_never_restarts() {
        let token = CancellationToken::new();
        let mut h = harness(
            MonitorConfig {
                auto_restart: false,
                ..config()
            },
            &["bad"; 8],
            Some(RestartOutcome::Acknowledged),
            RecordingNotifier::default(),
            Some(token.clone()),
        );

        h.monitor.run(token).await;

        assert_eq!(h.restarts.load(Ordering::SeqCst), 0);
        assert_eq!(h.monitor.health(), HealthState::Failed);
        assert_eq!(
            h.notifier.titles(),
            vec!["Stream Failed", "Stream Monitor Stopped"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_controller_records_failed_attempt() {
        let mut h = harness(
            config(),
            &["bad"],
            None,
            RecordingNotifier::default(),
            None,
        );
        h.monitor.config.failure_threshold = 1;

        assert_eq!(h.monitor.tick().await, HealthState::Restarting);
        let attempt = h.monitor.tracker().last_attempt.clone().unwrap();
        assert!(matches!(attempt.outcome, RestartOutcome::Failed(_)));
        assert!(h.monitor.tracker().cooldown_until.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_notifier_is_abandoned() {
        let notifier = RecordingNotifier {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let mut h = harness(config(), &["good"], None, notifier, None);

        let start = Instant::now();
        h.monitor.tick().await;

        assert!(start.elapsed() <= Duration::from_secs(11));
        assert_eq!(h.monitor.stats().notifications_failed, 1);
        assert!(h.notifier.titles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn announce_sends_startup_summary() {
        let mut h = harness(config(), &[], None, RecordingNotifier::default(), None);

        h.monitor
            .announce(&StartupInfo {
                stream_title: "Lofi radio 24/7".into(),
                initial_health: "good".into(),
                station_name: Some("Lofi Radio".into()),
                now_playing: Some("Nujabes - Aruarian Dance".into()),
                broadcast_title: Some("Lofi radio 24/7".into()),
                broadcast_status: Some("live".into()),
                broadcast_url: Some("https://youtube.com/live/bc-live".into()),
            })
            .await;

        let sent = h.notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Stream Monitor Started");
        assert!(sent[0]
            .message
            .contains("**Broadcast:** [Lofi radio 24/7](https://youtube.com/live/bc-live)"));
        assert!(sent[0].message.contains("• Failures before restart: 3"));
    }
}
