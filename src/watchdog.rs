use std::time::Duration;

use tokio::time::Instant;

#[derive(Clone, Copy, Debug)]
pub struct WatchdogConfig {
    pub tick: Duration,
    pub grace_multiple: u32,
    pub miss_threshold: u32,
}

impl WatchdogConfig {
    pub fn grace(&self) -> Duration {
        self.tick * self.grace_multiple.max(1)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WatchdogRecord {
    pub last_heartbeat: Option<Instant>,
    pub last_market_data: Option<Instant>,
    pub consecutive_misses: u32,
    pub recovery_in_progress: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Poll history for every subscribed series.
    Probe,
    Reconnect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    Fresh,
    Stale,
    Failed,
}

/// Liveness tracking driven by an explicit clock.
#[derive(Debug)]
pub struct RecoveryWatchdog {
    config: WatchdogConfig,
    record: WatchdogRecord,
    armed_at: Instant,
}

impl RecoveryWatchdog {
    pub fn new(config: WatchdogConfig, now: Instant) -> Self {
        Self {
            config,
            record: WatchdogRecord::default(),
            armed_at: now,
        }
    }

    pub fn record(&self) -> WatchdogRecord {
        self.record
    }

    fn last_activity(&self) -> Instant {
        [self.record.last_heartbeat, self.record.last_market_data]
            .into_iter()
            .flatten()
            .chain(std::iter::once(self.armed_at))
            .max()
            .unwrap_or(self.armed_at)
    }

    /// One scheduled check. Returns the recovery to start, if any.
    pub fn tick(&mut self, now: Instant, has_subscriptions: bool) -> Option<RecoveryAction> {
        let silent_for = now.saturating_duration_since(self.last_activity());
        if silent_for <= self.config.grace() {
            return None;
        }
        self.record.consecutive_misses = self.record.consecutive_misses.saturating_add(1);
        tracing::debug!(
            misses = self.record.consecutive_misses,
            ?silent_for,
            in_progress = self.record.recovery_in_progress,
            "watchdog_miss"
        );
        if self.record.consecutive_misses < self.config.miss_threshold
            || self.record.recovery_in_progress
        {
            return None;
        }
        self.record.recovery_in_progress = true;
        let action = if has_subscriptions {
            RecoveryAction::Probe
        } else {
            RecoveryAction::Reconnect
        };
        tracing::warn!(misses = self.record.consecutive_misses, ?action, "watchdog_recovery");
        Some(action)
    }

    fn on_data(&mut self) {
        self.record.consecutive_misses = 0;
        self.record.recovery_in_progress = false;
    }

    pub fn on_heartbeat(&mut self, now: Instant) {
        self.record.last_heartbeat = Some(now);
        self.on_data();
    }

    pub fn on_market_data(&mut self, now: Instant) {
        self.record.last_market_data = Some(now);
        self.on_data();
    }

    /// A failed or stale probe escalates to a reconnect.
    pub fn on_probe_finished(&mut self, result: ProbeResult, now: Instant) -> Option<RecoveryAction> {
        match result {
            ProbeResult::Fresh => {
                self.on_market_data(now);
                None
            }
            ProbeResult::Stale | ProbeResult::Failed => {
                tracing::warn!(?result, "watchdog_probe_escalation");
                self.record.recovery_in_progress = true;
                Some(RecoveryAction::Reconnect)
            }
        }
    }

    /// Connection is `Ready` again; start a fresh observation window.
    pub fn on_recovered(&mut self, now: Instant) {
        self.armed_at = now;
        self.record.last_heartbeat = None;
        self.record.last_market_data = None;
        self.on_data();
    }
}
