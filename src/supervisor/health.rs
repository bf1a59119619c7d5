//! Per-server health bookkeeping.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health state of one supervised server. Mutated only by the supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    /// Failed checks since the last success.
    pub consecutive_failures: u32,
    /// When the last check ran.
    pub last_check: Option<DateTime<Utc>>,
    /// When the last restart was attempted.
    pub last_restart_attempt: Option<DateTime<Utc>>,
    /// Restarts performed since launch or the last reset.
    pub restart_count: u32,
    /// Whether failed processes may be restarted.
    pub auto_restart_enabled: bool,
    /// Why the last check or launch failed.
    pub last_failure_reason: Option<String>,
    #[serde(skip)]
    restart_attempted_at: Option<Instant>,
}

impl HealthRecord {
    /// A fresh record.
    #[must_use]
    pub const fn new(auto_restart_enabled: bool) -> Self {
        Self {
            consecutive_failures: 0,
            last_check: None,
            last_restart_attempt: None,
            restart_count: 0,
            auto_restart_enabled,
            last_failure_reason: None,
            restart_attempted_at: None,
        }
    }

    /// Records a passing check.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_check = Some(Utc::now());
    }

    /// Records a failing check and returns the new failure streak.
    pub fn record_failure(&mut self, reason: impl Into<String>) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_check = Some(Utc::now());
        self.last_failure_reason = Some(reason.into());
        self.consecutive_failures
    }

    /// True once the failure streak reaches `threshold`.
    #[must_use]
    pub const fn should_restart(&self, threshold: u32) -> bool {
        self.consecutive_failures >= threshold
    }

    /// True while another restart is permitted.
    #[must_use]
    pub const fn may_restart(&self, max_restarts: u32) -> bool {
        self.auto_restart_enabled && self.restart_count < max_restarts
    }

    /// Stamps a restart attempt and bumps the counter.
    pub fn mark_restart_attempt(&mut self, now: Instant) {
        self.restart_attempted_at = Some(now);
        self.last_restart_attempt = Some(Utc::now());
        self.restart_count = self.restart_count.saturating_add(1);
        self.consecutive_failures = 0;
    }

    /// Time still to wait before the next restart, measured from the last
    /// attempt. Zero when no restart has been attempted yet.
    #[must_use]
    pub fn backoff_remaining(&self, backoff: Duration, now: Instant) -> Duration {
        self.restart_attempted_at.map_or(Duration::ZERO, |at| {
            backoff.saturating_sub(now.saturating_duration_since(at))
        })
    }

    /// Clears counters after operator intervention.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.restart_count = 0;
        self.last_failure_reason = None;
        self.restart_attempted_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_accumulate_until_success() {
        let mut record = HealthRecord::new(true);
        assert_eq!(record.record_failure("dead"), 1);
        assert_eq!(record.record_failure("dead"), 2);
        assert!(!record.should_restart(3));
        assert_eq!(record.record_failure("dead"), 3);
        assert!(record.should_restart(3));

        record.record_success();
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.last_failure_reason.as_deref(), Some("dead"));
    }

    #[test]
    fn restart_ceiling() {
        let mut record = HealthRecord::new(true);
        let now = Instant::now();
        assert!(record.may_restart(2));
        record.mark_restart_attempt(now);
        record.mark_restart_attempt(now);
        assert_eq!(record.restart_count, 2);
        assert!(!record.may_restart(2));

        record.reset();
        assert!(record.may_restart(2));
    }

    #[test]
    fn auto_restart_disabled_forbids_restart() {
        let record = HealthRecord::new(false);
        assert!(!record.may_restart(5));
    }

    #[test]
    fn backoff_measured_from_last_attempt() {
        let mut record = HealthRecord::new(true);
        let start = Instant::now();
        assert_eq!(record.backoff_remaining(Duration::from_secs(4), start), Duration::ZERO);

        record.mark_restart_attempt(start);
        let later = start + Duration::from_secs(1);
        assert_eq!(
            record.backoff_remaining(Duration::from_secs(4), later),
            Duration::from_secs(3)
        );
        let much_later = start + Duration::from_secs(10);
        assert_eq!(
            record.backoff_remaining(Duration::from_secs(4), much_later),
            Duration::ZERO
        );
    }
}
