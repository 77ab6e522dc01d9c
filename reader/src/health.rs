//! Health state machine.
//!
//! Counts consecutive poll failures and decides when the chip needs a reset.
//! Repeated reset failures back off exponentially and stop at the
//! configured ceiling until a poll succeeds again.

use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{DeviceConfig, ResetPolicy};
use crate::error::Error;
use crate::events::Diagnostic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    #[default]
    Healthy,
    Degraded,
    Resetting,
}

/// What the scheduler should do after a failure was recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthAction {
    None,
    /// Run the reset sequence now.
    Reset { attempt: u8 },
    Diagnostic(Diagnostic),
}

#[derive(Debug)]
pub struct HealthMonitor {
    enabled: bool,
    auto_reset: bool,
    max_failed_checks: u8,
    policy: ResetPolicy,
    state: Health,
    consecutive_failures: u32,
    last_success: Option<Instant>,
    reset_attempts: u8,
    next_reset_at: Option<Instant>,
    exhausted_reported: bool,
    threshold_reported: bool,
}

impl HealthMonitor {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            enabled: config.health_check_enabled,
            auto_reset: config.auto_reset_on_failure,
            max_failed_checks: config.max_failed_checks,
            policy: config.reset,
            state: Health::Healthy,
            consecutive_failures: 0,
            last_success: None,
            reset_attempts: 0,
            next_reset_at: None,
            exhausted_reported: false,
            threshold_reported: false,
        }
    }

    pub fn state(&self) -> Health {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    /// Failed reset attempts since the last successful poll.
    pub fn reset_attempts(&self) -> u8 {
        self.reset_attempts
    }

    pub fn next_reset_at(&self) -> Option<Instant> {
        self.next_reset_at
    }

    pub fn record_success(&mut self, now: Instant) {
        if self.state != Health::Healthy || self.consecutive_failures > 0 {
            info!(
                previous = ?self.state,
                failures = self.consecutive_failures,
                "reader healthy again"
            );
        }
        self.state = Health::Healthy;
        self.consecutive_failures = 0;
        self.last_success = Some(now);
        self.reset_attempts = 0;
        self.next_reset_at = None;
        self.exhausted_reported = false;
        self.threshold_reported = false;
    }

    pub fn record_failure(&mut self, now: Instant, error: &Error) -> HealthAction {
        if !error.is_chip_fault() {
            return HealthAction::None;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        warn!(failures = self.consecutive_failures, %error, "poll failed");

        if !self.enabled {
            return HealthAction::None;
        }
        if self.state == Health::Healthy {
            self.state = Health::Degraded;
        }
        if self.consecutive_failures < u32::from(self.max_failed_checks) {
            return HealthAction::None;
        }

        if !self.auto_reset {
            if self.threshold_reported {
                return HealthAction::None;
            }
            self.threshold_reported = true;
            warn!(
                max_failed_checks = self.max_failed_checks,
                "failure threshold reached, automatic reset disabled"
            );
            return HealthAction::Diagnostic(Diagnostic::FailureThreshold {
                consecutive_failures: self.consecutive_failures,
                max_failed_checks: self.max_failed_checks,
            });
        }

        if self.reset_attempts >= self.policy.max_attempts {
            if self.exhausted_reported {
                return HealthAction::None;
            }
            self.exhausted_reported = true;
            warn!(attempts = self.reset_attempts, "reset attempts exhausted");
            return HealthAction::Diagnostic(Diagnostic::RecoveryExhausted {
                attempts: self.reset_attempts,
            });
        }
        if self.next_reset_at.is_some_and(|at| now < at) {
            return HealthAction::None;
        }

        self.state = Health::Resetting;
        HealthAction::Reset {
            attempt: self.reset_attempts + 1,
        }
    }

    pub fn reset_succeeded(&mut self, now: Instant) {
        info!(attempt = self.reset_attempts + 1, "chip reset succeeded");
        self.record_success(now);
    }

    /// Back to Degraded with the counter intact; the next attempt waits out
    /// the backoff.
    pub fn reset_failed(&mut self, now: Instant) {
        self.reset_attempts = self.reset_attempts.saturating_add(1);
        let backoff = self.policy.backoff(self.reset_attempts);
        self.next_reset_at = Some(now + backoff);
        self.state = Health::Degraded;
        warn!(
            attempt = self.reset_attempts,
            backoff_ms = backoff.as_millis() as u64,
            "chip reset failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn monitor(configure: impl FnOnce(&mut DeviceConfig)) -> HealthMonitor {
        let mut config = DeviceConfig::default();
        configure(&mut config);
        HealthMonitor::new(&config)
    }

    fn fail(monitor: &mut HealthMonitor, now: Instant) -> HealthAction {
        monitor.record_failure(now, &Error::TransportTimeout)
    }

    #[test]
    fn below_threshold_stays_degraded() {
        let now = Instant::now();
        for max in 1..=10u8 {
            let mut health = monitor(|c| c.max_failed_checks = max);
            for n in 1..max {
                assert_eq!(fail(&mut health, now), HealthAction::None);
                assert_eq!(health.state(), Health::Degraded);
                assert_eq!(health.consecutive_failures(), u32::from(n));
            }
        }
    }

    #[test]
    fn threshold_requests_exactly_one_reset() {
        let now = Instant::now();
        let mut health = monitor(|c| c.max_failed_checks = 3);

        assert_eq!(fail(&mut health, now), HealthAction::None);
        assert_eq!(fail(&mut health, now), HealthAction::None);
        assert_eq!(fail(&mut health, now), HealthAction::Reset { attempt: 1 });
        assert_eq!(health.state(), Health::Resetting);

        health.reset_succeeded(now);
        assert_eq!(health.state(), Health::Healthy);
        assert_eq!(health.consecutive_failures(), 0);
    }

    #[test]
    fn success_clears_counter() {
        let now = Instant::now();
        let mut health = monitor(|_| {});
        fail(&mut health, now);
        fail(&mut health, now);

        health.record_success(now);

        assert_eq!(health.state(), Health::Healthy);
        assert_eq!(health.consecutive_failures(), 0);
        assert_eq!(health.last_success(), Some(now));
    }

    #[test]
    fn without_auto_reset_counter_grows_past_threshold() {
        let now = Instant::now();
        let mut health = monitor(|c| {
            c.max_failed_checks = 2;
            c.auto_reset_on_failure = false;
        });

        assert_eq!(fail(&mut health, now), HealthAction::None);
        assert!(matches!(
            fail(&mut health, now),
            HealthAction::Diagnostic(Diagnostic::FailureThreshold { consecutive_failures: 2, .. })
        ));
        for _ in 0..20 {
            assert_eq!(fail(&mut health, now), HealthAction::None);
        }
        assert_eq!(health.consecutive_failures(), 22);
        assert_eq!(health.state(), Health::Degraded);
    }

    #[test]
    fn disabled_monitor_counts_but_stays_healthy() {
        let now = Instant::now();
        let mut health = monitor(|c| {
            c.health_check_enabled = false;
            c.max_failed_checks = 1;
        });
        for _ in 0..5 {
            assert_eq!(fail(&mut health, now), HealthAction::None);
        }
        assert_eq!(health.state(), Health::Healthy);
        assert_eq!(health.consecutive_failures(), 5);
    }

    #[test]
    fn unsupported_protocol_is_neutral() {
        let now = Instant::now();
        let mut health = monitor(|_| {});
        fail(&mut health, now);

        let action = health.record_failure(
            now,
            &Error::UnsupportedProtocol {
                protocol: crate::config::Protocol::Felica,
            },
        );

        assert_eq!(action, HealthAction::None);
        assert_eq!(health.consecutive_failures(), 1);
    }

    #[test]
    fn failed_reset_backs_off_then_retries() {
        let start = Instant::now();
        let mut health = monitor(|c| c.max_failed_checks = 1);

        assert_eq!(fail(&mut health, start), HealthAction::Reset { attempt: 1 });
        health.reset_failed(start);
        assert_eq!(health.state(), Health::Degraded);
        assert_eq!(health.consecutive_failures(), 1);

        // Within the 1 s backoff nothing happens.
        assert_eq!(fail(&mut health, start + Duration::from_millis(500)), HealthAction::None);
        assert_eq!(
            fail(&mut health, start + Duration::from_secs(1)),
            HealthAction::Reset { attempt: 2 }
        );
        health.reset_failed(start + Duration::from_secs(1));
        assert_eq!(health.next_reset_at(), Some(start + Duration::from_secs(3)));
    }

    #[test]
    fn reset_ceiling_reports_exhaustion_once() {
        let mut now = Instant::now();
        let mut health = monitor(|c| {
            c.max_failed_checks = 1;
            c.reset.max_attempts = 2;
        });

        for attempt in 1..=2 {
            assert_eq!(fail(&mut health, now), HealthAction::Reset { attempt });
            health.reset_failed(now);
            now += Duration::from_secs(120);
        }

        assert_eq!(
            fail(&mut health, now),
            HealthAction::Diagnostic(Diagnostic::RecoveryExhausted { attempts: 2 })
        );
        assert_eq!(fail(&mut health, now + Duration::from_secs(600)), HealthAction::None);
        assert_eq!(health.state(), Health::Degraded);

        health.record_success(now);
        assert_eq!(health.reset_attempts(), 0);
        assert_eq!(fail(&mut health, now), HealthAction::Reset { attempt: 1 });
    }
}
