//! One poll cycle.
//!
//! [`Reader`] owns the chip and every piece of runtime state. The host calls
//! [`Reader::poll`] on its own loop and sleeps for the returned duration; a
//! cycle runs to completion before the next one starts, so at most one chip
//! transaction is ever in flight.

use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::chip::{Chip, TagRead};
use crate::config::DeviceConfig;
use crate::diagnostics::{DiagnosticsSample, DiagnosticsSampler};
use crate::error::{Error, Result};
use crate::events::{Diagnostic, Triggers};
use crate::health::{Health, HealthAction, HealthMonitor};
use crate::lpcd::{LpcdController, LpcdMode};
use crate::recovery;
use crate::rf::RfManager;
use crate::sensors::{NullPublisher, Publisher, SensorUpdate};
use crate::tags::TagTracker;
use crate::uid::Uid;

/// Minimum delay before the next scan after 1, 2 and 3+ failed reads in a row.
const READ_BACKOFF: [Duration; 3] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(60),
];

/// What one read attempt produced.
enum ReadOutcome {
    Tag(TagRead),
    Empty,
    /// A tag answered outside the configured protocol priority.
    Filtered,
}

pub struct Reader<C> {
    config: DeviceConfig,
    chip: C,
    rf: RfManager,
    health: HealthMonitor,
    tags: TagTracker,
    lpcd: LpcdController,
    sampler: DiagnosticsSampler,
    triggers: Triggers,
    publisher: Box<dyn Publisher>,
    next_health_check: Option<Instant>,
    published_health: Option<(Health, u32)>,
    failed_reads: usize,
}

impl<C: Chip> Reader<C> {
    /// `config` must already be validated.
    pub fn new(config: DeviceConfig, chip: C) -> Self {
        Self {
            rf: RfManager::new(&config),
            health: HealthMonitor::new(&config),
            tags: TagTracker::new(config.known_tags.clone()),
            lpcd: LpcdController::new(&config),
            sampler: DiagnosticsSampler::new(&config),
            triggers: Triggers::new(),
            publisher: Box::new(NullPublisher),
            next_health_check: None,
            published_health: None,
            failed_reads: 0,
            config,
            chip,
        }
    }

    pub fn with_publisher(mut self, publisher: impl Publisher + 'static) -> Self {
        self.publisher = Box::new(publisher);
        self
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn triggers_mut(&mut self) -> &mut Triggers {
        &mut self.triggers
    }

    pub fn chip(&self) -> &C {
        &self.chip
    }

    pub fn chip_mut(&mut self) -> &mut C {
        &mut self.chip
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn tags(&self) -> &TagTracker {
        &self.tags
    }

    pub fn rf(&self) -> &RfManager {
        &self.rf
    }

    pub fn diagnostics(&self) -> &DiagnosticsSample {
        self.sampler.last()
    }

    pub fn lpcd_mode(&self) -> LpcdMode {
        self.lpcd.mode()
    }

    /// Apply RF configuration and, with LPCD on, park the chip in detect mode.
    pub fn setup(&mut self, now: Instant) {
        self.config.log_summary();
        if self.config.health_check_enabled {
            self.next_health_check = Some(now + self.config.health_check_interval);
        }
        self.publisher.publish(SensorUpdate::RfPower { level: self.rf.power() });

        let mut action = HealthAction::None;
        match self.rf.apply(&mut self.chip) {
            Ok(()) => {
                self.health.record_success(now);
                if let Err(err) = self.lpcd.enter(&mut self.chip) {
                    action = self.health.record_failure(now, &err);
                }
            }
            Err(err) => action = self.health.record_failure(now, &err),
        }
        self.handle(action, now);
        self.publish_health();
        info!(state = ?self.health.state(), "reader ready");
    }

    /// Run one cycle and return the delay until the next one.
    pub fn poll(&mut self, now: Instant) -> Duration {
        let mut action = HealthAction::None;
        let mut reset_requested = false;

        match self.read() {
            Ok(ReadOutcome::Tag(read)) => {
                self.failed_reads = 0;
                self.health.record_success(now);
                self.track(Some(&read.uid), now);
            }
            Ok(ReadOutcome::Empty) => {
                self.failed_reads = 0;
                self.health.record_success(now);
                self.track(None, now);
            }
            // Neither success nor failure for health.
            Ok(ReadOutcome::Filtered) => self.track(None, now),
            Err(Error::UnsupportedProtocol { protocol }) => {
                self.diagnostic(Diagnostic::UnsupportedProtocol { uid: None, protocol });
                self.track(None, now);
            }
            Err(err) => {
                self.failed_reads += 1;
                action = self.health.record_failure(now, &err);
                self.track(None, now);
            }
        }
        reset_requested |= self.handle(action, now);

        if !reset_requested && self.health_check_due(now) {
            let action = match self.check_health() {
                Ok(()) => {
                    self.health.record_success(now);
                    HealthAction::None
                }
                Err(err) => self.health.record_failure(now, &err),
            };
            reset_requested |= self.handle(action, now);
        }

        if self.sampler.due(now) {
            if let Err(err) = self.sample_diagnostics(now) {
                let action = self.health.record_failure(now, &err);
                reset_requested |= self.handle(action, now);
            }
        }

        if !reset_requested && self.lpcd.mode() == LpcdMode::Active && self.tags.is_empty() {
            if let Err(err) = self.lpcd.enter(&mut self.chip) {
                let action = self.health.record_failure(now, &err);
                self.handle(action, now);
            }
        }

        if self.config.rf_field_off_when_idle
            && self.lpcd.mode() == LpcdMode::Active
            && self.tags.is_empty()
        {
            if let Err(err) = self.chip.set_field(false) {
                debug!(%err, "failed to switch RF field off");
            }
        }

        self.publish_health();
        let interval = self.next_interval();
        trace!(interval_ms = interval.as_millis() as u64, "next poll");
        interval
    }

    /// Cadence of the current mode, stretched while reads keep failing.
    fn next_interval(&self) -> Duration {
        let interval = self.lpcd.tick_interval(self.config.update_interval);
        match self.failed_reads {
            0 => interval,
            failed => {
                let backoff = READ_BACKOFF[(failed - 1).min(READ_BACKOFF.len() - 1)];
                interval.max(backoff)
            }
        }
    }

    /// LPCD wake check or tag read. A quiet LPCD check reads nothing.
    fn read(&mut self) -> Result<ReadOutcome> {
        if self.lpcd.mode() == LpcdMode::LowPower {
            if !self.lpcd.check_wake(&mut self.chip)? {
                return Ok(ReadOutcome::Empty);
            }
            self.rf.apply(&mut self.chip)?;
        }
        match self.chip.read_uid()? {
            Some(tag) if !self.config.protocol_priority.accepts(tag.protocol) => {
                trace!(uid = %tag.uid, protocol = %tag.protocol, "protocol filtered");
                self.diagnostic(Diagnostic::UnsupportedProtocol {
                    uid: Some(tag.uid),
                    protocol: tag.protocol,
                });
                Ok(ReadOutcome::Filtered)
            }
            Some(tag) => Ok(ReadOutcome::Tag(tag)),
            None => Ok(ReadOutcome::Empty),
        }
    }

    fn track(&mut self, uid: Option<&Uid>, now: Instant) {
        let events = self.tags.observe(uid, now);
        if !events.is_empty() {
            self.tags
                .notify(&events, &mut self.triggers, self.publisher.as_mut());
        }
    }

    fn health_check_due(&mut self, now: Instant) -> bool {
        match self.next_health_check {
            Some(at) if now >= at => {
                self.next_health_check = Some(now + self.config.health_check_interval);
                true
            }
            _ => false,
        }
    }

    /// Liveness probe plus RF configuration readback.
    fn check_health(&mut self) -> Result<()> {
        // Probing a chip in detect mode would wake it.
        if self.lpcd.mode() == LpcdMode::LowPower {
            return Ok(());
        }
        self.chip.probe()?;
        self.rf.verify(&mut self.chip)?;
        debug!("health check passed");
        Ok(())
    }

    /// Act on a health decision. Returns whether a reset ran.
    fn handle(&mut self, action: HealthAction, now: Instant) -> bool {
        match action {
            HealthAction::None => false,
            HealthAction::Diagnostic(diagnostic) => {
                self.diagnostic(diagnostic);
                false
            }
            HealthAction::Reset { attempt } => {
                self.publish_health();
                self.diagnostic(Diagnostic::ResetStarted { attempt });
                self.lpcd.on_reset();
                match recovery::reset_chip(&mut self.chip, &self.rf, &self.config.reset) {
                    Ok(()) => {
                        self.failed_reads = 0;
                        self.health.reset_succeeded(now);
                        self.diagnostic(Diagnostic::ResetSucceeded { attempt });
                    }
                    Err(err) => {
                        self.health.reset_failed(now);
                        self.diagnostic(Diagnostic::ResetFailed {
                            attempt,
                            reason: err.to_string(),
                        });
                    }
                }
                true
            }
        }
    }

    /// Sample diagnostics and apply thermal protection. A parked chip leaves
    /// detect mode for the register access and goes back afterwards.
    fn sample_diagnostics(&mut self, now: Instant) -> Result<()> {
        let parked = self.lpcd.mode() == LpcdMode::LowPower;
        if parked {
            self.lpcd.exit(&mut self.chip)?;
        }

        let temperature = self
            .sampler
            .sample(&mut self.chip, now, self.publisher.as_mut());
        if let Some(celsius) = temperature {
            match self.rf.on_temperature(&mut self.chip, celsius) {
                Ok(Some(diagnostic)) => {
                    self.publisher.publish(SensorUpdate::RfPower { level: self.rf.power() });
                    self.diagnostic(diagnostic);
                }
                Ok(None) => {}
                // The next health check reports the drift.
                Err(err) => warn!(%err, "failed to write thermal power level"),
            }
        }

        if parked {
            self.lpcd.enter(&mut self.chip)?;
        }
        Ok(())
    }

    fn diagnostic(&mut self, diagnostic: Diagnostic) {
        debug!(?diagnostic, "diagnostic");
        self.triggers.diagnostic(&diagnostic);
    }

    fn publish_health(&mut self) {
        let current = (self.health.state(), self.health.consecutive_failures());
        if self.published_health == Some(current) {
            return;
        }
        self.published_health = Some(current);
        self.publisher.publish(SensorUpdate::Health {
            state: current.0,
            consecutive_failures: current.1,
        });
    }
}
