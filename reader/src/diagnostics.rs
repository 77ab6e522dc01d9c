//! Diagnostics sampling: AGC, field strength, die temperature.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::chip::{Chip, Register};
use crate::config::DeviceConfig;
use crate::sensors::{Publisher, SensorUpdate};

/// Last good value of every diagnostic register. `None` until first read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsSample {
    pub agc: Option<u8>,
    pub field_strength: Option<u8>,
    pub temperature: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

impl Default for DiagnosticsSample {
    fn default() -> Self {
        Self {
            agc: None,
            field_strength: None,
            temperature: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct DiagnosticsSampler {
    enabled: bool,
    interval: Duration,
    next_due: Option<Instant>,
    last: DiagnosticsSample,
}

impl DiagnosticsSampler {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            enabled: config.diagnostics_enabled,
            interval: config.diagnostics_interval,
            next_due: None,
            last: DiagnosticsSample::default(),
        }
    }

    pub fn last(&self) -> &DiagnosticsSample {
        &self.last
    }

    pub fn due(&self, now: Instant) -> bool {
        self.enabled && self.next_due.is_none_or(|at| now >= at)
    }

    /// Read every register, publish the ones that answered and return the
    /// temperature if it was read this cycle.
    ///
    /// A failed register keeps its previous value and is never a health
    /// failure.
    pub fn sample<C: Chip + ?Sized>(
        &mut self,
        chip: &mut C,
        now: Instant,
        publisher: &mut dyn Publisher,
    ) -> Option<f32> {
        self.next_due = Some(now + self.interval);

        if let Some(value) = read(chip, Register::Agc) {
            self.last.agc = Some(value);
            publisher.publish(SensorUpdate::Agc { value });
        }
        if let Some(value) = read(chip, Register::FieldStrength) {
            self.last.field_strength = Some(value);
            publisher.publish(SensorUpdate::FieldStrength { value });
        }
        let temperature = read(chip, Register::Temperature).map(decode_temperature);
        if let Some(celsius) = temperature {
            self.last.temperature = Some(celsius);
            publisher.publish(SensorUpdate::Temperature { celsius });
        }
        self.last.timestamp = Utc::now();
        temperature
    }
}

/// Die temperature is reported in whole degrees Celsius, two's complement.
fn decode_temperature(raw: u8) -> f32 {
    f32::from(raw as i8)
}

fn read<C: Chip + ?Sized>(chip: &mut C, register: Register) -> Option<u8> {
    chip.read_register(register)
        .inspect_err(|err| debug!(?register, %err, "diagnostic read failed"))
        .ok()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::chip::sim::SimChip;
    use crate::sensors::SensorLog;

    fn sampler() -> DiagnosticsSampler {
        let config = DeviceConfig {
            diagnostics_enabled: true,
            ..DeviceConfig::default()
        };
        DiagnosticsSampler::new(&config)
    }

    #[test]
    fn publishes_every_readable_register() {
        let mut chip = SimChip::new();
        chip.set_register(Register::Agc, 7);
        chip.set_register(Register::FieldStrength, 3);
        chip.set_temperature(38.0);
        let mut log = SensorLog::new();

        let temperature = sampler().sample(&mut chip, Instant::now(), &mut log);

        assert_eq!(temperature, Some(38.0));
        assert_eq!(
            log.snapshot(),
            vec![
                SensorUpdate::Agc { value: 7 },
                SensorUpdate::FieldStrength { value: 3 },
                SensorUpdate::Temperature { celsius: 38.0 },
            ]
        );
    }

    #[test]
    fn failed_register_keeps_last_value() {
        let mut chip = SimChip::new();
        chip.set_register(Register::Agc, 7);
        chip.set_temperature(40.0);
        let mut sampler = sampler();
        let mut log = SensorLog::new();
        let now = Instant::now();
        sampler.sample(&mut chip, now, &mut log);

        chip.set_register(Register::Agc, 9);
        chip.fail_register(Register::Agc);
        chip.fail_register(Register::Temperature);
        let temperature = sampler.sample(&mut chip, now + Duration::from_secs(10), &mut log);

        assert_eq!(temperature, None);
        assert_eq!(sampler.last().agc, Some(7));
        assert_eq!(sampler.last().temperature, Some(40.0));
    }

    #[test]
    fn temperature_below_zero_is_negative() {
        let mut chip = SimChip::new();
        chip.set_register(Register::Temperature, 0xF6);

        let temperature = sampler().sample(&mut chip, Instant::now(), &mut SensorLog::new());

        assert_eq!(temperature, Some(-10.0));
    }

    #[test]
    fn chip_without_temperature_sensor() {
        let mut chip = SimChip::new().without_register(Register::Temperature);
        let mut sampler = sampler();
        assert_eq!(sampler.sample(&mut chip, Instant::now(), &mut SensorLog::new()), None);
        assert_eq!(sampler.last().temperature, None);
        assert_eq!(sampler.last().agc, Some(0));
    }

    #[test]
    fn runs_on_its_own_cadence() {
        let now = Instant::now();
        let mut sampler = sampler();
        assert!(sampler.due(now));
        sampler.sample(&mut SimChip::new(), now, &mut SensorLog::new());
        assert!(!sampler.due(now + Duration::from_secs(9)));
        assert!(sampler.due(now + Duration::from_secs(10)));

        let disabled = DiagnosticsSampler::new(&DeviceConfig::default());
        assert!(!disabled.due(now));
    }
}
