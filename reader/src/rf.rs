//! RF configuration and thermal protection.

use tracing::{debug, info, warn};

use crate::chip::{Chip, Register};
use crate::config::{DeviceConfig, Protocol, ThermalConfig};
use crate::error::{Error, Result};
use crate::events::Diagnostic;

#[derive(Debug, Clone)]
pub struct RfManager {
    baseline: u8,
    power: u8,
    protocol: Protocol,
    collision_avoidance: bool,
    thermal: ThermalConfig,
}

impl RfManager {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            baseline: config.power_level,
            power: config.power_level,
            protocol: config.protocol_priority,
            collision_avoidance: config.collision_avoidance,
            thermal: config.thermal,
        }
    }

    /// Configured power level.
    pub fn baseline(&self) -> u8 {
        self.baseline
    }

    /// Effective power level, possibly reduced by thermal protection.
    pub fn power(&self) -> u8 {
        self.power
    }

    pub fn is_throttled(&self) -> bool {
        self.power < self.baseline
    }

    /// Write power, protocol priority and collision avoidance, in that order.
    ///
    /// Writes absolute values only, so applying twice leaves the chip exactly
    /// as applying once.
    pub fn apply<C: Chip + ?Sized>(&self, chip: &mut C) -> Result<()> {
        chip.write_register(Register::RfPower, &[self.power])?;
        chip.write_register(Register::ProtocolPriority, &[self.protocol.code()])?;
        chip.write_register(
            Register::CollisionAvoidance,
            &[u8::from(self.collision_avoidance)],
        )?;
        debug!(
            power = self.power,
            protocol = %self.protocol,
            collision_avoidance = self.collision_avoidance,
            "RF configuration applied"
        );
        Ok(())
    }

    /// Read the power register back and compare with what was applied.
    pub fn verify<C: Chip + ?Sized>(&self, chip: &mut C) -> Result<()> {
        let actual = chip.read_register(Register::RfPower)?;
        if actual != self.power {
            return Err(Error::ConfigDrift {
                expected: self.power,
                actual,
            });
        }
        Ok(())
    }

    /// Step power down while hot and back up once cooled past the hysteresis.
    ///
    /// Returns a diagnostic when the power level changed. The new level is
    /// written at once.
    pub fn on_temperature<C: Chip + ?Sized>(
        &mut self,
        chip: &mut C,
        celsius: f32,
    ) -> Result<Option<Diagnostic>> {
        let ThermalConfig {
            threshold_c,
            hysteresis_c,
            step,
        } = self.thermal;

        let (power, diagnostic) = if celsius >= threshold_c && self.power > 0 {
            let power = self.power.saturating_sub(step);
            warn!(celsius, from = self.power, to = power, "chip hot, reducing RF power");
            (power, Diagnostic::ThermalThrottle { celsius, power_level: power })
        } else if celsius < threshold_c - hysteresis_c && self.power < self.baseline {
            let power = self.power.saturating_add(step).min(self.baseline);
            info!(celsius, from = self.power, to = power, "chip cooled, restoring RF power");
            (power, Diagnostic::ThermalRecovered { celsius, power_level: power })
        } else {
            return Ok(None);
        };

        self.power = power;
        chip.write_register(Register::RfPower, &[power])?;
        Ok(Some(diagnostic))
    }
}
