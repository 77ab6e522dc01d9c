//! Low-power card detection.
//!
//! While the field is empty the chip sits in its detect mode and the reader
//! only checks for a wake on the short LPCD cadence. A wake brings the chip
//! back to full RF for a normal read.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace};

use crate::chip::Chip;
use crate::config::DeviceConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LpcdMode {
    #[default]
    Active,
    LowPower,
}

#[derive(Debug)]
pub struct LpcdController {
    enabled: bool,
    interval: Duration,
    mode: LpcdMode,
}

impl LpcdController {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            enabled: config.lpcd_enabled,
            interval: config.lpcd_interval,
            mode: LpcdMode::Active,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn mode(&self) -> LpcdMode {
        self.mode
    }

    /// Delay until the next tick given the full-RF cadence.
    pub fn tick_interval(&self, update_interval: Duration) -> Duration {
        match self.mode {
            LpcdMode::LowPower => self.interval,
            LpcdMode::Active => update_interval,
        }
    }

    /// Put the chip into detect mode. No-op when disabled or already there.
    pub fn enter<C: Chip + ?Sized>(&mut self, chip: &mut C) -> Result<()> {
        if !self.enabled || self.mode == LpcdMode::LowPower {
            return Ok(());
        }
        chip.enter_lpcd(self.interval)?;
        self.mode = LpcdMode::LowPower;
        debug!(interval_ms = self.interval.as_millis() as u64, "entered LPCD");
        Ok(())
    }

    /// Check for a wake. On a wake the chip leaves detect mode; the caller
    /// must re-apply RF configuration before reading.
    pub fn check_wake<C: Chip + ?Sized>(&mut self, chip: &mut C) -> Result<bool> {
        if self.mode != LpcdMode::LowPower {
            return Ok(false);
        }
        if !chip.lpcd_woken()? {
            trace!("LPCD quiet");
            return Ok(false);
        }
        chip.exit_lpcd()?;
        self.mode = LpcdMode::Active;
        debug!("LPCD wake");
        Ok(true)
    }

    /// Leave detect mode without a wake, for register access on a parked chip.
    pub fn exit<C: Chip + ?Sized>(&mut self, chip: &mut C) -> Result<()> {
        if self.mode != LpcdMode::LowPower {
            return Ok(());
        }
        chip.exit_lpcd()?;
        self.mode = LpcdMode::Active;
        trace!("left LPCD");
        Ok(())
    }

    /// A chip reset always leaves detect mode.
    pub fn on_reset(&mut self) {
        self.mode = LpcdMode::Active;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::sim::SimChip;

    fn controller() -> LpcdController {
        LpcdController::new(&DeviceConfig {
            lpcd_enabled: true,
            lpcd_interval: Duration::from_millis(100),
            ..DeviceConfig::default()
        })
    }

    #[test]
    fn enter_and_wake() {
        let mut chip = SimChip::new();
        let mut lpcd = controller();
        let update = Duration::from_millis(500);
        assert_eq!(lpcd.tick_interval(update), update);

        lpcd.enter(&mut chip).unwrap();
        assert!(chip.in_lpcd());
        assert_eq!(lpcd.tick_interval(update), Duration::from_millis(100));
        assert!(!lpcd.check_wake(&mut chip).unwrap());

        chip.wake();
        assert!(lpcd.check_wake(&mut chip).unwrap());
        assert!(!chip.in_lpcd());
        assert_eq!(lpcd.mode(), LpcdMode::Active);
        assert_eq!(lpcd.tick_interval(update), update);
    }

    #[test]
    fn disabled_controller_never_enters() {
        let mut chip = SimChip::new();
        let mut lpcd = LpcdController::new(&DeviceConfig::default());
        lpcd.enter(&mut chip).unwrap();
        assert!(!chip.in_lpcd());
        assert_eq!(lpcd.mode(), LpcdMode::Active);
    }

    #[test]
    fn reset_returns_to_active() {
        let mut chip = SimChip::new();
        let mut lpcd = controller();
        lpcd.enter(&mut chip).unwrap();
        lpcd.on_reset();
        assert_eq!(lpcd.mode(), LpcdMode::Active);
    }
}
