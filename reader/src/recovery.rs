//! Chip reset sequence.

use tracing::info;

use crate::chip::Chip;
use crate::config::ResetPolicy;
use crate::error::{Error, Result};
use crate::rf::RfManager;

/// Pulse reset, wait for ready, re-apply RF configuration.
///
/// Blocks for at most the reset timing plus `policy.ready_timeout`. Any
/// failure along the way is reported as [`Error::ResetFailure`].
pub fn reset_chip<C: Chip + ?Sized>(chip: &mut C, rf: &RfManager, policy: &ResetPolicy) -> Result<()> {
    info!("resetting chip");
    chip.reset().map_err(|err| failure("reset line", err))?;
    chip.wait_ready(policy.ready_timeout)
        .map_err(|err| failure("ready signal not observed", err))?;
    rf.apply(chip)
        .map_err(|err| failure("re-applying RF configuration", err))?;
    Ok(())
}

fn failure(step: &str, err: Error) -> Error {
    Error::ResetFailure {
        reason: format!("{step}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::Register;
    use crate::chip::sim::SimChip;
    use crate::config::DeviceConfig;

    #[test]
    fn successful_reset_reapplies_rf() {
        let config = DeviceConfig::default();
        let rf = RfManager::new(&config);
        let mut chip = SimChip::new();
        rf.apply(&mut chip).unwrap();

        reset_chip(&mut chip, &rf, &config.reset).unwrap();

        assert_eq!(chip.resets(), 1);
        assert_eq!(chip.register(Register::RfPower), Some(200));
        assert_eq!(chip.writes().len(), 6);
    }

    #[test]
    fn missing_ready_signal_is_reset_failure() {
        let config = DeviceConfig::default();
        let rf = RfManager::new(&config);
        let mut chip = SimChip::new();
        chip.fail_resets(1);

        let err = reset_chip(&mut chip, &rf, &config.reset).unwrap_err();

        assert!(matches!(err, Error::ResetFailure { ref reason } if reason.starts_with("ready signal")));
        assert_eq!(chip.register(Register::RfPower), None);
    }
}
