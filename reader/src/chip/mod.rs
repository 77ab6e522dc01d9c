//! Front-end chip capability interface.
//!
//! Two physically different chip families share one contract. The rest of the
//! crate only ever talks to [`Chip`]:
//! - PN532 over SPI or I2C ([`pn532`], [`pn532_spi`], [`pn532_i2c`])
//! - PN5180 over SPI + BUSY + RST ([`pn5180`])
//! - an in-memory front-end for hosts without hardware ([`sim`])

use std::time::Duration;

use crate::config::Protocol;
use crate::error::Result;
use crate::uid::Uid;

pub mod pn5180;
pub mod pn532;
pub mod pn532_i2c;
pub mod pn532_spi;
pub mod sim;

/// Logical registers. Each family maps them onto its own addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    RfPower,
    ProtocolPriority,
    CollisionAvoidance,
    Agc,
    FieldStrength,
    /// Whole degrees Celsius as a signed byte, -128 to 127.
    Temperature,
}

/// A tag that answered a selection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRead {
    pub uid: Uid,
    pub protocol: Protocol,
}

pub trait Chip {
    /// One selection attempt. `Ok(None)` means the field is empty.
    fn read_uid(&mut self) -> Result<Option<TagRead>>;

    fn write_register(&mut self, register: Register, value: &[u8]) -> Result<()>;

    fn read_register(&mut self, register: Register) -> Result<u8>;

    /// Pulse the reset line with the family's timing.
    fn reset(&mut self) -> Result<()>;

    /// Wait until the chip reports ready, at most `timeout`.
    fn wait_ready(&mut self, timeout: Duration) -> Result<()>;

    /// Cheap liveness check (firmware version or equivalent).
    fn probe(&mut self) -> Result<()>;

    fn set_field(&mut self, on: bool) -> Result<()>;

    /// Put the chip into low-power card detection with the given wake-check period.
    fn enter_lpcd(&mut self, interval: Duration) -> Result<()>;

    /// Whether the chip sensed a field disturbance since entering LPCD.
    fn lpcd_woken(&mut self) -> Result<bool>;

    fn exit_lpcd(&mut self) -> Result<()>;
}

impl<C: Chip + ?Sized> Chip for &mut C {
    fn read_uid(&mut self) -> Result<Option<TagRead>> {
        (**self).read_uid()
    }

    fn write_register(&mut self, register: Register, value: &[u8]) -> Result<()> {
        (**self).write_register(register, value)
    }

    fn read_register(&mut self, register: Register) -> Result<u8> {
        (**self).read_register(register)
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        (**self).wait_ready(timeout)
    }

    fn probe(&mut self) -> Result<()> {
        (**self).probe()
    }

    fn set_field(&mut self, on: bool) -> Result<()> {
        (**self).set_field(on)
    }

    fn enter_lpcd(&mut self, interval: Duration) -> Result<()> {
        (**self).enter_lpcd(interval)
    }

    fn lpcd_woken(&mut self) -> Result<bool> {
        (**self).lpcd_woken()
    }

    fn exit_lpcd(&mut self) -> Result<()> {
        (**self).exit_lpcd()
    }
}

/// Iterations of a 1 ms spin needed to cover `timeout`, at least one.
pub(crate) fn spin_steps(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX).max(1)
}
