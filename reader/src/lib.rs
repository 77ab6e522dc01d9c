//! Tagwatch reader core.
//!
//! Drives PN532 and PN5180 NFC front-ends: tag presence with removal
//! debounce, RF configuration with thermal protection, low-power card
//! detection, and a health monitor that resets a misbehaving chip.
//!
//! Everything here is synchronous. A host owns one [`Reader`] and calls
//! [`Reader::poll`] on its own cadence.

pub mod chip;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod health;
pub mod lpcd;
pub mod recovery;
pub mod rf;
pub mod scheduler;
pub mod sensors;
pub mod tags;
pub mod uid;

pub use chip::{Chip, Register, TagRead};
pub use config::{ConfigError, DeviceConfig, KnownTagBinding, Protocol};
pub use diagnostics::DiagnosticsSample;
pub use error::{Error, Result};
pub use events::{Diagnostic, HandlerId, Triggers};
pub use health::{Health, HealthAction};
pub use lpcd::LpcdMode;
pub use scheduler::Reader;
pub use sensors::{NullPublisher, Publisher, SensorHandle, SensorLog, SensorUpdate};
pub use tags::{TagEvent, TagRecord};
pub use uid::Uid;
