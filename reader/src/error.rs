use thiserror::Error;

use crate::config::Protocol;

/// Runtime errors raised by chip transactions and recovery.
///
/// None of these ever reach the event triggers: the scheduler hands them to
/// the health monitor, which turns them into poll failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("transport timed out waiting for the chip")]
    TransportTimeout,

    #[error("chip rejected the transaction: {reason}")]
    TransportNak { reason: String },

    #[error("bus error: {reason}")]
    Bus { reason: String },

    #[error("tag answered with unsupported protocol {protocol:?}")]
    UnsupportedProtocol { protocol: Protocol },

    #[error("chip reset failed: {reason}")]
    ResetFailure { reason: String },

    #[error("{what} is not available on this chip")]
    Unsupported { what: &'static str },

    #[error("RF configuration drifted: expected {expected}, chip reports {actual}")]
    ConfigDrift { expected: u8, actual: u8 },
}

impl Error {
    pub(crate) fn nak(reason: impl Into<String>) -> Self {
        Error::TransportNak {
            reason: reason.into(),
        }
    }

    pub(crate) fn bus(reason: impl core::fmt::Debug) -> Self {
        Error::Bus {
            reason: format!("{reason:?}"),
        }
    }

    /// Whether this error means the chip itself misbehaved.
    ///
    /// `UnsupportedProtocol` is a present tag the configuration excludes, so it
    /// never counts against the health counter.
    pub fn is_chip_fault(&self) -> bool {
        !matches!(self, Error::UnsupportedProtocol { .. })
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
