//! PN532 I2C transport.
//!
//! The chip prepends a status byte to every I2C read; `0x01` means a frame is
//! waiting. Readiness is a single non-blocking status read so the driver's
//! bounded spin stays in control of timing.

use embedded_hal::i2c::{Error as _, ErrorKind, I2c};
use tracing::trace;

use super::pn532::Pn532Interface;
use crate::error::{Error, Result};

pub const DEFAULT_ADDRESS: u8 = 0x24;
pub const READY: u8 = 0x01;

pub struct Pn532I2c<I2C> {
    i2c: I2C,
    address: u8,
}

impl<I2C: I2c> Pn532I2c<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self::with_address(i2c, DEFAULT_ADDRESS)
    }

    pub fn with_address(i2c: I2C, address: u8) -> Self {
        Self { i2c, address }
    }

    pub fn release(self) -> I2C {
        self.i2c
    }
}

fn map_err(kind: ErrorKind) -> Error {
    match kind {
        ErrorKind::NoAcknowledge(_) => Error::nak("I2C address or data not acknowledged"),
        other => Error::bus(other),
    }
}

impl<I2C: I2c> Pn532Interface for Pn532I2c<I2C> {
    fn write_data(&mut self, data: &[u8]) -> Result<()> {
        trace!(len = data.len(), "I2C write");
        self.i2c
            .write(self.address, data)
            .map_err(|err| map_err(err.kind()))
    }

    fn read_data(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len + 1];
        self.i2c
            .read(self.address, &mut buf)
            .map_err(|err| map_err(err.kind()))?;
        if buf[0] != READY {
            return Err(Error::nak(format!("read while not ready (status {:#04X})", buf[0])));
        }
        buf.remove(0);
        Ok(buf)
    }

    fn is_read_ready(&mut self) -> Result<bool> {
        let mut status = [0u8];
        match self.i2c.read(self.address, &mut status) {
            Ok(()) => Ok(status[0] == READY),
            // A busy PN532 may simply not answer its address.
            Err(err) if matches!(err.kind(), ErrorKind::NoAcknowledge(_)) => Ok(false),
            Err(err) => Err(map_err(err.kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use embedded_hal::i2c::{ErrorType, NoAcknowledgeSource, Operation};

    use super::*;

    #[derive(Debug)]
    struct Nack;

    impl embedded_hal::i2c::Error for Nack {
        fn kind(&self) -> ErrorKind {
            ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)
        }
    }

    #[derive(Default)]
    struct FakeI2c {
        writes: Vec<(u8, Vec<u8>)>,
        reads: VecDeque<Option<Vec<u8>>>,
    }

    impl ErrorType for FakeI2c {
        type Error = Nack;
    }

    impl I2c for FakeI2c {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Nack> {
            for op in operations {
                match op {
                    Operation::Write(bytes) => self.writes.push((address, bytes.to_vec())),
                    Operation::Read(buf) => {
                        let data = self.reads.pop_front().flatten().ok_or(Nack)?;
                        for (dst, src) in buf.iter_mut().zip(data) {
                            *dst = src;
                        }
                    }
                }
            }
            Ok(())
        }
    }

    #[test]
    fn strips_ready_byte() {
        let mut i2c = Pn532I2c::new(FakeI2c {
            reads: VecDeque::from(vec![Some(vec![READY, 0x00, 0x00, 0xFF])]),
            ..FakeI2c::default()
        });
        assert_eq!(i2c.read_data(3).unwrap(), vec![0x00, 0x00, 0xFF]);
    }

    #[test]
    fn nack_while_polling_is_not_ready() {
        let mut i2c = Pn532I2c::new(FakeI2c {
            reads: VecDeque::from(vec![None, Some(vec![READY])]),
            ..FakeI2c::default()
        });
        assert!(!i2c.is_read_ready().unwrap());
        assert!(i2c.is_read_ready().unwrap());
    }

    #[test]
    fn write_goes_to_configured_address() {
        let mut i2c = Pn532I2c::with_address(FakeI2c::default(), 0x48);
        i2c.write_data(&[0xD4, 0x02]).unwrap();
        assert_eq!(i2c.release().writes, vec![(0x48, vec![0xD4, 0x02])]);
    }

    #[test]
    fn nack_on_data_read_is_transport_nak() {
        let mut i2c = Pn532I2c::new(FakeI2c::default());
        assert!(matches!(i2c.read_data(6), Err(Error::TransportNak { .. })));
    }
}
