//! PN532 SPI transport.
//!
//! The PN532 clocks SPI LSB-first; configure the bus accordingly. Every
//! transfer starts with a control byte telling the chip what follows.

use embedded_hal::spi::{Error as _, Operation, SpiDevice};
use tracing::trace;

use super::pn532::Pn532Interface;
use crate::error::{Error, Result};

pub const DATA_WRITE: u8 = 0x01;
pub const STATUS_READ: u8 = 0x02;
pub const DATA_READ: u8 = 0x03;
pub const READY: u8 = 0x01;

/// Settle time after chip select before the control byte.
const CS_SETUP_NS: u32 = 2_000_000;

pub struct Pn532Spi<SPI> {
    spi: SPI,
}

impl<SPI: SpiDevice> Pn532Spi<SPI> {
    pub fn new(spi: SPI) -> Self {
        Self { spi }
    }

    pub fn release(self) -> SPI {
        self.spi
    }
}

impl<SPI: SpiDevice> Pn532Interface for Pn532Spi<SPI> {
    fn write_data(&mut self, data: &[u8]) -> Result<()> {
        trace!(len = data.len(), "SPI write");
        self.spi
            .transaction(&mut [
                Operation::DelayNs(CS_SETUP_NS),
                Operation::Write(&[DATA_WRITE]),
                Operation::Write(data),
            ])
            .map_err(|err| Error::bus(err.kind()))
    }

    fn read_data(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; len];
        self.spi
            .transaction(&mut [
                Operation::DelayNs(CS_SETUP_NS),
                Operation::Write(&[DATA_READ]),
                Operation::Read(&mut data),
            ])
            .map_err(|err| Error::bus(err.kind()))?;
        trace!(len, "SPI read");
        Ok(data)
    }

    fn is_read_ready(&mut self) -> Result<bool> {
        let mut status = [0u8];
        self.spi
            .transaction(&mut [Operation::Write(&[STATUS_READ]), Operation::Read(&mut status)])
            .map_err(|err| Error::bus(err.kind()))?;
        Ok(status[0] == READY)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::convert::Infallible;

    use embedded_hal::spi::ErrorType;

    use super::*;

    /// Records written bytes per transaction and serves queued read bytes.
    #[derive(Default)]
    struct FakeSpi {
        transactions: Vec<Vec<u8>>,
        reads: VecDeque<u8>,
    }

    impl ErrorType for FakeSpi {
        type Error = Infallible;
    }

    impl SpiDevice for FakeSpi {
        fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Infallible> {
            let mut written = Vec::new();
            for op in operations {
                match op {
                    Operation::Write(bytes) => written.extend_from_slice(bytes),
                    Operation::Read(buf) => {
                        for byte in buf.iter_mut() {
                            *byte = self.reads.pop_front().unwrap_or(0);
                        }
                    }
                    Operation::Transfer(read, write) => {
                        written.extend_from_slice(write);
                        for byte in read.iter_mut() {
                            *byte = self.reads.pop_front().unwrap_or(0);
                        }
                    }
                    Operation::TransferInPlace(buf) => written.extend_from_slice(buf),
                    Operation::DelayNs(_) => {}
                }
            }
            self.transactions.push(written);
            Ok(())
        }
    }

    #[test]
    fn prefixes_control_bytes() {
        let mut spi = Pn532Spi::new(FakeSpi {
            reads: VecDeque::from(vec![READY, 0xAA, 0xBB]),
            ..FakeSpi::default()
        });

        assert!(spi.is_read_ready().unwrap());
        spi.write_data(&[0x00, 0xFF]).unwrap();
        assert_eq!(spi.read_data(2).unwrap(), vec![0xAA, 0xBB]);

        let fake = spi.release();
        assert_eq!(fake.transactions[0], vec![STATUS_READ]);
        assert_eq!(fake.transactions[1], vec![DATA_WRITE, 0x00, 0xFF]);
        assert_eq!(fake.transactions[2], vec![DATA_READ]);
    }

    #[test]
    fn not_ready_status() {
        let mut spi = Pn532Spi::new(FakeSpi {
            reads: VecDeque::from(vec![0x00]),
            ..FakeSpi::default()
        });
        assert!(!spi.is_read_ready().unwrap());
    }
}
