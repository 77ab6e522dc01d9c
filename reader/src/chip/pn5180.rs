//! PN5180 NFC controller driver.
//!
//! The PN5180 communicates via SPI with the following pins:
//! - MOSI, MISO, SCLK, NSS - standard SPI (NSS handled by the `SpiDevice`)
//! - BUSY - indicates when chip is processing (active high)
//! - RST - hardware reset (active low)
//!
//! Commands are sent as:
//! [CMD_BYTE] [PAYLOAD...]
//!
//! Responses are read in a separate transfer after BUSY goes low.

use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::{Error as _, SpiDevice};
use tracing::{debug, trace};

use super::{Chip, Register, TagRead, spin_steps};
use crate::config::Protocol;
use crate::error::{Error, Result};
use crate::uid::Uid;

/// PN5180 command codes
#[allow(dead_code)]
pub mod commands {
    pub const WRITE_REGISTER: u8 = 0x00;
    pub const WRITE_REGISTER_OR_MASK: u8 = 0x01;
    pub const WRITE_REGISTER_AND_MASK: u8 = 0x02;
    pub const READ_REGISTER: u8 = 0x04;
    pub const WRITE_EEPROM: u8 = 0x06;
    pub const READ_EEPROM: u8 = 0x07;
    pub const SEND_DATA: u8 = 0x09;
    pub const READ_DATA: u8 = 0x0A;
    pub const SWITCH_MODE: u8 = 0x0B;
    pub const LOAD_RF_CONFIG: u8 = 0x11;
    pub const UPDATE_RF_CONFIG: u8 = 0x12;
    pub const RF_ON: u8 = 0x16;
    pub const RF_OFF: u8 = 0x17;
}

/// PN5180 register addresses
#[allow(dead_code)]
pub mod registers {
    pub const SYSTEM_CONFIG: u8 = 0x00;
    pub const IRQ_ENABLE: u8 = 0x01;
    pub const IRQ_STATUS: u8 = 0x02;
    pub const IRQ_CLEAR: u8 = 0x03;
    pub const TRANSCEIVE_CONTROL: u8 = 0x04;
    pub const CRC_RX_CONFIG: u8 = 0x12;
    pub const RX_STATUS: u8 = 0x13;
    pub const CRC_TX_CONFIG: u8 = 0x19;
    pub const RF_STATUS: u8 = 0x1D;
    pub const RF_CONTROL_TX: u8 = 0x21;
    pub const SYSTEM_STATUS: u8 = 0x24;
    pub const TEMP_CONTROL: u8 = 0x25;
    pub const AGC_REF_CONFIG: u8 = 0x26;
}

/// IRQ_STATUS bits
pub mod irq {
    pub const RX: u32 = 1 << 0;
    pub const IDLE: u32 = 1 << 2;
    pub const LPCD: u32 = 1 << 19;
    pub const ALL: u32 = 0x000F_FFFF;
}

/// RF configuration (TX, RX) pairs for LOAD_RF_CONFIG
pub mod rf_config {
    pub const ISO_14443A_106: (u8, u8) = (0x00, 0x80);
    pub const ISO_14443B_106: (u8, u8) = (0x04, 0x84);
    pub const FELICA_212: (u8, u8) = (0x08, 0x88);
    pub const ISO_15693_26: (u8, u8) = (0x0D, 0x8D);
}

/// EEPROM addresses
mod eeprom {
    pub const FIRMWARE_VERSION: u8 = 0x12;
}

/// SWITCH_MODE modes
mod mode {
    pub const STANDBY: u8 = 0x00;
    pub const LPCD: u8 = 0x01;
}

/// ISO14443A frames
mod iso14443a {
    pub const REQA: u8 = 0x26;
    pub const CASCADE_TAG: u8 = 0x88;
    pub const SEL_CL1: u8 = 0x93;
    pub const SEL_CL2: u8 = 0x95;
    pub const NVB_ANTICOLL: u8 = 0x20;
    pub const NVB_SELECT: u8 = 0x70;
}

const BUSY_STEP_US: u32 = 10;
const BUSY_TIMEOUT_US: u32 = 100_000;
/// Time a tag gets to answer before the field is considered empty.
const RX_TIMEOUT: Duration = Duration::from_millis(20);

/// ISO 14443A card info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iso14443aCard {
    pub uid: Uid,
    /// ATQA (2 bytes)
    pub atqa: [u8; 2],
    /// SAK byte (only after a full select)
    pub sak: Option<u8>,
}

pub struct Pn5180<SPI, BUSY, RST, D> {
    spi: SPI,
    busy: BUSY,
    reset_pin: RST,
    delay: D,
    priority: Protocol,
    collision_avoidance: bool,
    field_on: bool,
    lpcd_interval: Duration,
}

impl<SPI, BUSY, RST, D> Pn5180<SPI, BUSY, RST, D>
where
    SPI: SpiDevice,
    BUSY: InputPin,
    RST: OutputPin,
    D: DelayNs,
{
    pub fn new(spi: SPI, busy: BUSY, reset_pin: RST, delay: D) -> Self {
        Self {
            spi,
            busy,
            reset_pin,
            delay,
            priority: Protocol::Auto,
            collision_avoidance: true,
            field_on: false,
            lpcd_interval: Duration::from_millis(100),
        }
    }

    pub fn release(self) -> (SPI, BUSY, RST, D) {
        (self.spi, self.busy, self.reset_pin, self.delay)
    }

    fn wait_not_busy(&mut self) -> Result<()> {
        let mut steps = BUSY_TIMEOUT_US / BUSY_STEP_US;
        while self.busy.is_high().map_err(Error::bus)? {
            if steps == 0 {
                return Err(Error::TransportTimeout);
            }
            self.delay.delay_us(BUSY_STEP_US);
            steps -= 1;
        }
        Ok(())
    }

    /// Send a command frame and optionally read `recv_len` response bytes.
    fn transceive(&mut self, send: &[u8], recv_len: usize) -> Result<Vec<u8>> {
        self.wait_not_busy()?;
        self.spi.write(send).map_err(|err| Error::bus(err.kind()))?;
        self.wait_not_busy()?;
        if recv_len == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0xFF; recv_len];
        self.spi
            .transfer_in_place(&mut buf)
            .map_err(|err| Error::bus(err.kind()))?;
        self.wait_not_busy()?;
        Ok(buf)
    }

    pub fn write_reg(&mut self, reg: u8, value: u32) -> Result<()> {
        let v = value.to_le_bytes();
        self.transceive(&[commands::WRITE_REGISTER, reg, v[0], v[1], v[2], v[3]], 0)?;
        Ok(())
    }

    fn write_reg_or_mask(&mut self, reg: u8, mask: u32) -> Result<()> {
        let m = mask.to_le_bytes();
        self.transceive(&[commands::WRITE_REGISTER_OR_MASK, reg, m[0], m[1], m[2], m[3]], 0)?;
        Ok(())
    }

    fn write_reg_and_mask(&mut self, reg: u8, mask: u32) -> Result<()> {
        let m = mask.to_le_bytes();
        self.transceive(&[commands::WRITE_REGISTER_AND_MASK, reg, m[0], m[1], m[2], m[3]], 0)?;
        Ok(())
    }

    pub fn read_reg(&mut self, reg: u8) -> Result<u32> {
        let bytes = self.transceive(&[commands::READ_REGISTER, reg], 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_eeprom(&mut self, addr: u8, len: u8) -> Result<Vec<u8>> {
        self.transceive(&[commands::READ_EEPROM, addr, len], usize::from(len))
    }

    /// Firmware version (major, minor)
    pub fn firmware_version(&mut self) -> Result<(u8, u8)> {
        let bytes = self.read_eeprom(eeprom::FIRMWARE_VERSION, 2)?;
        Ok((bytes[1], bytes[0]))
    }

    fn load_rf_config(&mut self, (tx, rx): (u8, u8)) -> Result<()> {
        self.transceive(&[commands::LOAD_RF_CONFIG, tx, rx], 0)?;
        Ok(())
    }

    fn rf_on(&mut self) -> Result<()> {
        // bit 0 set disables collision avoidance
        let param = u8::from(!self.collision_avoidance);
        self.transceive(&[commands::RF_ON, param], 0)?;
        self.field_on = true;
        Ok(())
    }

    fn rf_off(&mut self) -> Result<()> {
        self.transceive(&[commands::RF_OFF, 0x00], 0)?;
        self.field_on = false;
        Ok(())
    }

    fn clear_irq(&mut self, mask: u32) -> Result<()> {
        self.write_reg(registers::IRQ_CLEAR, mask)
    }

    /// Put the transceiver state machine into idle, then transceive.
    fn start_transceive(&mut self) -> Result<()> {
        self.write_reg_and_mask(registers::SYSTEM_CONFIG, 0xFFFF_FFF8)?;
        self.write_reg_or_mask(registers::SYSTEM_CONFIG, 0x0000_0003)
    }

    fn send_data(&mut self, data: &[u8], valid_bits: u8) -> Result<()> {
        let mut frame = Vec::with_capacity(data.len() + 2);
        frame.push(commands::SEND_DATA);
        frame.push(valid_bits);
        frame.extend_from_slice(data);
        self.transceive(&frame, 0)?;
        Ok(())
    }

    /// Wait for the receive IRQ; `None` when nothing answered in time.
    fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        let mut steps = spin_steps(RX_TIMEOUT);
        loop {
            if self.read_reg(registers::IRQ_STATUS)? & irq::RX != 0 {
                break;
            }
            if steps == 0 {
                return Ok(None);
            }
            self.delay.delay_ms(1);
            steps -= 1;
        }
        let len = (self.read_reg(registers::RX_STATUS)? & 0x1FF) as usize;
        self.clear_irq(irq::ALL)?;
        if len == 0 {
            return Ok(None);
        }
        let data = self.transceive(&[commands::READ_DATA, 0x00], len)?;
        Ok(Some(data))
    }

    fn exchange(&mut self, data: &[u8], valid_bits: u8) -> Result<Option<Vec<u8>>> {
        self.clear_irq(irq::ALL)?;
        self.start_transceive()?;
        self.send_data(data, valid_bits)?;
        self.receive()
    }

    fn set_crc(&mut self, enabled: bool) -> Result<()> {
        for reg in [registers::CRC_RX_CONFIG, registers::CRC_TX_CONFIG] {
            if enabled {
                self.write_reg_or_mask(reg, 0x0000_0001)?;
            } else {
                self.write_reg_and_mask(reg, 0xFFFF_FFFE)?;
            }
        }
        Ok(())
    }

    /// ISO15693 single-slot inventory. The UID comes back LSB first.
    pub fn inventory_iso15693(&mut self) -> Result<Option<Uid>> {
        self.load_rf_config(rf_config::ISO_15693_26)?;
        self.rf_on()?;
        // flags: high data rate, inventory, 1 slot; INVENTORY; mask length 0
        let Some(response) = self.exchange(&[0x26, 0x01, 0x00], 0)? else {
            return Ok(None);
        };
        if response.len() < 10 {
            return Err(Error::nak(format!("short inventory response ({} bytes)", response.len())));
        }
        if response[0] & 0x01 != 0 {
            trace!(flags = response[0], "inventory error flag");
            return Ok(None);
        }
        let mut uid = response[2..10].to_vec();
        uid.reverse();
        Uid::from_bytes(&uid)
            .map(Some)
            .map_err(|err| Error::nak(err.to_string()))
    }

    fn anticollision(&mut self, select: u8) -> Result<Option<[u8; 5]>> {
        let Some(response) = self.exchange(&[select, iso14443a::NVB_ANTICOLL], 0)? else {
            return Ok(None);
        };
        if response.len() < 5 {
            return Err(Error::nak("short anticollision response"));
        }
        let level = [response[0], response[1], response[2], response[3], response[4]];
        let bcc = level[..4].iter().fold(0u8, |acc, b| acc ^ b);
        if bcc != level[4] {
            return Err(Error::nak(format!("BCC mismatch: expected {bcc:#04X} got {:#04X}", level[4])));
        }
        Ok(Some(level))
    }

    /// REQA + anticollision for single and double size UIDs.
    pub fn activate_type_a(&mut self) -> Result<Option<Iso14443aCard>> {
        self.load_rf_config(rf_config::ISO_14443A_106)?;
        self.rf_on()?;
        self.set_crc(false)?;

        let Some(atqa) = self.exchange(&[iso14443a::REQA], 7)? else {
            return Ok(None);
        };
        if atqa.len() < 2 {
            return Err(Error::nak("short ATQA"));
        }
        let atqa = [atqa[0], atqa[1]];

        let Some(cl1) = self.anticollision(iso14443a::SEL_CL1)? else {
            return Ok(None);
        };
        if cl1[0] != iso14443a::CASCADE_TAG {
            let uid = Uid::from_bytes(&cl1[..4]).map_err(|err| Error::nak(err.to_string()))?;
            return Ok(Some(Iso14443aCard { uid, atqa, sak: None }));
        }

        // Double size UID: select cascade level 1 with CRC, then anticollide level 2.
        self.set_crc(true)?;
        let mut select = vec![iso14443a::SEL_CL1, iso14443a::NVB_SELECT];
        select.extend_from_slice(&cl1);
        let sak = self.exchange(&select, 0)?.and_then(|r| r.first().copied());
        self.set_crc(false)?;

        let Some(cl2) = self.anticollision(iso14443a::SEL_CL2)? else {
            return Ok(None);
        };
        let mut uid = cl1[1..4].to_vec();
        uid.extend_from_slice(&cl2[..4]);
        let uid = Uid::from_bytes(&uid).map_err(|err| Error::nak(err.to_string()))?;
        Ok(Some(Iso14443aCard { uid, atqa, sak }))
    }

    fn read_type_a(&mut self) -> Result<Option<TagRead>> {
        Ok(self.activate_type_a()?.map(|card| TagRead {
            uid: card.uid,
            protocol: Protocol::Iso14443A,
        }))
    }

    fn read_iso15693(&mut self) -> Result<Option<TagRead>> {
        Ok(self.inventory_iso15693()?.map(|uid| TagRead {
            uid,
            protocol: Protocol::Iso15693,
        }))
    }

    fn enter_lpcd_mode(&mut self) -> Result<()> {
        let counter = u16::try_from(self.lpcd_interval.as_millis()).unwrap_or(u16::MAX);
        let [lo, hi] = counter.to_le_bytes();
        self.clear_irq(irq::ALL)?;
        self.write_reg_or_mask(registers::IRQ_ENABLE, irq::LPCD)?;
        self.transceive(&[commands::SWITCH_MODE, mode::LPCD, lo, hi], 0)?;
        self.field_on = false;
        Ok(())
    }
}

impl<SPI, BUSY, RST, D> Chip for Pn5180<SPI, BUSY, RST, D>
where
    SPI: SpiDevice,
    BUSY: InputPin,
    RST: OutputPin,
    D: DelayNs,
{
    fn read_uid(&mut self) -> Result<Option<TagRead>> {
        match self.priority {
            Protocol::Iso15693 => self.read_iso15693(),
            Protocol::Iso14443A => self.read_type_a(),
            Protocol::Auto => match self.read_iso15693()? {
                Some(tag) => Ok(Some(tag)),
                None => self.read_type_a(),
            },
            other => Err(Error::UnsupportedProtocol { protocol: other }),
        }
    }

    fn write_register(&mut self, register: Register, value: &[u8]) -> Result<()> {
        let byte = value.first().copied().unwrap_or(0);
        match register {
            Register::RfPower => self.write_reg(registers::RF_CONTROL_TX, u32::from(byte)),
            Register::ProtocolPriority => {
                let protocol = Protocol::from_code(byte)
                    .ok_or_else(|| Error::nak(format!("unknown protocol code {byte}")))?;
                self.priority = protocol;
                match protocol {
                    Protocol::Iso14443A => self.load_rf_config(rf_config::ISO_14443A_106),
                    Protocol::Iso14443B => self.load_rf_config(rf_config::ISO_14443B_106),
                    Protocol::Felica => self.load_rf_config(rf_config::FELICA_212),
                    Protocol::Iso15693 | Protocol::Auto => {
                        self.load_rf_config(rf_config::ISO_15693_26)
                    }
                }
            }
            Register::CollisionAvoidance => {
                self.collision_avoidance = byte != 0;
                if self.field_on { self.rf_on() } else { Ok(()) }
            }
            Register::Agc | Register::FieldStrength | Register::Temperature => {
                Err(Error::Unsupported { what: "writing diagnostic registers" })
            }
        }
    }

    fn read_register(&mut self, register: Register) -> Result<u8> {
        match register {
            Register::RfPower => Ok((self.read_reg(registers::RF_CONTROL_TX)? & 0xFF) as u8),
            Register::ProtocolPriority => Ok(self.priority.code()),
            Register::CollisionAvoidance => Ok(u8::from(self.collision_avoidance)),
            // 10 bit AGC value, scaled to a byte
            Register::Agc => Ok(((self.read_reg(registers::AGC_REF_CONFIG)? & 0x3FF) >> 2) as u8),
            Register::FieldStrength => Ok(((self.read_reg(registers::RF_STATUS)? >> 8) & 0xFF) as u8),
            Register::Temperature => Ok((self.read_reg(registers::TEMP_CONTROL)? & 0xFF) as u8),
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.reset_pin.set_low().map_err(Error::bus)?;
        self.delay.delay_ms(10);
        self.reset_pin.set_high().map_err(Error::bus)?;
        self.delay.delay_ms(10);
        self.field_on = false;
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        let mut steps = spin_steps(timeout);
        loop {
            match self.read_reg(registers::IRQ_STATUS) {
                Ok(status) if status & irq::IDLE != 0 => break,
                Ok(_) | Err(Error::TransportTimeout) => {}
                Err(err) => return Err(err),
            }
            if steps == 0 {
                return Err(Error::TransportTimeout);
            }
            self.delay.delay_ms(1);
            steps -= 1;
        }
        self.clear_irq(irq::ALL)?;
        let (major, minor) = self.firmware_version()?;
        debug!(major, minor, "PN5180 firmware");
        Ok(())
    }

    fn probe(&mut self) -> Result<()> {
        let (major, minor) = self.firmware_version()?;
        if (major == 0xFF && minor == 0xFF) || (major == 0 && minor == 0) {
            return Err(Error::nak(format!("implausible firmware version {major}.{minor}")));
        }
        Ok(())
    }

    fn set_field(&mut self, on: bool) -> Result<()> {
        if on { self.rf_on() } else { self.rf_off() }
    }

    fn enter_lpcd(&mut self, interval: Duration) -> Result<()> {
        self.lpcd_interval = interval;
        self.enter_lpcd_mode()
    }

    /// Reading IRQ_STATUS wakes the chip, so a quiet check re-arms LPCD.
    fn lpcd_woken(&mut self) -> Result<bool> {
        let status = self.read_reg(registers::IRQ_STATUS)?;
        if status & irq::LPCD != 0 {
            self.clear_irq(irq::LPCD)?;
            return Ok(true);
        }
        self.enter_lpcd_mode()?;
        Ok(false)
    }

    fn exit_lpcd(&mut self) -> Result<()> {
        self.write_reg_and_mask(registers::IRQ_ENABLE, !irq::LPCD)?;
        self.transceive(&[commands::SWITCH_MODE, mode::STANDBY, 0x00, 0x00], 0)?;
        self.clear_irq(irq::ALL)
    }
}
