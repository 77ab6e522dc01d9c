//! PN532 NFC controller driver.
//!
//! The PN532 speaks the same framed host protocol over every interface:
//!
//! ```text
//! host -> chip: 00 00 FF LEN LCS D4 CMD DATA.. DCS 00
//! chip -> host: 00 00 FF 00 FF 00                      (ACK)
//! chip -> host: 00 00 FF LEN LCS D5 CMD+1 DATA.. DCS 00
//! ```
//!
//! Only the byte shuffling differs between SPI and I2C, so the transports
//! implement [`Pn532Interface`] and this module owns framing, checksums,
//! ready polling and the command set.
//!
//! PN532 User Manual: https://www.nxp.com/docs/en/user-guide/141520.pdf

use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use tracing::{debug, trace, warn};

use super::{Chip, Register, TagRead, spin_steps};
use crate::config::Protocol;
use crate::error::{Error, Result};
use crate::uid::Uid;

/// PN532 command codes
#[allow(dead_code)]
pub mod commands {
    pub const GET_FIRMWARE_VERSION: u8 = 0x02;
    pub const READ_REGISTER: u8 = 0x06;
    pub const WRITE_REGISTER: u8 = 0x08;
    pub const SAM_CONFIGURATION: u8 = 0x14;
    pub const POWER_DOWN: u8 = 0x16;
    pub const RF_CONFIGURATION: u8 = 0x32;
    pub const IN_LIST_PASSIVE_TARGET: u8 = 0x4A;
}

/// CIU register addresses (16 bit, accessed through READ/WRITE_REGISTER)
pub mod registers {
    pub const CIU_RF_CFG: u16 = 0x6316;
    pub const CIU_CW_GS_P: u16 = 0x6318;
    pub const CIU_STATUS2: u16 = 0x6338;
}

/// RFConfiguration items
mod rf_items {
    pub const FIELD: u8 = 0x01;
    pub const MAX_RETRIES: u8 = 0x05;
}

/// InListPassiveTarget baud rate / modulation (BrTy)
mod brty {
    pub const ISO14443A_106: u8 = 0x00;
    pub const FELICA_212: u8 = 0x01;
    pub const ISO14443B_106: u8 = 0x03;
}

pub const PREAMBLE: u8 = 0x00;
pub const STARTCODE2: u8 = 0xFF;
pub const POSTAMBLE: u8 = 0x00;
pub const HOST_TO_PN532: u8 = 0xD4;
pub const PN532_TO_HOST: u8 = 0xD5;
pub const ACK: [u8; 6] = [0x00, 0x00, 0xFF, 0x00, 0xFF, 0x00];

/// Ready polling ceiling for ordinary command responses.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Firmware version attempts while waiting for a freshly reset chip.
const FIRMWARE_ATTEMPTS: u32 = 3;
const FIRMWARE_RETRY_DELAY_MS: u32 = 50;

/// Byte transport to a PN532 (SPI or I2C).
pub trait Pn532Interface {
    fn write_data(&mut self, data: &[u8]) -> Result<()>;

    /// Read `len` bytes of frame data (transport prefixes already stripped).
    fn read_data(&mut self, len: usize) -> Result<Vec<u8>>;

    /// Single non-blocking readiness check.
    fn is_read_ready(&mut self) -> Result<bool>;
}

/// Build a host-to-chip information frame around `data` (command + params).
pub fn encode_frame(data: &[u8]) -> Vec<u8> {
    let len = (data.len() + 1) as u8;
    let lcs = (!len).wrapping_add(1);
    let sum = data
        .iter()
        .fold(HOST_TO_PN532, |acc, byte| acc.wrapping_add(*byte));
    let dcs = (!sum).wrapping_add(1);

    let mut frame = Vec::with_capacity(data.len() + 8);
    frame.extend_from_slice(&[PREAMBLE, PREAMBLE, STARTCODE2, len, lcs, HOST_TO_PN532]);
    frame.extend_from_slice(data);
    frame.push(dcs);
    frame.push(POSTAMBLE);
    frame
}

/// Validate a 7 byte response header and return the payload length.
pub fn parse_header(header: &[u8], command: u8) -> Result<usize> {
    if header.len() < 7 {
        return Err(Error::nak(format!("short header ({} bytes)", header.len())));
    }
    if header[0] != PREAMBLE || header[1] != PREAMBLE || header[2] != STARTCODE2 {
        return Err(Error::nak(format!(
            "bad preamble {:02X} {:02X} {:02X}",
            header[0], header[1], header[2]
        )));
    }
    let len = header[3];
    let lcs = header[4];
    if len.wrapping_add(lcs) != 0 {
        return Err(Error::nak(format!("LCS mismatch: len={len:#04X} lcs={lcs:#04X}")));
    }
    if header[5] != PN532_TO_HOST {
        return Err(Error::nak(format!("unexpected TFI {:#04X}", header[5])));
    }
    if header[6] != command.wrapping_add(1) {
        return Err(Error::nak(format!(
            "response command mismatch: {:#04X} vs {:#04X}",
            header[6],
            command.wrapping_add(1)
        )));
    }
    if len < 2 {
        return Err(Error::nak(format!("frame length {len} too short")));
    }
    Ok(usize::from(len - 2))
}

/// Check the data checksum of `raw` (payload + DCS + postamble) and return the payload.
pub fn verify_payload(command: u8, raw: &[u8], payload_len: usize) -> Result<Vec<u8>> {
    if raw.len() < payload_len + 1 {
        return Err(Error::nak(format!(
            "payload truncated: {} of {} bytes",
            raw.len(),
            payload_len + 1
        )));
    }
    let sum = raw[..payload_len].iter().fold(
        PN532_TO_HOST.wrapping_add(command.wrapping_add(1)),
        |acc, byte| acc.wrapping_add(*byte),
    );
    let expected = (!sum).wrapping_add(1);
    if raw[payload_len] != expected {
        return Err(Error::nak(format!(
            "DCS mismatch: expected {expected:#04X} got {:#04X}",
            raw[payload_len]
        )));
    }
    Ok(raw[..payload_len].to_vec())
}

/// Firmware identification returned by GetFirmwareVersion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub ic: u8,
    pub version: u8,
    pub revision: u8,
    pub support: u8,
}

/// PN532 driver over any [`Pn532Interface`], with a reset (RSTPDN) line.
pub struct Pn532<I, RST, D> {
    iface: I,
    reset_pin: RST,
    delay: D,
    modulation: u8,
    preferred: Protocol,
    power_level: u8,
    collision_avoidance: bool,
    field_on: bool,
}

impl<I, RST, D> Pn532<I, RST, D>
where
    I: Pn532Interface,
    RST: OutputPin,
    D: DelayNs,
{
    pub fn new(iface: I, reset_pin: RST, delay: D) -> Self {
        Self {
            iface,
            reset_pin,
            delay,
            modulation: brty::ISO14443A_106,
            preferred: Protocol::Auto,
            power_level: 0,
            collision_avoidance: true,
            field_on: false,
        }
    }

    /// Release the interface and pins
    pub fn release(self) -> (I, RST, D) {
        (self.iface, self.reset_pin, self.delay)
    }

    /// Spin until the chip signals ready. Expiry is a transport timeout.
    fn wait_for_ready(&mut self, budget_ms: &mut u32) -> Result<()> {
        loop {
            if self.iface.is_read_ready()? {
                return Ok(());
            }
            if *budget_ms == 0 {
                return Err(Error::TransportTimeout);
            }
            self.delay.delay_ms(1);
            *budget_ms -= 1;
        }
    }

    fn write_command(&mut self, data: &[u8], budget_ms: &mut u32) -> Result<()> {
        self.iface.write_data(&encode_frame(data))?;
        self.wait_for_ready(budget_ms)?;
        let ack = self.iface.read_data(ACK.len())?;
        if ack != ACK {
            trace!(?ack, "invalid ACK");
            return Err(Error::nak("invalid ACK frame"));
        }
        Ok(())
    }

    fn read_response(&mut self, command: u8, budget_ms: &mut u32) -> Result<Vec<u8>> {
        self.wait_for_ready(budget_ms)?;
        let header = self.iface.read_data(7)?;
        let payload_len = parse_header(&header, command)?;
        if payload_len == 0 {
            return Ok(Vec::new());
        }
        let raw = self.iface.read_data(payload_len + 2)?;
        verify_payload(command, &raw, payload_len)
    }

    /// Send a command and return its response payload (after CMD+1).
    fn command(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut budget = spin_steps(RESPONSE_TIMEOUT);
        self.command_within(data, &mut budget)
    }

    fn command_within(&mut self, data: &[u8], budget_ms: &mut u32) -> Result<Vec<u8>> {
        let command = data[0];
        self.write_command(data, budget_ms)?;
        self.read_response(command, budget_ms)
    }

    /// Abort the pending command by sending an ACK frame.
    fn abort(&mut self) {
        if let Err(err) = self.iface.write_data(&ACK) {
            debug!(%err, "failed to send abort ACK");
        }
    }

    pub fn firmware_version(&mut self) -> Result<FirmwareVersion> {
        let mut budget = spin_steps(RESPONSE_TIMEOUT);
        self.firmware_version_within(&mut budget)
    }

    fn firmware_version_within(&mut self, budget_ms: &mut u32) -> Result<FirmwareVersion> {
        let response = self.command_within(&[commands::GET_FIRMWARE_VERSION], budget_ms)?;
        if response.len() < 4 {
            return Err(Error::nak(format!(
                "firmware version response too short ({} bytes)",
                response.len()
            )));
        }
        Ok(FirmwareVersion {
            ic: response[0],
            version: response[1],
            revision: response[2],
            support: response[3],
        })
    }

    fn write_ciu(&mut self, address: u16, value: u8) -> Result<()> {
        let [hi, lo] = address.to_be_bytes();
        self.command(&[commands::WRITE_REGISTER, hi, lo, value])?;
        Ok(())
    }

    fn read_ciu(&mut self, address: u16) -> Result<u8> {
        let [hi, lo] = address.to_be_bytes();
        let response = self.command(&[commands::READ_REGISTER, hi, lo])?;
        response
            .first()
            .copied()
            .ok_or_else(|| Error::nak("empty ReadRegister response"))
    }

    fn send_field_config(&mut self) -> Result<()> {
        let flags = (u8::from(self.collision_avoidance) << 1) | u8::from(self.field_on);
        self.command(&[commands::RF_CONFIGURATION, rf_items::FIELD, flags])?;
        Ok(())
    }

    /// Normal mode, 1 s virtual card timeout, IRQ in use.
    fn configure_sam(&mut self, budget_ms: &mut u32) -> Result<()> {
        self.command_within(&[commands::SAM_CONFIGURATION, 0x01, 0x14, 0x01], budget_ms)?;
        Ok(())
    }

    /// Bound passive activation retries so InListPassiveTarget cannot block forever.
    fn limit_retries(&mut self, budget_ms: &mut u32) -> Result<()> {
        self.command_within(
            &[commands::RF_CONFIGURATION, rf_items::MAX_RETRIES, 0xFF, 0x01, 0x10],
            budget_ms,
        )?;
        Ok(())
    }

    fn in_list_request(&self) -> Vec<u8> {
        let mut request = vec![commands::IN_LIST_PASSIVE_TARGET, 0x01, self.modulation];
        match self.modulation {
            // FeliCa polling: system code FFFF, no request code, time slot 0
            brty::FELICA_212 => request.extend_from_slice(&[0x00, 0xFF, 0xFF, 0x00, 0x00]),
            // AFI 0: all type B families
            brty::ISO14443B_106 => request.push(0x00),
            _ => {}
        }
        request
    }

    fn parse_target(&self, response: &[u8]) -> Result<Option<TagRead>> {
        if response.first().copied().unwrap_or(0) == 0 {
            return Ok(None);
        }
        let (uid_bytes, protocol) = match self.modulation {
            brty::FELICA_212 => {
                // [nb, tg, pol_len, 0x01, IDm(8), PMm(8), ...]
                if response.len() < 12 {
                    return Err(Error::nak(format!("malformed FeliCa target ({} bytes)", response.len())));
                }
                (&response[4..12], Protocol::Felica)
            }
            brty::ISO14443B_106 => {
                // [nb, tg, 0x50, PUPI(4), app data(4), protocol info(3), ...]
                if response.len() < 7 {
                    return Err(Error::nak(format!("malformed type B target ({} bytes)", response.len())));
                }
                (&response[3..7], Protocol::Iso14443B)
            }
            _ => {
                // [nb, tg, SENS_RES(2), SEL_RES, nfcid_len, nfcid...]
                if response.len() < 6 {
                    return Err(Error::nak(format!(
                        "malformed InListPassiveTarget response ({} bytes)",
                        response.len()
                    )));
                }
                let nfcid_len = usize::from(response[5]);
                if response.len() < 6 + nfcid_len {
                    return Err(Error::nak(format!(
                        "NFCID length {nfcid_len} exceeds response ({} bytes)",
                        response.len()
                    )));
                }
                (&response[6..6 + nfcid_len], Protocol::Iso14443A)
            }
        };
        let uid = Uid::from_bytes(uid_bytes).map_err(|err| Error::nak(err.to_string()))?;
        Ok(Some(TagRead { uid, protocol }))
    }
}

impl<I, RST, D> Chip for Pn532<I, RST, D>
where
    I: Pn532Interface,
    RST: OutputPin,
    D: DelayNs,
{
    fn read_uid(&mut self) -> Result<Option<TagRead>> {
        let request = self.in_list_request();
        let mut budget = spin_steps(RESPONSE_TIMEOUT);
        self.write_command(&request, &mut budget)?;

        // No answer within the window means no tag in the field.
        match self.read_response(commands::IN_LIST_PASSIVE_TARGET, &mut budget) {
            Ok(response) => self.parse_target(&response),
            Err(Error::TransportTimeout) => {
                trace!("no target before readiness timeout, aborting");
                self.abort();
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn write_register(&mut self, register: Register, value: &[u8]) -> Result<()> {
        let byte = value.first().copied().unwrap_or(0);
        match register {
            Register::RfPower => {
                self.power_level = byte;
                self.write_ciu(registers::CIU_CW_GS_P, byte >> 2)
            }
            Register::ProtocolPriority => {
                let protocol = Protocol::from_code(byte)
                    .ok_or_else(|| Error::nak(format!("unknown protocol code {byte}")))?;
                self.preferred = protocol;
                self.modulation = match protocol {
                    Protocol::Iso14443B => brty::ISO14443B_106,
                    Protocol::Felica => brty::FELICA_212,
                    Protocol::Iso15693 => {
                        warn!("PN532 cannot poll ISO15693, falling back to ISO14443A");
                        brty::ISO14443A_106
                    }
                    Protocol::Iso14443A | Protocol::Auto => brty::ISO14443A_106,
                };
                Ok(())
            }
            Register::CollisionAvoidance => {
                self.collision_avoidance = byte != 0;
                self.send_field_config()
            }
            Register::Agc | Register::FieldStrength | Register::Temperature => {
                Err(Error::Unsupported { what: "writing diagnostic registers" })
            }
        }
    }

    fn read_register(&mut self, register: Register) -> Result<u8> {
        match register {
            Register::RfPower => {
                let raw = self.read_ciu(registers::CIU_CW_GS_P)? & 0x3F;
                // The register keeps 6 bits; map back onto the level we wrote.
                if raw == self.power_level >> 2 {
                    Ok(self.power_level)
                } else {
                    Ok(raw << 2)
                }
            }
            Register::ProtocolPriority => Ok(self.preferred.code()),
            Register::CollisionAvoidance => Ok(u8::from(self.collision_avoidance)),
            Register::Agc => Ok((self.read_ciu(registers::CIU_RF_CFG)? >> 4) & 0x07),
            Register::FieldStrength => Ok(self.read_ciu(registers::CIU_STATUS2)? & 0x0F),
            Register::Temperature => Err(Error::Unsupported { what: "temperature sensor" }),
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.reset_pin.set_low().map_err(Error::bus)?;
        self.delay.delay_ms(20);
        self.reset_pin.set_high().map_err(Error::bus)?;
        // Interface startup time
        self.delay.delay_ms(10);
        self.field_on = false;
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        let mut budget = spin_steps(timeout);
        let mut attempt = 0;
        let version = loop {
            attempt += 1;
            match self.firmware_version_within(&mut budget) {
                Ok(version) => break version,
                Err(err) if attempt < FIRMWARE_ATTEMPTS && budget > FIRMWARE_RETRY_DELAY_MS => {
                    warn!(attempt, %err, "GetFirmwareVersion failed, retrying");
                    self.delay.delay_ms(FIRMWARE_RETRY_DELAY_MS);
                    budget -= FIRMWARE_RETRY_DELAY_MS;
                }
                Err(err) => return Err(err),
            }
        };
        debug!(
            ic = version.ic,
            version = version.version,
            revision = version.revision,
            "PN532 firmware"
        );
        self.configure_sam(&mut budget)?;
        self.limit_retries(&mut budget)
    }

    fn probe(&mut self) -> Result<()> {
        self.firmware_version().map(|_| ())
    }

    fn set_field(&mut self, on: bool) -> Result<()> {
        self.field_on = on;
        self.send_field_config()
    }

    /// PowerDown with the RF level detector as wake source. The PN532 has no
    /// wake timer, so `interval` only paces the host's checks.
    fn enter_lpcd(&mut self, _interval: Duration) -> Result<()> {
        // wake on I2C, SPI and RF level detector
        let response = self.command(&[commands::POWER_DOWN, 0xA8])?;
        match response.first() {
            Some(0x00) => Ok(()),
            Some(status) => Err(Error::nak(format!("PowerDown status {status:#04X}"))),
            None => Err(Error::nak("empty PowerDown response")),
        }
    }

    fn lpcd_woken(&mut self) -> Result<bool> {
        self.iface.is_read_ready()
    }

    fn exit_lpcd(&mut self) -> Result<()> {
        // Any command wakes the chip; the first one may be lost.
        if self.probe().is_err() {
            self.probe()?;
        }
        Ok(())
    }
}
