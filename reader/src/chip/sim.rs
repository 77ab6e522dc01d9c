//! Simulated front-end.
//!
//! Runs the whole reader on a desktop without hardware. Tag presence,
//! temperature and faults are set from the outside; every register write is
//! kept so callers can inspect what the reader did to the chip.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tracing::trace;

use super::{Chip, Register, TagRead};
use crate::config::Protocol;
use crate::error::{Error, Result};
use crate::uid::Uid;

#[derive(Debug, Default)]
pub struct SimChip {
    registers: BTreeMap<Register, u8>,
    /// Tag currently resting in the field.
    tag: Option<TagRead>,
    /// One-shot read outcomes, served before the resting tag.
    script: VecDeque<Result<Option<TagRead>>>,
    failing_registers: Vec<Register>,
    failing_probes: u32,
    failing_resets: u32,
    unsupported: Vec<Register>,
    field_on: bool,
    in_lpcd: bool,
    wake_pending: bool,
    /// Times a register access knocked the chip out of detect mode.
    lost_lpcd: u32,
    resets: u32,
    writes: Vec<(Register, u8)>,
    reads: u32,
}

impl SimChip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a tag in the field, or take it away with `None`.
    pub fn set_tag(&mut self, tag: Option<TagRead>) {
        self.tag = tag;
    }

    pub fn place(&mut self, uid: Uid, protocol: Protocol) {
        self.set_tag(Some(TagRead { uid, protocol }));
    }

    pub fn remove_tag(&mut self) {
        self.tag = None;
    }

    pub fn tag(&self) -> Option<&TagRead> {
        self.tag.as_ref()
    }

    /// Queue a one-shot outcome for a future `read_uid`.
    pub fn script(&mut self, outcome: Result<Option<TagRead>>) {
        self.script.push_back(outcome);
    }

    pub fn script_timeouts(&mut self, count: usize) {
        for _ in 0..count {
            self.script(Err(Error::TransportTimeout));
        }
    }

    /// Fail the next `count` resets at the ready wait.
    pub fn fail_resets(&mut self, count: u32) {
        self.failing_resets = count;
    }

    pub fn fail_probes(&mut self, count: u32) {
        self.failing_probes = count;
    }

    /// Make reads of `register` fail until [`SimChip::heal_register`].
    pub fn fail_register(&mut self, register: Register) {
        if !self.failing_registers.contains(&register) {
            self.failing_registers.push(register);
        }
    }

    pub fn heal_register(&mut self, register: Register) {
        self.failing_registers.retain(|r| *r != register);
    }

    /// Report `register` as absent on this chip, like a PN532 temperature read.
    pub fn without_register(mut self, register: Register) -> Self {
        self.unsupported.push(register);
        self
    }

    /// Change a register behind the reader's back.
    pub fn set_register(&mut self, register: Register, value: u8) {
        self.registers.insert(register, value);
    }

    pub fn register(&self, register: Register) -> Option<u8> {
        self.registers.get(&register).copied()
    }

    pub fn set_temperature(&mut self, celsius: f32) {
        let value = celsius.round().clamp(-128.0, 127.0) as i8 as u8;
        self.registers.insert(Register::Temperature, value);
    }

    /// Signal a field disturbance while in LPCD.
    pub fn wake(&mut self) {
        self.wake_pending = true;
    }

    pub fn in_lpcd(&self) -> bool {
        self.in_lpcd
    }

    pub fn lost_lpcd(&self) -> u32 {
        self.lost_lpcd
    }

    pub fn field_on(&self) -> bool {
        self.field_on
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn uid_reads(&self) -> u32 {
        self.reads
    }

    /// Every register write in order.
    pub fn writes(&self) -> &[(Register, u8)] {
        &self.writes
    }

    /// Like a PN532 in PowerDown, any register access silently ends detect
    /// mode and no wake is ever reported for it.
    fn leave_lpcd_on_access(&mut self) {
        if self.in_lpcd {
            trace!("register access while in LPCD");
            self.in_lpcd = false;
            self.wake_pending = false;
            self.lost_lpcd += 1;
        }
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }
}

impl Chip for SimChip {
    fn read_uid(&mut self) -> Result<Option<TagRead>> {
        self.reads += 1;
        self.field_on = true;
        let outcome = match self.script.pop_front() {
            Some(outcome) => outcome,
            None => Ok(self.tag.clone()),
        };
        trace!(?outcome, "simulated read");
        outcome
    }

    fn write_register(&mut self, register: Register, value: &[u8]) -> Result<()> {
        self.leave_lpcd_on_access();
        if self.unsupported.contains(&register) {
            return Err(Error::Unsupported { what: "simulated register" });
        }
        let byte = value.first().copied().unwrap_or(0);
        self.registers.insert(register, byte);
        self.writes.push((register, byte));
        Ok(())
    }

    fn read_register(&mut self, register: Register) -> Result<u8> {
        self.leave_lpcd_on_access();
        if self.unsupported.contains(&register) {
            return Err(Error::Unsupported { what: "simulated register" });
        }
        if self.failing_registers.contains(&register) {
            return Err(Error::TransportTimeout);
        }
        Ok(self.registers.get(&register).copied().unwrap_or(0))
    }

    fn reset(&mut self) -> Result<()> {
        self.resets += 1;
        // Volatile settings are lost; diagnostics keep reading the environment.
        for register in [Register::RfPower, Register::ProtocolPriority, Register::CollisionAvoidance] {
            self.registers.remove(&register);
        }
        self.field_on = false;
        self.in_lpcd = false;
        self.wake_pending = false;
        Ok(())
    }

    fn wait_ready(&mut self, _timeout: Duration) -> Result<()> {
        if self.failing_resets > 0 {
            self.failing_resets -= 1;
            return Err(Error::TransportTimeout);
        }
        Ok(())
    }

    fn probe(&mut self) -> Result<()> {
        if self.failing_probes > 0 {
            self.failing_probes -= 1;
            return Err(Error::nak("simulated probe failure"));
        }
        Ok(())
    }

    fn set_field(&mut self, on: bool) -> Result<()> {
        self.field_on = on;
        Ok(())
    }

    fn enter_lpcd(&mut self, _interval: Duration) -> Result<()> {
        self.in_lpcd = true;
        self.field_on = false;
        Ok(())
    }

    /// Wakes on an explicit [`SimChip::wake`].
    fn lpcd_woken(&mut self) -> Result<bool> {
        if !self.in_lpcd {
            return Ok(false);
        }
        Ok(std::mem::take(&mut self.wake_pending))
    }

    fn exit_lpcd(&mut self) -> Result<()> {
        self.in_lpcd = false;
        Ok(())
    }
}
