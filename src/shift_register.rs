// src/shift_register.rs
//! Shadow-register driver for the SN74LV595A-style shift register that fans
//! out to the solenoid valve transistors.
//!
//! The hardware protocol has no random-access write: changing one output
//! means re-shifting the entire N-bit vector and pulsing the latch. The
//! driver therefore keeps a full-width in-memory shadow of the register and
//! re-serializes it on every `write_bit`. Do not "optimize" this to partial
//! writes.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ControlError, Result};
use crate::gpio::OutputLine;

/// Output lines wired to the register. `oe` and `srclr` are active-low and
/// optional; without them the driver falls back to equivalent shift paths.
pub struct ShiftRegisterPins {
    /// Serial data input.
    pub ser: Box<dyn OutputLine>,
    /// Shift clock; rising edge shifts `ser` in.
    pub srclk: Box<dyn OutputLine>,
    /// Storage (latch) clock; rising edge commits to the outputs.
    pub rclk: Box<dyn OutputLine>,
    /// Output enable, active low. Deasserted while shifting so the valve
    /// transistors never see intermediate register contents.
    pub oe: Option<Box<dyn OutputLine>>,
    /// Register clear, active low.
    pub srclr: Option<Box<dyn OutputLine>>,
}

pub struct ShiftRegister {
    bits: Vec<bool>,
    pins: ShiftRegisterPins,
}

impl ShiftRegister {
    /// Initializes the output lines and forces every channel low. Failure
    /// here is fatal to startup: running with an unknown valve state is not
    /// acceptable.
    pub fn new(num_bits: usize, mut pins: ShiftRegisterPins) -> Result<Self> {
        pins.ser.set_low()?;
        pins.srclk.set_low()?;
        pins.rclk.set_low()?;
        if let Some(srclr) = pins.srclr.as_mut() {
            srclr.set_high()?;
        }
        if let Some(oe) = pins.oe.as_mut() {
            oe.set_low()?;
        }

        let mut reg = Self {
            bits: vec![false; num_bits],
            pins,
        };
        reg.set_all_low()?;
        Ok(reg)
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// In-memory mirror of the latched output state.
    pub fn shadow(&self) -> &[bool] {
        &self.bits
    }

    /// Sets one logical channel without disturbing the others. The whole
    /// vector is re-shifted and latched; see the module docs.
    pub fn write_bit(&mut self, bit: usize, high: bool) -> Result<()> {
        if bit >= self.bits.len() {
            return Err(ControlError::ConfigError(format!(
                "Bit {} out of range for {}-bit shift register",
                bit,
                self.bits.len()
            )));
        }
        self.bits[bit] = high;
        self.shift_out()?;
        debug!(bit, high, "shift register bit written");
        Ok(())
    }

    /// Emergency/startup reset of every channel. Uses the dedicated clear
    /// line when wired, otherwise shifts an all-zero vector; both paths leave
    /// the same final state.
    pub fn set_all_low(&mut self) -> Result<()> {
        for bit in self.bits.iter_mut() {
            *bit = false;
        }
        if self.pins.srclr.is_some() {
            self.pulse_clear()?;
            self.commit()?;
            Ok(())
        } else {
            self.shift_out()
        }
    }

    fn shift_out(&mut self) -> Result<()> {
        if let Some(oe) = self.pins.oe.as_mut() {
            oe.set_high()?;
        }
        self.pins.srclk.set_low()?;
        self.pins.rclk.set_low()?;
        for i in 0..self.bits.len() {
            self.pins.ser.set_level(self.bits[i])?;
            self.pins.srclk.set_high()?;
            self.pins.srclk.set_low()?;
        }
        self.commit()?;
        if let Some(oe) = self.pins.oe.as_mut() {
            oe.set_low()?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.pins.rclk.set_low()?;
        self.pins.rclk.set_high()?;
        self.pins.rclk.set_low()?;
        Ok(())
    }

    fn pulse_clear(&mut self) -> Result<()> {
        let srclr = self
            .pins
            .srclr
            .as_mut()
            .ok_or(ControlError::HardwareError("SRCLR pin not provided".into()))?;
        srclr.set_low()?;
        srclr.set_high()?;
        Ok(())
    }
}

/// Shared handle to the valve shift register. Every valve mutation in the
/// system goes through this one lock: concurrent unsynchronized writers
/// would interleave their shift sequences and corrupt the register.
#[derive(Clone)]
pub struct ValveBank {
    register: Arc<Mutex<ShiftRegister>>,
}

impl ValveBank {
    pub fn new(num_bits: usize, pins: ShiftRegisterPins) -> Result<Self> {
        let register = ShiftRegister::new(num_bits, pins)?;
        Ok(Self {
            register: Arc::new(Mutex::new(register)),
        })
    }

    pub async fn len(&self) -> usize {
        self.register.lock().await.len()
    }

    pub async fn write_bit(&self, bit: usize, high: bool) -> Result<()> {
        self.register.lock().await.write_bit(bit, high)
    }

    pub async fn set_all_low(&self) -> Result<()> {
        self.register.lock().await.set_all_low()
    }

    pub async fn shadow(&self) -> Vec<bool> {
        self.register.lock().await.shadow().to_vec()
    }
}
