use embedded_hal::i2c::I2c;

use crate::error::{PiIoError, Result};

/// 8/16-bit register access to one device on an I2C bus.
///
/// 16-bit values are transferred low byte first.
pub struct RegisterDevice<I> {
    bus: I,
    address: u8,
}

impl<I: I2c> RegisterDevice<I> {
    pub fn new(bus: I, address: u8) -> Self {
        Self { bus, address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    fn failed(&self, op: &str, reg: u8, e: impl core::fmt::Debug) -> PiIoError {
        PiIoError::OperationFailed(format!(
            "i2c {op} 0x{:02x} register 0x{reg:02x}: {e:?}",
            self.address
        ))
    }

    pub fn read8(&mut self, reg: u8) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.bus
            .write_read(self.address, &[reg], &mut buf)
            .map_err(|e| self.failed("read", reg, e))?;
        Ok(buf[0])
    }

    pub fn write8(&mut self, reg: u8, value: u8) -> Result<()> {
        self.bus
            .write(self.address, &[reg, value])
            .map_err(|e| self.failed("write", reg, e))
    }

    pub fn read16(&mut self, reg: u8) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.bus
            .write_read(self.address, &[reg], &mut buf)
            .map_err(|e| self.failed("read", reg, e))?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn write16(&mut self, reg: u8, value: u16) -> Result<()> {
        let [lo, hi] = value.to_le_bytes();
        self.bus
            .write(self.address, &[reg, lo, hi])
            .map_err(|e| self.failed("write", reg, e))
    }
}
