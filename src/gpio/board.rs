use std::fs;

use log::warn;

const CPUINFO_PATH: &str = "/proc/cpuinfo";

const REV1_PINS: [u16; 17] = [0, 1, 4, 7, 8, 9, 10, 11, 14, 15, 17, 18, 21, 22, 23, 24, 25];
const REV2_PINS: [u16; 21] = [
    2, 3, 4, 7, 8, 9, 10, 11, 14, 15, 17, 18, 22, 23, 24, 25, 27, 28, 29, 30, 31,
];
const FULL_RANGE_MAX: u16 = 31;

// new-style revision codes carry this flag
const NEW_STYLE_REVISION: u32 = 1 << 23;

const I2C_SDA_HEADER_PIN: i64 = 2;
const I2C_SCL_HEADER_PIN: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinLayout {
    Rev1,
    Rev2,
    FullRange,
}

/// Raspberry Pi board identity as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    hardware: String,
    revision: u32,
}

impl Board {
    pub fn new(hardware: impl Into<String>, revision: u32) -> Self {
        Self {
            hardware: hardware.into(),
            revision,
        }
    }

    /// Reads `/proc/cpuinfo`. Falls back to an unknown revision-1 board.
    pub fn detect() -> Self {
        match fs::read_to_string(CPUINFO_PATH) {
            Ok(text) => Self::from_cpuinfo(&text),
            Err(e) => {
                warn!("Unable to read {CPUINFO_PATH}: {e}");
                Self::new("unknown", 0)
            }
        }
    }

    pub fn from_cpuinfo(text: &str) -> Self {
        let mut hardware = String::from("unknown");
        let mut revision = 0;
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if key.eq_ignore_ascii_case("hardware") {
                hardware = value.to_string();
            } else if key.eq_ignore_ascii_case("revision") {
                revision = u32::from_str_radix(value, 16).unwrap_or(0);
            }
        }
        Self { hardware, revision }
    }

    pub fn hardware(&self) -> &str {
        &self.hardware
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn layout(&self) -> PinLayout {
        if self.hardware == "BCM2709" || self.revision & NEW_STYLE_REVISION != 0 {
            PinLayout::FullRange
        } else if self.revision & 0xFFFF < 4 {
            PinLayout::Rev1
        } else {
            PinLayout::Rev2
        }
    }

    /// Validates a header pin number, translating revision-2 numbering to
    /// revision-1 boards where the line moved.
    pub fn verify_pin(&self, pin: i64) -> Option<u16> {
        let pin = u16::try_from(pin).ok()?;
        match self.layout() {
            PinLayout::FullRange => (pin <= FULL_RANGE_MAX).then_some(pin),
            PinLayout::Rev1 => {
                let pin = match pin {
                    2 => 0,
                    3 => 1,
                    27 => 21,
                    other => other,
                };
                REV1_PINS.contains(&pin).then_some(pin)
            }
            PinLayout::Rev2 => REV2_PINS.contains(&pin).then_some(pin),
        }
    }

    /// Native (SDA, SCL) pins of the user I2C bus.
    pub fn i2c_pins(&self) -> (u16, u16) {
        let sda = self.verify_pin(I2C_SDA_HEADER_PIN).unwrap_or(2);
        let scl = self.verify_pin(I2C_SCL_HEADER_PIN).unwrap_or(3);
        (sda, scl)
    }

    pub fn i2c_bus_path(&self) -> &'static str {
        match self.layout() {
            PinLayout::Rev1 => "/dev/i2c-0",
            _ => "/dev/i2c-1",
        }
    }
}

impl Default for Board {
    /// Revision-2 model B layout.
    fn default() -> Self {
        Self::new("BCM2835", 0x000e)
    }
}
