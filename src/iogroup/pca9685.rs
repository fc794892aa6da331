use log::info;

use super::{PinSource, PwmChannelBackend, config_address, lease_i2c_pins};
use crate::config::IoGroupConfig;
use crate::error::{PiIoError, Result};
use crate::lease::PinLeaseRegistry;
use crate::pca9685::{
    CHANNEL_COUNT, DEFAULT_OSCILLATOR_HZ, OutputDrive, OutputWhenDisabled, Pca9685, Pca9685Config,
};
use crate::platform::Platform;

pub const DEFAULT_GROUP_FREQUENCY_HZ: u32 = 100;

fn parse_drive(group: &str, value: &str) -> Result<OutputDrive> {
    match value.to_ascii_lowercase().as_str() {
        "opendrain" => Ok(OutputDrive::OpenDrain),
        "totempole" => Ok(OutputDrive::TotemPole),
        _ => Err(PiIoError::ConfigInvalid(format!(
            "{group}: output-type '{value}' is not opendrain or totempole"
        ))),
    }
}

fn parse_when_disabled(group: &str, value: &str) -> Result<OutputWhenDisabled> {
    match value.to_ascii_lowercase().as_str() {
        "low" => Ok(OutputWhenDisabled::Low),
        "high" => Ok(OutputWhenDisabled::High),
        "float" => Ok(OutputWhenDisabled::HighImpedance),
        _ => Err(PiIoError::ConfigInvalid(format!(
            "{group}: output-on-disabled '{value}' is not low, high or float"
        ))),
    }
}

/// Chip settings from the group's configuration keys.
pub fn chip_config(config: &IoGroupConfig) -> Result<Pca9685Config> {
    let mut chip = Pca9685Config {
        frequency_hz: config.pwm_frequency.unwrap_or(DEFAULT_GROUP_FREQUENCY_HZ),
        oscillator_hz: config.osc_frequency.unwrap_or(DEFAULT_OSCILLATOR_HZ),
        external_clock: config.external_clock.unwrap_or(false),
        invert: config.output_invert.unwrap_or(false),
        ..Pca9685Config::default()
    };
    if let Some(drive) = &config.output_type {
        chip.output_drive = parse_drive(&config.name, drive)?;
    }
    if let Some(disabled) = &config.output_on_disabled {
        chip.when_disabled = parse_when_disabled(&config.name, disabled)?;
    }
    Ok(chip)
}

/// PCA9685 channels for a hardware PWM IO-group.
pub struct Pca9685Backend<P: Platform> {
    chip: Pca9685<P::Bus>,
}

impl<P: Platform> Pca9685Backend<P> {
    pub fn new(config: &IoGroupConfig, platform: &P, leases: &PinLeaseRegistry) -> Result<Self> {
        let address = config_address(config, 0x40..=0x7F)?;
        let settings = chip_config(config)?;
        lease_i2c_pins(leases, &config.name)?;

        let bus = platform.open_bus(address)?;
        let chip = Pca9685::new(bus, address, settings)?;
        info!(
            "{}: pca9685 at 0x{address:02x}, requested {}Hz, running {:.1}Hz",
            config.name,
            settings.frequency_hz,
            chip.actual_frequency()
        );
        Ok(Self { chip })
    }

    pub fn chip(&self) -> &Pca9685<P::Bus> {
        &self.chip
    }
}

impl<P: Platform> PinSource for Pca9685Backend<P> {
    fn pin_id(&self, pin: i64) -> Result<u16> {
        u16::try_from(pin)
            .ok()
            .filter(|&p| p < u16::from(CHANNEL_COUNT))
            .ok_or_else(|| {
                PiIoError::IoPinInvalid(format!("pca9685 channel {pin} outside 0..=15"))
            })
    }
}

impl<P: Platform> PwmChannelBackend for Pca9685Backend<P> {
    fn frequency(&self) -> f64 {
        self.chip.actual_frequency()
    }

    fn write_channel(&self, pin: u16, fraction: f64, offset: f64) -> Result<()> {
        self.chip.set_fraction(pin as u8, fraction, offset)
    }

    fn read_channel(&self, pin: u16) -> Result<(f64, f64)> {
        self.chip.fraction(pin as u8)
    }
}
