mod digital;
mod gpio;
mod hwpwm;
mod mcp23017;
mod pca9685;

use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::config::{GroupKind, IoGroupConfig, PinRef};
use crate::error::{PiIoError, Result};
use crate::events::EventSink;
use crate::lease::PinLeaseRegistry;
use crate::platform::Platform;

pub use digital::{DigitalBackend, DigitalIoGroup, HandleRegistry, InputSettings, InputSink};
pub use gpio::GpioBackend;
pub use hwpwm::{HwPwmIoGroup, PwmChannelBackend};
pub use mcp23017::Mcp23017Backend;
pub use pca9685::Pca9685Backend;

pub type GpioIoGroup<P> = DigitalIoGroup<GpioBackend<P>>;
pub type Mcp23017IoGroup<P> = DigitalIoGroup<Mcp23017Backend<P>>;
pub type Pca9685IoGroup<P> = HwPwmIoGroup<Pca9685Backend<P>>;

pub const I2C_SDA_USAGE: &str = "I2C SDA";
pub const I2C_SCL_USAGE: &str = "I2C SCL";

/// Resolution of configured pin references into backend pin ids.
pub trait PinSource {
    fn pin_id(&self, pin: i64) -> Result<u16>;

    fn pin_id_by_name(&self, name: &str) -> Result<u16> {
        Err(PiIoError::FeatureNotImplemented(format!(
            "pin names are not supported ('{name}')"
        )))
    }

    fn resolve(&self, pin: &PinRef) -> Result<u16> {
        match pin {
            PinRef::Number(n) => self.pin_id(*n),
            PinRef::Name(name) => self.pin_id_by_name(name),
        }
    }
}

pub trait InputBackend {
    /// Logical level of an input pin, inversion applied.
    fn input_pin(&self, pin: u16) -> Result<bool> {
        Err(PiIoError::FeatureNotImplemented(format!(
            "input on pin {pin}"
        )))
    }
}

pub trait OutputBackend {
    fn set_output_pin(&self, pin: u16, value: bool) -> Result<()> {
        Err(PiIoError::FeatureNotImplemented(format!(
            "output on pin {pin} (value {value})"
        )))
    }
}

pub trait PwmBackend {
    fn prepare_pwm(&self, pin: u16) -> Result<()> {
        Err(PiIoError::FeatureNotImplemented(format!("pwm on pin {pin}")))
    }

    fn set_pwm_pin(&self, pin: u16, level: u8) -> Result<()> {
        Err(PiIoError::FeatureNotImplemented(format!(
            "pwm on pin {pin} (level {level})"
        )))
    }
}

/// Read access to button and input handles.
pub trait InputGroup {
    fn buttons(&self) -> Vec<String>;
    fn inputs(&self) -> Vec<String>;
    fn multibit_inputs(&self) -> Vec<String>;
    fn input(&self, handle: &str) -> Result<bool>;
    fn multibit_input(&self, handle: &str) -> Result<u32>;
}

/// Read/write access to output handles.
pub trait OutputGroup {
    fn outputs(&self) -> Vec<String>;
    fn multibit_outputs(&self) -> Vec<String>;
    fn output(&self, handle: &str) -> Result<bool>;
    fn set_output(&self, handle: &str, value: bool) -> Result<()>;
    fn multibit_output(&self, handle: &str) -> Result<u32>;
    fn set_multibit_output(&self, handle: &str, value: u32) -> Result<()>;
}

/// PWM handles. Digital groups take levels in 0..=255, hardware PWM groups
/// take values in the handle's configured range.
pub trait PwmGroup {
    fn pwms(&self) -> Vec<String>;
    fn pwm_value(&self, handle: &str) -> Result<f64>;
    fn set_pwm_value(&self, handle: &str, value: f64) -> Result<()>;
}

/// What every group constructor gets besides its own configuration.
#[derive(Clone)]
pub struct GroupContext {
    pub leases: Arc<PinLeaseRegistry>,
    pub events: EventSink,
}

pub enum IoGroup<P: Platform> {
    Gpio(Arc<GpioIoGroup<P>>),
    Mcp23017(Arc<Mcp23017IoGroup<P>>),
    Pca9685(Arc<Pca9685IoGroup<P>>),
}

impl<P: Platform> IoGroup<P> {
    pub fn name(&self) -> &str {
        match self {
            IoGroup::Gpio(group) => group.name(),
            IoGroup::Mcp23017(group) => group.name(),
            IoGroup::Pca9685(group) => group.name(),
        }
    }

    pub fn kind(&self) -> GroupKind {
        match self {
            IoGroup::Gpio(_) => GroupKind::Gpio,
            IoGroup::Mcp23017(_) => GroupKind::Mcp23017,
            IoGroup::Pca9685(_) => GroupKind::Pca9685,
        }
    }

    pub fn as_input(&self) -> Option<&dyn InputGroup> {
        match self {
            IoGroup::Gpio(group) => Some(group.as_ref()),
            IoGroup::Mcp23017(group) => Some(group.as_ref()),
            IoGroup::Pca9685(_) => None,
        }
    }

    pub fn as_output(&self) -> Option<&dyn OutputGroup> {
        match self {
            IoGroup::Gpio(group) => Some(group.as_ref()),
            IoGroup::Mcp23017(group) => Some(group.as_ref()),
            IoGroup::Pca9685(_) => None,
        }
    }

    pub fn as_pwm(&self) -> &dyn PwmGroup {
        match self {
            IoGroup::Gpio(group) => group.as_ref(),
            IoGroup::Mcp23017(group) => group.as_ref(),
            IoGroup::Pca9685(group) => group.as_ref(),
        }
    }
}

/// Builds the IO-group selected by the configuration's `type`.
pub fn create_io_group<P: Platform>(
    config: &IoGroupConfig,
    platform: &Arc<P>,
    context: &GroupContext,
) -> Result<IoGroup<P>> {
    match config.group_kind()? {
        GroupKind::Gpio => {
            let backend = GpioBackend::new(config, platform.clone(), context.leases.clone());
            let group = DigitalIoGroup::new(config, backend, context.events.clone())?;
            Ok(IoGroup::Gpio(group))
        }
        GroupKind::Mcp23017 => {
            let backend = Mcp23017Backend::new(config, platform.clone(), context)?;
            let group = DigitalIoGroup::new(config, backend, context.events.clone())?;
            Ok(IoGroup::Mcp23017(group))
        }
        GroupKind::Pca9685 => {
            let backend = Pca9685Backend::new(config, platform.as_ref(), &context.leases)?;
            let group = HwPwmIoGroup::new(config, backend, context.events.clone())?;
            Ok(IoGroup::Pca9685(group))
        }
    }
}

/// Takes shared leases on the user I2C bus lines for a chip on that bus.
pub(crate) fn lease_i2c_pins(leases: &PinLeaseRegistry, group: &str) -> Result<()> {
    let (sda, scl) = leases.board().i2c_pins();
    for (pin, usage) in [(sda, I2C_SDA_USAGE), (scl, I2C_SCL_USAGE)] {
        if !leases.request_shared(pin, group, usage) {
            return Err(PiIoError::IoPinInvalid(format!(
                "{group}: gpio{pin} for {usage} is held by {}",
                leases.current_leaser(pin)
            )));
        }
    }
    Ok(())
}

pub(crate) fn config_address(config: &IoGroupConfig, range: RangeInclusive<u8>) -> Result<u8> {
    let address = config.address.ok_or_else(|| {
        PiIoError::ConfigInvalid(format!("{}: missing 'address'", config.name))
    })?;
    u8::try_from(address)
        .ok()
        .filter(|a| range.contains(a))
        .ok_or_else(|| {
            PiIoError::ConfigInvalid(format!(
                "{}: address 0x{address:x} outside 0x{:02x}..=0x{:02x}",
                config.name,
                range.start(),
                range.end()
            ))
        })
}
