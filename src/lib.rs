pub mod button;
pub mod config;
pub mod error;
pub mod events;
pub mod gpio;
pub mod i2c;
pub mod iogroup;
pub mod lease;
pub mod manager;
pub mod mcp23017;
pub mod pca9685;
pub mod platform;
pub mod pwm_pin;
pub mod softpwm;
pub mod worker;

pub use config::{AppConfig, GroupKind, IoConfig, IoGroupConfig, IoKind, PinRef};
pub use error::{PiIoError, Result};
pub use events::{EventBus, EventSink, IoEvent};
pub use iogroup::{InputGroup, IoGroup, OutputGroup, PwmGroup};
pub use lease::PinLeaseRegistry;
pub use manager::IoManager;

#[cfg(feature = "hardware")]
pub use platform::LinuxPlatform;
pub use platform::{MockPlatform, Platform};
