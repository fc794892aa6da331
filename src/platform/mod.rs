#[cfg(feature = "hardware")]
pub mod linux;
pub mod mock;

use embedded_hal::i2c::I2c;

use crate::error::Result;
use crate::gpio::{Board, DigitalLine, Direction, Edge};

#[cfg(feature = "hardware")]
pub use linux::LinuxPlatform;
pub use mock::{MockI2c, MockLine, MockPlatform};

/// Source of native GPIO lines and I2C bus handles for the IO-groups.
pub trait Platform: Send + Sync + 'static {
    type Line: DigitalLine;
    type Bus: I2c + Send + 'static;

    fn board(&self) -> &Board;
    fn open_line(&self, pin: u16, direction: Direction, edge: Edge) -> Result<Self::Line>;
    fn open_bus(&self, address: u8) -> Result<Self::Bus>;
}
