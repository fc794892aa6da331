mod board;
mod gpiomem;
mod sysfs;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use board::{Board, PinLayout};
pub use gpiomem::GpioMem;
pub use sysfs::{SYSFS_GPIO_ROOT, SysfsLine};

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Pull {
    #[default]
    Off,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterruptEvent {
    pub pin: u16,
    pub edge: Edge,
    pub value: bool,
}

impl InterruptEvent {
    /// Event for an observed level, with the edge implied by the new level.
    pub fn from_level(pin: u16, value: bool) -> Self {
        Self {
            pin,
            edge: if value { Edge::Rising } else { Edge::Falling },
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Interrupt(InterruptEvent),
    /// The interrupt worker stopped on an I/O failure.
    Failed(String),
}

pub type LineHandler = Arc<dyn Fn(LineEvent) + Send + Sync>;

/// One native GPIO line, owned by exactly one driver.
///
/// Implementations serialize their own I/O; every method takes `&self`.
pub trait DigitalLine: Send + Sync + 'static {
    fn pin(&self) -> u16;
    fn direction(&self) -> Result<Direction>;
    fn set_direction(&self, direction: Direction) -> Result<()>;
    fn edge(&self) -> Result<Edge>;
    fn set_edge(&self, edge: Edge) -> Result<()>;
    fn set_pull(&self, pull: Pull) -> Result<()>;
    fn value(&self) -> Result<bool>;
    fn set_value(&self, value: bool) -> Result<()>;
    fn start_interrupts(&self, handler: LineHandler) -> Result<()>;
    fn stop_interrupts(&self);
}
