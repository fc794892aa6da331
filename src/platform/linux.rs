use std::path::PathBuf;
use std::sync::Arc;

use linux_embedded_hal::I2cdev;
use log::{info, warn};

use super::Platform;
use crate::error::{PiIoError, Result};
use crate::gpio::{Board, Direction, Edge, GpioMem, SYSFS_GPIO_ROOT, SysfsLine};

/// Raspberry Pi hardware: sysfs GPIO, `/dev/gpiomem` when accessible and
/// the user I2C bus.
pub struct LinuxPlatform {
    board: Board,
    sysfs_root: PathBuf,
    gpiomem: Option<Arc<GpioMem>>,
}

impl LinuxPlatform {
    pub fn new() -> Self {
        let board = Board::detect();
        info!(
            "Board {} revision {:x}, i2c on {}",
            board.hardware(),
            board.revision(),
            board.i2c_bus_path()
        );
        let gpiomem = match GpioMem::open() {
            Ok(mem) => Some(Arc::new(mem)),
            Err(e) => {
                warn!("GPIO register access unavailable, using sysfs only: {e}");
                None
            }
        };
        Self {
            board,
            sysfs_root: PathBuf::from(SYSFS_GPIO_ROOT),
            gpiomem,
        }
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for LinuxPlatform {
    type Line = SysfsLine;
    type Bus = I2cdev;

    fn board(&self) -> &Board {
        &self.board
    }

    fn open_line(&self, pin: u16, direction: Direction, edge: Edge) -> Result<SysfsLine> {
        SysfsLine::open(
            &self.sysfs_root,
            pin,
            direction,
            edge,
            self.gpiomem.clone(),
        )
    }

    fn open_bus(&self, address: u8) -> Result<I2cdev> {
        let path = self.board.i2c_bus_path();
        I2cdev::new(path).map_err(|e| {
            PiIoError::OperationFailed(format!("open {path} for 0x{address:02x}: {e}"))
        })
    }
}
