use std::fs::OpenOptions;
use std::thread;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use super::Pull;
use crate::error::{PiIoError, Result};

const GPIOMEM_PATH: &str = "/dev/gpiomem";
const BLOCK_SIZE: usize = 4096;

// word offsets into the GPIO register block
const GPSET0: usize = 0x1C / 4;
const GPCLR0: usize = 0x28 / 4;
const GPLEV0: usize = 0x34 / 4;
const GPPUD: usize = 0x94 / 4;
const GPPUDCLK0: usize = 0x98 / 4;
const GPPUPPDN0: usize = 0xE4 / 4;
const GPPUPPDN3: usize = 0xF0 / 4;

// legacy chips read this filler from the unused pull register space
const LEGACY_FILLER: u32 = 0x6770_696f;

/// Register-mapped access to the BCM283x/BCM2711 GPIO block.
pub struct GpioMem {
    map: Mutex<MmapMut>,
    bcm2711: bool,
}

impl GpioMem {
    pub fn open() -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(GPIOMEM_PATH)
            .map_err(|e| PiIoError::OperationFailed(format!("open {GPIOMEM_PATH}: {e}")))?;
        // SAFETY: the kernel exposes exactly one page of GPIO registers here;
        // the mapping is only touched through volatile word accesses below.
        let map = unsafe { MmapOptions::new().len(BLOCK_SIZE).map_mut(&file) }
            .map_err(|e| PiIoError::OperationFailed(format!("map {GPIOMEM_PATH}: {e}")))?;

        let mem = Self {
            map: Mutex::new(map),
            bcm2711: false,
        };
        let bcm2711 = mem.read(GPPUPPDN3) != LEGACY_FILLER;
        Ok(Self { bcm2711, ..mem })
    }

    fn read(&self, word: usize) -> u32 {
        let map = self.map.lock();
        // SAFETY: word < BLOCK_SIZE / 4 for every register constant above.
        unsafe { (map.as_ptr() as *const u32).add(word).read_volatile() }
    }

    fn write(&self, word: usize, value: u32) {
        let mut map = self.map.lock();
        // SAFETY: see `read`.
        unsafe { (map.as_mut_ptr() as *mut u32).add(word).write_volatile(value) }
    }

    pub fn level(&self, pin: u16) -> bool {
        let pin = usize::from(pin);
        self.read(GPLEV0 + pin / 32) & (1 << (pin % 32)) != 0
    }

    pub fn set_level(&self, pin: u16, value: bool) {
        let pin = usize::from(pin);
        let base = if value { GPSET0 } else { GPCLR0 };
        self.write(base + pin / 32, 1 << (pin % 32));
    }

    pub fn set_pull(&self, pin: u16, pull: Pull) {
        let pin = usize::from(pin);
        if self.bcm2711 {
            let bits = match pull {
                Pull::Off => 0,
                Pull::Up => 1,
                Pull::Down => 2,
            };
            let word = GPPUPPDN0 + pin / 16;
            let shift = (pin % 16) * 2;
            let mut map = self.map.lock();
            // SAFETY: see `read`; the lock keeps the read-modify-write atomic.
            unsafe {
                let reg = (map.as_mut_ptr() as *mut u32).add(word);
                let current = reg.read_volatile();
                reg.write_volatile((current & !(3 << shift)) | (bits << shift));
            }
            return;
        }

        let bits = match pull {
            Pull::Off => 0,
            Pull::Down => 1,
            Pull::Up => 2,
        };
        // control signal, then clock it into the pin, then release both
        self.write(GPPUD, bits);
        thread::sleep(Duration::from_micros(5));
        self.write(GPPUDCLK0 + pin / 32, 1 << (pin % 32));
        thread::sleep(Duration::from_micros(5));
        self.write(GPPUD, 0);
        self.write(GPPUDCLK0 + pin / 32, 0);
    }
}
