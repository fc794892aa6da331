use std::cell::RefCell;
use std::sync::Arc;
use std::thread;

use embedded_hal::i2c::I2c;
use log::{debug, trace};
use parking_lot::{Mutex, ReentrantMutex};

use crate::error::{PiIoError, Result};
use crate::gpio::InterruptEvent;
use crate::i2c::RegisterDevice;
use crate::softpwm::{SoftPwmConfig, led_gamma};
use crate::worker::{Worker, make_realtime};

/// Register addresses in BANK=0 layout (A half; B half is `reg | 1`).
pub mod regs {
    pub const IODIR: u8 = 0x00;
    pub const IPOL: u8 = 0x02;
    pub const GPINTEN: u8 = 0x04;
    pub const DEFVAL: u8 = 0x06;
    pub const INTCON: u8 = 0x08;
    pub const IOCON: u8 = 0x0A;
    pub const GPPU: u8 = 0x0C;
    pub const INTF: u8 = 0x0E;
    pub const INTCAP: u8 = 0x10;
    pub const GPIO: u8 = 0x12;
    pub const OLAT: u8 = 0x14;

    pub const GPINTENA: u8 = 0x04;
    pub const GPINTENB: u8 = 0x05;
}

pub const PIN_COUNT: u8 = 16;
pub const DEFAULT_ADDRESS: u8 = 0x20;
pub const DEFAULT_NOISE_MARGIN: u32 = 4;
pub const DEFAULT_NOISE_TIMEOUT_MS: u64 = 400;

const IOCON_INTPOL: u8 = 0x02;
const IOCON_ODR: u8 = 0x04;
const IOCON_DISSLEW: u8 = 0x10;
const IOCON_SEQOP: u8 = 0x20;
const IOCON_MIRROR: u8 = 0x40;

// BANK=1 alias of GPINTENB; harmless to clear in BANK=0 mode
const BANK_RESET_REG: u8 = 0x05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwConfig {
    pub disable_slew: bool,
    pub int_mirror: bool,
    pub int_open_drain: bool,
    pub int_active_high: bool,
}

impl Default for HwConfig {
    fn default() -> Self {
        Self {
            disable_slew: false,
            int_mirror: true,
            int_open_drain: false,
            int_active_high: false,
        }
    }
}

impl HwConfig {
    /// IOCON value; sequential addressing is always disabled.
    pub fn iocon(&self) -> u8 {
        let mut value = IOCON_SEQOP;
        if self.disable_slew {
            value |= IOCON_DISSLEW;
        }
        if self.int_mirror {
            value |= IOCON_MIRROR;
        }
        if self.int_open_drain {
            value |= IOCON_ODR;
        }
        if self.int_active_high {
            value |= IOCON_INTPOL;
        }
        value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mcp23017Settings {
    pub address: u8,
    pub iodir: u16,
    pub ipol: u16,
    pub pullup: u16,
    pub hw: HwConfig,
    pub swap_ab: bool,
}

impl Default for Mcp23017Settings {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            iodir: 0xFFFF,
            ipol: 0,
            pullup: 0,
            hw: HwConfig::default(),
            swap_ab: false,
        }
    }
}

/// Suppresses interrupt bursts that flip more pins at once than expected.
#[derive(Debug, Clone)]
pub struct NoiseFilter {
    margin: u32,
    timeout_ms: u64,
    suppressed_until: Option<u64>,
}

impl NoiseFilter {
    /// A margin of 0 disables filtering.
    pub fn new(margin: u32, timeout_ms: u64) -> Self {
        Self {
            margin,
            timeout_ms,
            suppressed_until: None,
        }
    }

    pub fn is_suppressed(&self, now_ms: u64) -> bool {
        self.suppressed_until.is_some_and(|until| now_ms < until)
    }

    /// Turns interrupt flag/capture register contents into pin events.
    pub fn filter(&mut self, flags: u16, capture: u16, now_ms: u64) -> Vec<InterruptEvent> {
        if self.is_suppressed(now_ms) {
            return Vec::new();
        }
        self.suppressed_until = None;

        let changed = flags.count_ones();
        if self.margin != 0 && changed > self.margin {
            debug!("{changed} pins changed at once, suppressing interrupts");
            self.suppressed_until = Some(now_ms + self.timeout_ms);
            return Vec::new();
        }

        (0..PIN_COUNT as u16)
            .filter(|pin| flags & (1 << pin) != 0)
            .map(|pin| InterruptEvent::from_level(pin, capture & (1 << pin) != 0))
            .collect()
    }
}

struct PwmState {
    config: SoftPwmConfig,
    running: bool,
    mask: u16,
    levels: [u8; PIN_COUNT as usize],
    ticks: [u8; PIN_COUNT as usize],
    // None forces a latch write on the next tick
    last_out: Option<u16>,
}

impl PwmState {
    fn new() -> Self {
        Self {
            config: SoftPwmConfig::default(),
            running: false,
            mask: 0,
            levels: [0; PIN_COUNT as usize],
            ticks: [0; PIN_COUNT as usize],
            last_out: None,
        }
    }
}

struct Core<I> {
    address: u8,
    swap_ab: bool,
    bus: ReentrantMutex<RefCell<RegisterDevice<I>>>,
    pwm: Mutex<PwmState>,
}

impl<I: I2c> Core<I> {
    fn pair(&self, reg: u8) -> u8 {
        if self.swap_ab { reg | 1 } else { reg & 0xFE }
    }

    fn write8(&self, reg: u8, value: u8) -> Result<()> {
        let bus = self.bus.lock();
        bus.borrow_mut().write8(reg, value)
    }

    fn read16(&self, reg: u8) -> Result<u16> {
        let bus = self.bus.lock();
        bus.borrow_mut().read16(self.pair(reg))
    }

    fn write16(&self, reg: u8, value: u16) -> Result<()> {
        let bus = self.bus.lock();
        bus.borrow_mut().write16(self.pair(reg), value)
    }

    fn masked_write16(&self, reg: u8, value: u16, mask: u16) -> Result<()> {
        let reg = self.pair(reg);
        let guard = self.bus.lock();
        let mut bus = guard.borrow_mut();
        let current = bus.read16(reg)?;
        bus.write16(reg, (current & !mask) | (value & mask))
    }
}

fn check_pin(pin: u8) -> Result<()> {
    if pin >= PIN_COUNT {
        return Err(PiIoError::InvalidArgument(format!(
            "MCP23017 pin {pin} exceeds maximum pin id"
        )));
    }
    Ok(())
}

/// Register-level driver for the MCP23017 16-bit I2C IO expander, with a
/// software PWM worker on the output latch.
pub struct Mcp23017<I: I2c> {
    core: Arc<Core<I>>,
    worker: Mutex<Worker>,
}

impl<I: I2c + Send + 'static> Mcp23017<I> {
    pub fn new(bus: I, settings: Mcp23017Settings) -> Result<Self> {
        let core = Core {
            address: settings.address,
            swap_ab: settings.swap_ab,
            bus: ReentrantMutex::new(RefCell::new(RegisterDevice::new(bus, settings.address))),
            pwm: Mutex::new(PwmState::new()),
        };

        core.write8(BANK_RESET_REG, 0x00)?;
        core.write8(regs::IOCON, settings.hw.iocon())?;
        core.write8(regs::GPINTENA, 0x00)?;
        core.write8(regs::GPINTENB, 0x00)?;
        core.write16(regs::IODIR, settings.iodir)?;
        core.write16(regs::IPOL, settings.ipol)?;
        core.write16(regs::GPPU, settings.pullup)?;

        Ok(Self {
            worker: Mutex::new(Worker::new(format!("mcp23017-{:02x}-pwm", settings.address))),
            core: Arc::new(core),
        })
    }

    pub fn address(&self) -> u8 {
        self.core.address
    }

    pub fn int_config(&self, intcon: u16, defval: u16, int_enable: u16) -> Result<()> {
        self.core.write16(regs::INTCON, intcon)?;
        self.core.write16(regs::DEFVAL, defval)?;
        self.core.write16(regs::GPINTEN, int_enable)
    }

    pub fn int_flags(&self) -> Result<u16> {
        self.core.read16(regs::INTF)
    }

    /// Port levels latched at the last interrupt; reading clears it.
    pub fn int_capture(&self) -> Result<u16> {
        self.core.read16(regs::INTCAP)
    }

    pub fn set_default_value(&self, value: u16) -> Result<()> {
        self.core.write16(regs::DEFVAL, value)
    }

    pub fn default_value(&self) -> Result<u16> {
        self.core.read16(regs::DEFVAL)
    }

    pub fn set_int_enable(&self, value: u16) -> Result<()> {
        self.core.write16(regs::GPINTEN, value)
    }

    pub fn int_enable(&self) -> Result<u16> {
        self.core.read16(regs::GPINTEN)
    }

    pub fn set_int_control(&self, value: u16) -> Result<()> {
        self.core.write16(regs::INTCON, value)
    }

    pub fn int_control(&self) -> Result<u16> {
        self.core.read16(regs::INTCON)
    }

    pub fn set_ipol(&self, value: u16) -> Result<()> {
        self.core.write16(regs::IPOL, value)
    }

    pub fn ipol(&self) -> Result<u16> {
        self.core.read16(regs::IPOL)
    }

    pub fn set_pullup(&self, value: u16) -> Result<()> {
        self.core.write16(regs::GPPU, value)
    }

    pub fn pullup(&self) -> Result<u16> {
        self.core.read16(regs::GPPU)
    }

    pub fn output_latch(&self) -> Result<u16> {
        self.core.read16(regs::OLAT)
    }

    pub fn set_direction(&self, value: u16) -> Result<()> {
        self.core.write16(regs::IODIR, value)
    }

    pub fn direction(&self) -> Result<u16> {
        self.core.read16(regs::IODIR)
    }

    fn pwm_guard_mask(&self) -> u16 {
        let pwm = self.core.pwm.lock();
        if pwm.running { pwm.mask } else { 0 }
    }

    /// Writes the whole port, leaving pins under PWM untouched.
    pub fn set_value(&self, value: u16) -> Result<()> {
        let pwm_mask = self.pwm_guard_mask();
        if pwm_mask != 0 {
            return self.core.masked_write16(regs::GPIO, value, !pwm_mask);
        }
        self.core.write16(regs::GPIO, value)
    }

    pub fn value(&self) -> Result<u16> {
        self.core.read16(regs::GPIO)
    }

    pub fn set_masked_value(&self, value: u16, mask: u16) -> Result<()> {
        let mask = mask & !self.pwm_guard_mask();
        self.core.masked_write16(regs::GPIO, value, mask)
    }

    pub fn pin(&self, pin: u8) -> Result<bool> {
        check_pin(pin)?;
        Ok(self.value()? & (1 << pin) != 0)
    }

    pub fn set_pin(&self, pin: u8, value: bool) -> Result<()> {
        check_pin(pin)?;
        let mask = (1u16 << pin) & !self.pwm_guard_mask();
        if mask == 0 {
            return Err(PiIoError::InvalidArgument(format!(
                "MCP23017 pin {pin} is driven by pwm"
            )));
        }
        let value = if value { mask } else { 0 };
        self.core.masked_write16(regs::GPIO, value, mask)
    }

    pub fn is_pwm_running(&self) -> bool {
        self.core.pwm.lock().running
    }

    pub fn pwm_start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        {
            let mut pwm = self.core.pwm.lock();
            if pwm.running {
                return Ok(());
            }
            pwm.running = true;
            pwm.last_out = None;
        }

        let core = self.core.clone();
        let started = worker.start(
            move |token| {
                make_realtime();
                let mut counter: u8 = 0;
                while token.is_running() {
                    let (out, mask, changed, delay) = {
                        let mut pwm = core.pwm.lock();
                        let mut out = pwm.mask;
                        for pin in 0..PIN_COUNT {
                            if pwm.mask & (1 << pin) != 0 && counter >= pwm.ticks[usize::from(pin)]
                            {
                                out &= !(1 << pin);
                            }
                        }
                        let changed = pwm.last_out != Some(out);
                        pwm.last_out = Some(out);
                        counter = counter.wrapping_add(1);
                        if counter >= pwm.config.period_ticks {
                            counter = 0;
                        }
                        (out, pwm.mask, changed, pwm.config.tick_delay())
                    };
                    if changed {
                        if let Err(e) = core.masked_write16(regs::OLAT, out, mask) {
                            trace!("mcp23017 0x{:02x} pwm write: {e}", core.address);
                            core.pwm.lock().last_out = None;
                        }
                    }
                    thread::sleep(delay);
                }
                Ok(())
            },
            |_| {},
        );
        if started.is_err() {
            self.core.pwm.lock().running = false;
        }
        started
    }

    /// Stops the PWM worker and pulls every PWM pin low.
    pub fn pwm_stop(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        let mask = {
            let mut pwm = self.core.pwm.lock();
            if !pwm.running {
                return Ok(());
            }
            pwm.running = false;
            pwm.mask
        };
        worker.stop();
        self.core.masked_write16(regs::OLAT, 0, mask)
    }

    pub fn pwm_value(&self, pin: u8) -> Result<u8> {
        check_pin(pin)?;
        Ok(self.core.pwm.lock().levels[usize::from(pin)])
    }

    pub fn set_pwm_value(&self, pin: u8, level: u8) -> Result<()> {
        check_pin(pin)?;
        let mut pwm = self.core.pwm.lock();
        let ticks = pwm.config.duty_ticks(level);
        pwm.levels[usize::from(pin)] = level;
        pwm.ticks[usize::from(pin)] = ticks;
        pwm.last_out = None;
        Ok(())
    }

    pub fn set_pwm_led_value(&self, pin: u8, brightness: u8) -> Result<()> {
        self.set_pwm_value(pin, led_gamma(brightness))
    }

    pub fn pwm_state(&self, pin: u8) -> Result<bool> {
        check_pin(pin)?;
        Ok(self.core.pwm.lock().mask & (1 << pin) != 0)
    }

    pub fn set_pwm_state(&self, pin: u8, enabled: bool) -> Result<()> {
        check_pin(pin)?;
        let mut pwm = self.core.pwm.lock();
        if enabled {
            pwm.mask |= 1 << pin;
        } else {
            pwm.mask &= !(1 << pin);
        }
        pwm.last_out = None;
        Ok(())
    }

    pub fn pwm_config(&self) -> SoftPwmConfig {
        self.core.pwm.lock().config
    }

    pub fn set_pwm_config(&self, config: SoftPwmConfig) {
        let mut pwm = self.core.pwm.lock();
        pwm.config = config;
        for pin in 0..usize::from(PIN_COUNT) {
            if pwm.mask & (1 << pin) != 0 {
                pwm.ticks[pin] = config.duty_ticks(pwm.levels[pin]);
            }
        }
        pwm.last_out = None;
    }
}

impl<I: I2c> Drop for Mcp23017<I> {
    fn drop(&mut self) {
        let mut worker = self.worker.lock();
        let mask = {
            let mut pwm = self.core.pwm.lock();
            let mask = if pwm.running { pwm.mask } else { 0 };
            pwm.running = false;
            mask
        };
        worker.stop();
        if mask != 0 {
            // best effort, the bus may already be gone
            let _ = self.core.masked_write16(regs::OLAT, 0, mask);
        }
    }
}
