use std::cell::RefCell;

use embedded_hal::i2c::I2c;
use log::debug;
use parking_lot::ReentrantMutex;

use crate::error::{PiIoError, Result};
use crate::i2c::RegisterDevice;

pub mod regs {
    pub const MODE1: u8 = 0x00;
    pub const MODE2: u8 = 0x01;
    pub const SUBADR1: u8 = 0x02;
    pub const SUBADR2: u8 = 0x03;
    pub const SUBADR3: u8 = 0x04;
    pub const ALLCALLADR: u8 = 0x05;
    pub const ALL_LED_ON: u8 = 0xFA;
    pub const ALL_LED_OFF: u8 = 0xFC;
    pub const PRESCALE: u8 = 0xFE;

    pub const fn led_on(channel: u8) -> u8 {
        0x06 + 4 * channel
    }

    pub const fn led_off(channel: u8) -> u8 {
        0x08 + 4 * channel
    }
}

pub const CHANNEL_COUNT: u8 = 16;
pub const TICKS_PER_CYCLE: u16 = 4096;
/// Full-on (in ON) or full-off (in OFF) flag; full-off wins.
pub const FULL_TICK: u16 = 0x1000;

pub const DEFAULT_OSCILLATOR_HZ: u32 = 25_000_000;
pub const DEFAULT_FREQUENCY_HZ: u32 = 200;
pub const MIN_FREQUENCY_HZ: u32 = 24;
pub const MAX_FREQUENCY_HZ: u32 = 1526;
const MIN_PRESCALER: f64 = 3.0;
const MAX_PRESCALER: f64 = 255.0;

const MODE1_RESTART: u8 = 0x80;
const MODE1_EXTCLK: u8 = 0x40;
const MODE1_AI: u8 = 0x20;
const MODE1_SLEEP: u8 = 0x10;
const MODE1_SUB1: u8 = 0x08;
const MODE1_SUB2: u8 = 0x04;
const MODE1_SUB3: u8 = 0x02;
const MODE1_ALLCALL: u8 = 0x01;

const MODE2_INVRT: u8 = 0x10;
const MODE2_OCH: u8 = 0x08;
const MODE2_OUTDRV: u8 = 0x04;
const MODE2_OUTNE_HIGHZ: u8 = 0x02;
const MODE2_OUTNE_HIGH: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputDrive {
    OpenDrain,
    #[default]
    TotemPole,
}

/// Output level while OE is deasserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputWhenDisabled {
    #[default]
    Low,
    High,
    HighImpedance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pca9685Config {
    pub invert: bool,
    pub change_on_ack: bool,
    pub output_drive: OutputDrive,
    pub when_disabled: OutputWhenDisabled,
    pub external_clock: bool,
    pub oscillator_hz: u32,
    pub frequency_hz: u32,
    pub restart: bool,
    pub auto_increment: bool,
    pub sleep: bool,
    pub sub1: bool,
    pub sub2: bool,
    pub sub3: bool,
    pub all_call: bool,
}

impl Default for Pca9685Config {
    fn default() -> Self {
        Self {
            invert: false,
            change_on_ack: false,
            output_drive: OutputDrive::TotemPole,
            when_disabled: OutputWhenDisabled::Low,
            external_clock: false,
            oscillator_hz: DEFAULT_OSCILLATOR_HZ,
            frequency_hz: DEFAULT_FREQUENCY_HZ,
            restart: false,
            auto_increment: true,
            sleep: true,
            sub1: false,
            sub2: false,
            sub3: false,
            all_call: true,
        }
    }
}

impl Pca9685Config {
    pub fn mode1(&self) -> u8 {
        [
            (self.restart, MODE1_RESTART),
            (self.external_clock, MODE1_EXTCLK),
            (self.auto_increment, MODE1_AI),
            (self.sleep, MODE1_SLEEP),
            (self.sub1, MODE1_SUB1),
            (self.sub2, MODE1_SUB2),
            (self.sub3, MODE1_SUB3),
            (self.all_call, MODE1_ALLCALL),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, bit)| acc | bit)
    }

    pub fn set_mode1(&mut self, mode: u8) {
        self.restart = mode & MODE1_RESTART != 0;
        self.external_clock = mode & MODE1_EXTCLK != 0;
        self.auto_increment = mode & MODE1_AI != 0;
        self.sleep = mode & MODE1_SLEEP != 0;
        self.sub1 = mode & MODE1_SUB1 != 0;
        self.sub2 = mode & MODE1_SUB2 != 0;
        self.sub3 = mode & MODE1_SUB3 != 0;
        self.all_call = mode & MODE1_ALLCALL != 0;
    }

    pub fn mode2(&self) -> u8 {
        let mut mode = 0;
        if self.invert {
            mode |= MODE2_INVRT;
        }
        if self.change_on_ack {
            mode |= MODE2_OCH;
        }
        if self.output_drive == OutputDrive::TotemPole {
            mode |= MODE2_OUTDRV;
        }
        match self.when_disabled {
            OutputWhenDisabled::HighImpedance => mode |= MODE2_OUTNE_HIGHZ,
            OutputWhenDisabled::High => mode |= MODE2_OUTNE_HIGH,
            OutputWhenDisabled::Low => {}
        }
        mode
    }

    pub fn set_mode2(&mut self, mode: u8) {
        self.invert = mode & MODE2_INVRT != 0;
        self.change_on_ack = mode & MODE2_OCH != 0;
        self.output_drive = if mode & MODE2_OUTDRV != 0 {
            OutputDrive::TotemPole
        } else {
            OutputDrive::OpenDrain
        };
        self.when_disabled = if mode & MODE2_OUTNE_HIGHZ != 0 {
            OutputWhenDisabled::HighImpedance
        } else if mode & MODE2_OUTNE_HIGH != 0 {
            OutputWhenDisabled::High
        } else {
            OutputWhenDisabled::Low
        };
    }

    pub fn prescaler(&self) -> u8 {
        let frequency = self.frequency_hz.clamp(MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ);
        let raw = (f64::from(self.oscillator_hz) / (4096.0 * f64::from(frequency))).round() - 1.0;
        raw.clamp(MIN_PRESCALER, MAX_PRESCALER) as u8
    }

    /// Frequency the chip actually runs at with [`Pca9685Config::prescaler`].
    pub fn actual_frequency(&self) -> f64 {
        f64::from(self.oscillator_hz) / (4096.0 * (f64::from(self.prescaler()) + 1.0))
    }
}

/// Encodes a duty fraction and phase offset into (on, off) tick registers.
pub fn encode_fraction(value: f64, offset: f64) -> (u16, u16) {
    if value <= 0.0 {
        return (0, FULL_TICK);
    }
    if value >= 1.0 {
        return (FULL_TICK, 0);
    }
    let cycle = f64::from(TICKS_PER_CYCLE);
    let on = ((cycle * offset.clamp(0.0, 1.0)).round() as u16) % TICKS_PER_CYCLE;
    let width = ((cycle * value).round() as u16).min(TICKS_PER_CYCLE - 1);
    let off = (width + on) % TICKS_PER_CYCLE;
    (on, off)
}

/// Decodes (on, off) tick registers into (duty fraction, phase offset).
pub fn decode_fraction(on: u16, off: u16) -> (f64, f64) {
    let cycle = f64::from(TICKS_PER_CYCLE);
    let on_tick = on & (TICKS_PER_CYCLE - 1);
    let offset = f64::from(on_tick) / cycle;
    if off & FULL_TICK != 0 {
        return (0.0, offset);
    }
    if on & FULL_TICK != 0 {
        return (1.0, offset);
    }
    let mut off_tick = off & (TICKS_PER_CYCLE - 1);
    if on_tick > off_tick {
        off_tick += TICKS_PER_CYCLE;
    }
    (f64::from(off_tick - on_tick) / cycle, offset)
}

fn check_channel(channel: u8) -> Result<()> {
    if channel >= CHANNEL_COUNT {
        return Err(PiIoError::InvalidArgument(format!(
            "PCA9685 channel {channel} exceeds maximum channel id"
        )));
    }
    Ok(())
}

/// Register-level driver for the PCA9685 16-channel 12-bit PWM chip.
pub struct Pca9685<I> {
    address: u8,
    config: Pca9685Config,
    bus: ReentrantMutex<RefCell<RegisterDevice<I>>>,
}

impl<I: I2c> Pca9685<I> {
    pub fn new(bus: I, address: u8, mut config: Pca9685Config) -> Result<Self> {
        config.auto_increment = true;
        config.sleep = false;

        let mut device = RegisterDevice::new(bus, address);
        // the prescaler only latches while the oscillator sleeps
        let asleep = config.mode1() & !MODE1_RESTART | MODE1_SLEEP;
        device.write8(regs::MODE1, asleep)?;
        device.write8(regs::PRESCALE, config.prescaler())?;
        device.write8(regs::MODE2, config.mode2())?;
        device.write8(regs::MODE1, config.mode1())?;
        debug!(
            "pca9685 0x{address:02x}: prescaler {} for {:.1}Hz",
            config.prescaler(),
            config.actual_frequency()
        );

        Ok(Self {
            address,
            config,
            bus: ReentrantMutex::new(RefCell::new(device)),
        })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn config(&self) -> &Pca9685Config {
        &self.config
    }

    pub fn actual_frequency(&self) -> f64 {
        self.config.actual_frequency()
    }

    pub fn mode1(&self) -> Result<u8> {
        self.bus.lock().borrow_mut().read8(regs::MODE1)
    }

    pub fn mode2(&self) -> Result<u8> {
        self.bus.lock().borrow_mut().read8(regs::MODE2)
    }

    pub fn prescaler(&self) -> Result<u8> {
        self.bus.lock().borrow_mut().read8(regs::PRESCALE)
    }

    /// Writes OFF then ON ticks of one channel.
    pub fn set_value(&self, channel: u8, off: u16, on: u16) -> Result<()> {
        check_channel(channel)?;
        let guard = self.bus.lock();
        let mut bus = guard.borrow_mut();
        bus.write16(regs::led_off(channel), off)?;
        bus.write16(regs::led_on(channel), on)
    }

    pub fn on_value(&self, channel: u8) -> Result<u16> {
        check_channel(channel)?;
        self.bus.lock().borrow_mut().read16(regs::led_on(channel))
    }

    pub fn off_value(&self, channel: u8) -> Result<u16> {
        check_channel(channel)?;
        self.bus.lock().borrow_mut().read16(regs::led_off(channel))
    }

    pub fn set_fraction(&self, channel: u8, value: f64, offset: f64) -> Result<()> {
        let (on, off) = encode_fraction(value, offset);
        self.set_value(channel, off, on)
    }

    pub fn fraction(&self, channel: u8) -> Result<(f64, f64)> {
        let guard = self.bus.lock();
        let on = self.on_value(channel)?;
        let off = self.off_value(channel)?;
        drop(guard);
        Ok(decode_fraction(on, off))
    }

    pub fn set_all(&self, off: u16, on: u16) -> Result<()> {
        let guard = self.bus.lock();
        let mut bus = guard.borrow_mut();
        bus.write16(regs::ALL_LED_OFF, off)?;
        bus.write16(regs::ALL_LED_ON, on)
    }
}
