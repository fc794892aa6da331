use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use super::{
    DigitalBackend, GroupContext, InputBackend, InputSettings, InputSink, OutputBackend,
    PinSource, PwmBackend, config_address, lease_i2c_pins,
};
use crate::button::{Clock, MonotonicClock};
use crate::config::IoGroupConfig;
use crate::error::{PiIoError, Result};
use crate::events::{EventSink, IoEvent};
use crate::gpio::{DigitalLine, Direction, Edge, LineEvent};
use crate::mcp23017::{
    DEFAULT_NOISE_MARGIN, DEFAULT_NOISE_TIMEOUT_MS, HwConfig, Mcp23017, Mcp23017Settings,
    NoiseFilter, PIN_COUNT,
};
use crate::platform::Platform;
use crate::softpwm::SoftPwmConfig;

pub const INTERRUPT_USAGE: &str = "MCP23017 Interrupt";

/// Desired chip state, replayed on every bring-up.
#[derive(Debug, Clone)]
struct PortState {
    settings: Mcp23017Settings,
    int_enable: u16,
    outputs: u16,
    pwm_pins: u16,
    pwm_mask: u16,
    pwm_levels: [u8; PIN_COUNT as usize],
}

struct Runtime<P: Platform> {
    chip: Mcp23017<P::Bus>,
    int_line: Option<P::Line>,
}

struct Inner<P: Platform> {
    group: String,
    platform: Arc<P>,
    events: EventSink,
    int_pin: Option<u16>,
    pwm_config: SoftPwmConfig,
    clock: MonotonicClock,
    port: Mutex<PortState>,
    noise: Mutex<NoiseFilter>,
    runtime: RwLock<Option<Runtime<P>>>,
    sink: Mutex<Option<InputSink>>,
}

fn bit(pin: u16) -> u16 {
    1 << pin
}

impl<P: Platform> Inner<P> {
    fn active_level(&self) -> bool {
        self.port.lock().settings.hw.int_active_high
    }

    fn bring_up(self: &Arc<Self>) -> Result<Runtime<P>> {
        let port = self.port.lock().clone();
        let address = port.settings.address;

        let bus = self.platform.open_bus(address)?;
        let chip = Mcp23017::new(bus, port.settings)?;
        chip.set_pwm_config(self.pwm_config);
        chip.set_masked_value(port.outputs, !port.settings.iodir)?;
        for pin in (0..u16::from(PIN_COUNT)).filter(|&pin| port.pwm_mask & bit(pin) != 0) {
            chip.set_pwm_value(pin as u8, port.pwm_levels[usize::from(pin)])?;
            chip.set_pwm_state(pin as u8, true)?;
        }
        if port.pwm_mask != 0 {
            chip.pwm_start()?;
        }
        chip.int_config(0, 0, port.int_enable)?;
        // drop whatever was latched before we listened
        chip.int_capture()?;

        let int_line = match self.int_pin {
            Some(pin) if port.int_enable != 0 => {
                let edge = if port.settings.hw.int_active_high {
                    Edge::Rising
                } else {
                    Edge::Falling
                };
                let line = self.platform.open_line(pin, Direction::In, edge)?;
                let weak: Weak<Self> = Arc::downgrade(self);
                line.start_interrupts(Arc::new(move |event: LineEvent| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_line_event(event);
                    }
                }))?;
                Some(line)
            }
            None if port.int_enable != 0 => {
                warn!(
                    "{}: no 'intpin' configured, input changes are not reported",
                    self.group
                );
                None
            }
            _ => None,
        };

        debug!(
            "{}: mcp23017 0x{address:02x} up, iodir {:04x} inten {:04x}",
            self.group, port.settings.iodir, port.int_enable
        );
        Ok(Runtime { chip, int_line })
    }

    fn on_line_event(self: &Arc<Self>, event: LineEvent) {
        match event {
            LineEvent::Interrupt(event) if event.value == self.active_level() => {
                self.service_interrupt()
            }
            LineEvent::Interrupt(_) => {}
            LineEvent::Failed(message) => self.recover(&message),
        }
    }

    fn service_interrupt(&self) {
        let (flags, capture) = {
            let runtime = self.runtime.read();
            let Some(runtime) = runtime.as_ref() else {
                return;
            };
            let read = runtime
                .chip
                .int_flags()
                .and_then(|flags| Ok((flags, runtime.chip.int_capture()?)));
            match read {
                Ok(read) => read,
                Err(e) => {
                    warn!("{}: reading interrupt registers: {e}", self.group);
                    return;
                }
            }
        };

        let events = self.noise.lock().filter(flags, capture, self.clock.now_ms());
        let Some(sink) = self.sink.lock().clone() else {
            return;
        };
        for event in events {
            sink(event.pin, event.value);
        }
    }

    /// Tears the chip and interrupt line down and brings them up again.
    /// Failing that is fatal for the group.
    fn recover(self: &Arc<Self>, message: &str) {
        error!("{}: interrupt line failed ({message}), reinitializing", self.group);
        let old = self.runtime.write().take();
        drop(old);

        match self.bring_up() {
            Ok(runtime) => {
                *self.runtime.write() = Some(runtime);
                info!("{}: mcp23017 reinitialized", self.group);
            }
            Err(e) => {
                error!("{}: reinitialization failed: {e}", self.group);
                self.events.dispatch(IoEvent::CriticalError {
                    group: self.group.clone(),
                    message: format!("mcp23017 recovery failed: {e}"),
                });
            }
        }
    }

    fn with_chip<R>(&self, f: impl FnOnce(&Mcp23017<P::Bus>) -> Result<R>) -> Option<Result<R>> {
        self.runtime.read().as_ref().map(|runtime| f(&runtime.chip))
    }
}

/// MCP23017 expander pins for a digital IO-group.
pub struct Mcp23017Backend<P: Platform> {
    inner: Arc<Inner<P>>,
}

impl<P: Platform> Mcp23017Backend<P> {
    /// Validates the chip settings and leases the bus and interrupt pins.
    /// The chip itself is opened by [`DigitalBackend::start`].
    pub fn new(config: &IoGroupConfig, platform: Arc<P>, context: &GroupContext) -> Result<Self> {
        let group = config.name.clone();
        let address = config_address(config, 0x20..=0x27)?;
        let int_pin = config
            .intpin
            .map(|pin| {
                platform.board().verify_pin(pin).ok_or_else(|| {
                    PiIoError::IoPinInvalid(format!("{group}: intpin {pin} is not a valid gpio"))
                })
            })
            .transpose()?;

        lease_i2c_pins(&context.leases, &group)?;
        if let Some(pin) = int_pin {
            if !context.leases.request_shared(pin, &group, INTERRUPT_USAGE) {
                return Err(PiIoError::IoPinInvalid(format!(
                    "{group}: intpin gpio{pin} is held by {}",
                    context.leases.current_leaser(pin)
                )));
            }
        }

        let settings = Mcp23017Settings {
            address,
            swap_ab: config.swapab.unwrap_or(false),
            hw: HwConfig {
                int_open_drain: config.int_opendrain.unwrap_or(false),
                int_active_high: config.int_activehigh.unwrap_or(false),
                ..HwConfig::default()
            },
            ..Mcp23017Settings::default()
        };

        Ok(Self {
            inner: Arc::new(Inner {
                group,
                platform,
                events: context.events.clone(),
                int_pin,
                pwm_config: SoftPwmConfig::from_settings(config.pwm_tickdelay_us, config.pwm_ticks),
                clock: MonotonicClock::default(),
                port: Mutex::new(PortState {
                    settings,
                    int_enable: 0,
                    outputs: 0,
                    pwm_pins: 0,
                    pwm_mask: 0,
                    pwm_levels: [0; PIN_COUNT as usize],
                }),
                noise: Mutex::new(NoiseFilter::new(
                    config.noisemargin.unwrap_or(DEFAULT_NOISE_MARGIN),
                    config.noisetimeout.unwrap_or(DEFAULT_NOISE_TIMEOUT_MS),
                )),
                runtime: RwLock::new(None),
                sink: Mutex::new(None),
            }),
        })
    }

    pub fn address(&self) -> u8 {
        self.inner.port.lock().settings.address
    }

    pub fn interrupt_pin(&self) -> Option<u16> {
        self.inner.int_pin
    }

    pub fn is_running(&self) -> bool {
        self.inner.runtime.read().is_some()
    }

    fn not_running(&self) -> PiIoError {
        PiIoError::OperationFailed(format!("{}: mcp23017 is not running", self.inner.group))
    }
}

impl<P: Platform> PinSource for Mcp23017Backend<P> {
    fn pin_id(&self, pin: i64) -> Result<u16> {
        u16::try_from(pin)
            .ok()
            .filter(|&p| p < u16::from(PIN_COUNT))
            .ok_or_else(|| PiIoError::IoPinInvalid(format!("mcp23017 pin {pin} outside 0..=15")))
    }
}

impl<P: Platform> InputBackend for Mcp23017Backend<P> {
    fn input_pin(&self, pin: u16) -> Result<bool> {
        self.inner
            .with_chip(|chip| chip.pin(pin as u8))
            .unwrap_or_else(|| Err(self.not_running()))
    }
}

impl<P: Platform> OutputBackend for Mcp23017Backend<P> {
    fn set_output_pin(&self, pin: u16, value: bool) -> Result<()> {
        {
            let mut port = self.inner.port.lock();
            if value {
                port.outputs |= bit(pin);
            } else {
                port.outputs &= !bit(pin);
            }
        }
        // buffered until the chip comes up
        self.inner
            .with_chip(|chip| chip.set_pin(pin as u8, value))
            .unwrap_or(Ok(()))
    }
}

impl<P: Platform> PwmBackend for Mcp23017Backend<P> {
    fn prepare_pwm(&self, pin: u16) -> Result<()> {
        self.inner.port.lock().pwm_pins |= bit(pin);
        Ok(())
    }

    fn set_pwm_pin(&self, pin: u16, level: u8) -> Result<()> {
        // held across the chip calls so start and stop follow the port state
        let mut port = self.inner.port.lock();
        if port.pwm_pins & bit(pin) == 0 {
            return Err(PiIoError::InvalidArgument(format!(
                "{}: pin {pin} is not a pwm pin",
                self.inner.group
            )));
        }
        port.pwm_levels[usize::from(pin)] = level;
        let pwm = level != 0 && level != 255;
        if pwm {
            port.pwm_mask |= bit(pin);
        } else {
            port.pwm_mask &= !bit(pin);
            if level == 255 {
                port.outputs |= bit(pin);
            } else {
                port.outputs &= !bit(pin);
            }
        }
        let remaining = port.pwm_mask;
        let high = level == 255;

        let pin = pin as u8;
        self.inner
            .with_chip(|chip| {
                if pwm {
                    chip.set_pwm_value(pin, level)?;
                    chip.set_pwm_state(pin, true)?;
                    return chip.pwm_start();
                }
                chip.set_pwm_state(pin, false)?;
                chip.set_pin(pin, high)?;
                if remaining == 0 {
                    chip.pwm_stop()?;
                }
                Ok(())
            })
            .unwrap_or(Ok(()))
    }
}

impl<P: Platform> DigitalBackend for Mcp23017Backend<P> {
    fn configure_input(&self, pin: u16, settings: InputSettings) -> Result<()> {
        if settings.pulldown {
            warn!(
                "{}: pin {pin} pulldown requested, mcp23017 only has pullups",
                self.inner.group
            );
        }
        let mut port = self.inner.port.lock();
        let mask = bit(pin);
        port.settings.iodir |= mask;
        port.settings.ipol = if settings.invert {
            port.settings.ipol | mask
        } else {
            port.settings.ipol & !mask
        };
        port.settings.pullup = if settings.pullup {
            port.settings.pullup | mask
        } else {
            port.settings.pullup & !mask
        };
        if settings.interrupt {
            port.int_enable |= mask;
        }
        Ok(())
    }

    fn configure_output(&self, pin: u16) -> Result<()> {
        let mut port = self.inner.port.lock();
        let mask = !bit(pin);
        port.settings.iodir &= mask;
        port.settings.ipol &= mask;
        port.settings.pullup &= mask;
        port.int_enable &= mask;
        Ok(())
    }

    fn start(&self, sink: InputSink) -> Result<()> {
        *self.inner.sink.lock() = Some(sink);
        let runtime = self.inner.bring_up()?;
        *self.inner.runtime.write() = Some(runtime);
        info!(
            "{}: mcp23017 at 0x{:02x} running",
            self.inner.group,
            self.address()
        );
        Ok(())
    }
}

impl<P: Platform> Drop for Mcp23017Backend<P> {
    fn drop(&mut self) {
        let runtime = self.inner.runtime.write().take();
        if let Some(line) = runtime.as_ref().and_then(|runtime| runtime.int_line.as_ref()) {
            line.stop_interrupts();
        }
    }
}
