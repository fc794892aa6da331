use std::sync::Arc;

use log::{error, warn};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{
    DigitalBackend, InputBackend, InputSettings, InputSink, OutputBackend, PinSource, PwmBackend,
};
use crate::config::IoGroupConfig;
use crate::error::{PiIoError, Result};
use crate::gpio::{DigitalLine, Direction, Edge, LineEvent, Pull};
use crate::lease::PinLeaseRegistry;
use crate::platform::Platform;
use crate::softpwm::{PinWriter, SoftPwm, SoftPwmConfig};

pub const GPIO_PIN_USAGE: &str = "IO group pin";

struct InputLine<L> {
    line: L,
    invert: bool,
    interrupt: bool,
}

type OutputLines<L> = Arc<RwLock<FxHashMap<u16, L>>>;

/// Native GPIO lines of the board, with software PWM on outputs.
pub struct GpioBackend<P: Platform> {
    group: String,
    platform: Arc<P>,
    leases: Arc<PinLeaseRegistry>,
    inputs: RwLock<FxHashMap<u16, InputLine<P::Line>>>,
    outputs: OutputLines<P::Line>,
    pwm: SoftPwm,
}

impl<P: Platform> GpioBackend<P> {
    pub fn new(config: &IoGroupConfig, platform: Arc<P>, leases: Arc<PinLeaseRegistry>) -> Self {
        let outputs: OutputLines<P::Line> = Arc::new(RwLock::new(FxHashMap::default()));
        let lines = outputs.clone();
        let writer: PinWriter = Arc::new(move |pin: u16, value: bool| match lines.read().get(&pin) {
            Some(line) => line.set_value(value),
            None => Err(PiIoError::IoPinInvalid(format!("gpio{pin} is not an output"))),
        });
        let pwm_config = SoftPwmConfig::from_settings(config.pwm_tickdelay_us, config.pwm_ticks);

        Self {
            group: config.name.clone(),
            platform,
            leases,
            inputs: RwLock::new(FxHashMap::default()),
            outputs,
            pwm: SoftPwm::new(config.name.clone(), pwm_config, writer),
        }
    }

    pub fn soft_pwm(&self) -> &SoftPwm {
        &self.pwm
    }

    fn lease(&self, pin: u16) -> Result<()> {
        if self.leases.request_exclusive(pin, &self.group, GPIO_PIN_USAGE) {
            return Ok(());
        }
        Err(PiIoError::IoPinInvalid(format!(
            "gpio{pin} is in use by {} ({})",
            self.leases.current_leaser(pin),
            self.leases.current_usage(pin)
        )))
    }
}

impl<P: Platform> PinSource for GpioBackend<P> {
    fn pin_id(&self, pin: i64) -> Result<u16> {
        self.platform.board().verify_pin(pin).ok_or_else(|| {
            PiIoError::IoPinInvalid(format!("gpio{pin} is not usable on this board"))
        })
    }
}

impl<P: Platform> InputBackend for GpioBackend<P> {
    fn input_pin(&self, pin: u16) -> Result<bool> {
        if let Some(input) = self.inputs.read().get(&pin) {
            return Ok(input.line.value()? != input.invert);
        }
        match self.outputs.read().get(&pin) {
            Some(line) => line.value(),
            None => Err(PiIoError::IoPinInvalid(format!(
                "gpio{pin} is not configured"
            ))),
        }
    }
}

impl<P: Platform> OutputBackend for GpioBackend<P> {
    fn set_output_pin(&self, pin: u16, value: bool) -> Result<()> {
        match self.outputs.read().get(&pin) {
            Some(line) => line.set_value(value),
            None => Err(PiIoError::IoPinInvalid(format!(
                "gpio{pin} is not an output"
            ))),
        }
    }
}

impl<P: Platform> PwmBackend for GpioBackend<P> {
    fn prepare_pwm(&self, pin: u16) -> Result<()> {
        self.pwm.register(pin);
        Ok(())
    }

    fn set_pwm_pin(&self, pin: u16, level: u8) -> Result<()> {
        self.pwm.set(pin, level)
    }
}

impl<P: Platform> DigitalBackend for GpioBackend<P> {
    fn configure_input(&self, pin: u16, settings: InputSettings) -> Result<()> {
        self.lease(pin)?;
        let edge = if settings.interrupt { Edge::Both } else { Edge::None };
        let line = self.platform.open_line(pin, Direction::In, edge)?;

        let pull = match (settings.pullup, settings.pulldown) {
            (true, _) => Pull::Up,
            (false, true) => Pull::Down,
            (false, false) => Pull::Off,
        };
        if let Err(e) = line.set_pull(pull) {
            warn!("{}: gpio{pin} pull {pull:?} not applied: {e}", self.group);
        }

        self.inputs.write().insert(
            pin,
            InputLine {
                line,
                invert: settings.invert,
                interrupt: settings.interrupt,
            },
        );
        Ok(())
    }

    fn configure_output(&self, pin: u16) -> Result<()> {
        self.lease(pin)?;
        let line = self.platform.open_line(pin, Direction::Out, Edge::None)?;
        line.set_value(false)?;
        self.outputs.write().insert(pin, line);
        Ok(())
    }

    fn start(&self, sink: InputSink) -> Result<()> {
        let inputs = self.inputs.read();
        for (&pin, input) in inputs.iter().filter(|(_, input)| input.interrupt) {
            let sink = sink.clone();
            let invert = input.invert;
            let group = self.group.clone();
            input.line.start_interrupts(Arc::new(move |event: LineEvent| match event {
                LineEvent::Interrupt(event) => sink(pin, event.value != invert),
                LineEvent::Failed(message) => {
                    error!("{group}: gpio{pin} interrupts stopped: {message}");
                }
            }))?;
        }
        Ok(())
    }
}

impl<P: Platform> Drop for GpioBackend<P> {
    fn drop(&mut self) {
        let _ = self.pwm.stop();
        for input in self.inputs.read().values() {
            input.line.stop_interrupts();
        }
    }
}
