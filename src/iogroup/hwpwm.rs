use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::ReentrantMutex;

use super::{HandleRegistry, PinSource, PwmGroup};
use crate::config::{IoConfig, IoGroupConfig, IoKind};
use crate::error::{PiIoError, Result};
use crate::events::{EventSink, IoEvent};
use crate::pwm_pin::{PwmPin, PwmPinSettings};

/// Hardware side of a PWM IO-group: channels taking a duty fraction and a
/// phase offset.
pub trait PwmChannelBackend: PinSource + Send + Sync + 'static {
    /// Frequency the hardware actually runs at.
    fn frequency(&self) -> f64;

    fn prepare_channel(&self, _pin: u16) -> Result<()> {
        Ok(())
    }

    fn write_channel(&self, pin: u16, fraction: f64, offset: f64) -> Result<()>;

    /// (duty fraction, phase offset) currently programmed.
    fn read_channel(&self, pin: u16) -> Result<(f64, f64)>;
}

#[derive(Default)]
struct PwmState {
    handles: HandleRegistry,
    pins: BTreeMap<String, PwmPin>,
}

/// Filtered PWM handles on a hardware PWM backend.
pub struct HwPwmIoGroup<B: PwmChannelBackend> {
    name: String,
    backend: B,
    events: EventSink,
    state: ReentrantMutex<RefCell<PwmState>>,
}

impl<B: PwmChannelBackend> HwPwmIoGroup<B> {
    /// Registers every `pwmpin` entry and writes all channels once.
    pub fn new(config: &IoGroupConfig, backend: B, events: EventSink) -> Result<Arc<Self>> {
        let group = Self {
            name: config.name.clone(),
            backend,
            events,
            state: ReentrantMutex::new(RefCell::new(PwmState::default())),
        };

        for io in &config.io {
            if let Err(e) = group.configure_entry(io) {
                warn!("{}: skipping '{}': {e}", group.name, io.name);
            }
        }

        for handle in group.pwms() {
            group.write(&handle)?;
        }
        info!(
            "{}: {} pwm channels at {:.1}Hz",
            group.name,
            group.pwms().len(),
            group.pwm_frequency()
        );
        Ok(Arc::new(group))
    }

    fn configure_entry(&self, io: &IoConfig) -> Result<()> {
        let kind = io.io_kind()?;
        if kind != IoKind::PwmPin {
            return Err(PiIoError::FeatureNotImplemented(format!(
                "{kind:?} on a pwm-only group"
            )));
        }
        let pin = self.backend.resolve(io.single_pin()?)?;

        let guard = self.state.lock();
        if !guard.borrow().handles.can_register(&io.name, &[pin]) {
            return Err(PiIoError::InvalidArgument(format!(
                "handle '{}' or channel {pin} is already registered",
                io.name
            )));
        }
        self.backend.prepare_channel(pin)?;

        let mut state = guard.borrow_mut();
        state.handles.register(&io.name, pin);
        state.pins.insert(
            io.name.clone(),
            PwmPin::new(io.name.clone(), pin, PwmPinSettings::from_config(io)),
        );
        debug!("{}: pwm '{}' on channel {pin}", self.name, io.name);
        Ok(())
    }

    fn with_pin<R>(&self, handle: &str, f: impl FnOnce(&mut PwmPin) -> R) -> Result<R> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let pin = state.pins.get_mut(handle).ok_or_else(|| {
            PiIoError::InvalidArgument(format!("{}: no such pwm '{handle}'", self.name))
        })?;
        Ok(f(pin))
    }

    fn write(&self, handle: &str) -> Result<()> {
        let period_ms = self.pwm_period_ms();
        let (pin, fraction, offset) =
            self.with_pin(handle, |pin| (pin.pin(), pin.filtered_value(period_ms), pin.offset()))?;
        self.backend.write_channel(pin, fraction, offset)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn pwm_frequency(&self) -> f64 {
        self.backend.frequency()
    }

    pub fn pwm_period_ms(&self) -> f64 {
        1000.0 / self.pwm_frequency()
    }

    pub fn pin(&self, handle: &str) -> Result<PwmPin> {
        self.with_pin(handle, |pin| pin.clone())
    }

    /// Last value set or synced, without touching the hardware.
    pub fn value(&self, handle: &str) -> Result<f64> {
        self.with_pin(handle, |pin| pin.value())
    }

    pub fn min(&self, handle: &str) -> Result<f64> {
        self.with_pin(handle, |pin| pin.min())
    }

    pub fn max(&self, handle: &str) -> Result<f64> {
        self.with_pin(handle, |pin| pin.max())
    }

    /// Clamps `value` into the handle's range and programs the channel.
    pub fn set_value(&self, handle: &str, value: f64) -> Result<()> {
        let guard = self.state.lock();
        let (previous, current) = self.with_pin(handle, |pin| {
            let previous = pin.value();
            pin.set_value(value);
            (previous, pin.value())
        })?;
        if let Err(e) = self.write(handle) {
            self.with_pin(handle, |pin| pin.set_value(previous))?;
            return Err(e);
        }
        drop(guard);

        if previous != current {
            self.events.dispatch(IoEvent::PwmChanged {
                group: self.name.clone(),
                handle: handle.to_string(),
                value: current,
            });
        }
        Ok(())
    }

    /// Re-reads the channel and maps what the hardware runs back into the
    /// handle's value range.
    pub fn sync_from_hardware(&self, handle: &str) -> Result<f64> {
        let guard = self.state.lock();
        let channel = self.with_pin(handle, |pin| pin.pin())?;
        let (fraction, offset) = self.backend.read_channel(channel)?;
        let period_ms = self.pwm_period_ms();
        let value = self.with_pin(handle, |pin| {
            pin.set_from_filtered_value(fraction, offset, period_ms);
            pin.value()
        })?;
        drop(guard);
        Ok(value)
    }
}

impl<B: PwmChannelBackend> PwmGroup for HwPwmIoGroup<B> {
    fn pwms(&self) -> Vec<String> {
        self.state.lock().borrow().pins.keys().cloned().collect()
    }

    fn pwm_value(&self, handle: &str) -> Result<f64> {
        self.sync_from_hardware(handle)
    }

    fn set_pwm_value(&self, handle: &str, value: f64) -> Result<()> {
        self.set_value(handle, value)
    }
}
