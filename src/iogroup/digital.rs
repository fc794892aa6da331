use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::ReentrantMutex;
use rustc_hash::FxHashMap;

use super::{
    InputBackend, InputGroup, OutputBackend, OutputGroup, PinSource, PwmBackend, PwmGroup,
};
use crate::button::{
    ButtonHandlers, ButtonTimer, DEFAULT_LONG_PRESS_MS, DEFAULT_SHORT_PRESS_MS,
};
use crate::config::{IoConfig, IoGroupConfig, IoKind};
use crate::error::{PiIoError, Result};
use crate::events::{EventSink, IoEvent};
use crate::softpwm::led_gamma;

/// Receives the logical level of a backend pin after an edge.
pub type InputSink = Arc<dyn Fn(u16, bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSettings {
    pub invert: bool,
    pub pullup: bool,
    pub pulldown: bool,
    pub interrupt: bool,
}

impl InputSettings {
    pub fn button(io: &IoConfig) -> Self {
        Self {
            invert: io.invert.unwrap_or(true),
            pullup: io.pullup.unwrap_or(true),
            pulldown: io.pulldown.unwrap_or(false),
            interrupt: io.int_enabled.unwrap_or(true),
        }
    }

    pub fn input(io: &IoConfig) -> Self {
        Self {
            invert: io.invert.unwrap_or(false),
            pullup: io.pullup.unwrap_or(false),
            pulldown: io.pulldown.unwrap_or(false),
            interrupt: io.int_enabled.unwrap_or(true),
        }
    }
}

/// Hardware side of a digital IO-group.
///
/// Pins are configured one by one while the group reads its `io` list, then
/// [`DigitalBackend::start`] brings the hardware up and starts delivering
/// edges to the sink.
pub trait DigitalBackend:
    PinSource + InputBackend + OutputBackend + PwmBackend + Send + Sync + 'static
{
    fn configure_input(&self, pin: u16, settings: InputSettings) -> Result<()>;
    fn configure_output(&self, pin: u16) -> Result<()>;
    fn start(&self, sink: InputSink) -> Result<()>;
}

/// Handle to pin-id mapping with its reverse map.
///
/// Multibit handles keep their pins least significant bit first.
#[derive(Debug, Default, Clone)]
pub struct HandleRegistry {
    handles: BTreeMap<String, Vec<u16>>,
    pins: FxHashMap<u16, String>,
}

impl HandleRegistry {
    /// False if the handle, or any of the pins, is already taken.
    pub fn can_register(&self, handle: &str, pins: &[u16]) -> bool {
        if pins.is_empty() || self.handles.contains_key(handle) {
            return false;
        }
        let unique: BTreeSet<u16> = pins.iter().copied().collect();
        unique.len() == pins.len() && pins.iter().all(|pin| !self.pins.contains_key(pin))
    }

    pub fn register(&mut self, handle: &str, pin: u16) -> bool {
        self.register_multibit(handle, &[pin])
    }

    pub fn register_multibit(&mut self, handle: &str, pins: &[u16]) -> bool {
        if !self.can_register(handle, pins) {
            return false;
        }
        for &pin in pins {
            self.pins.insert(pin, handle.to_string());
        }
        self.handles.insert(handle.to_string(), pins.to_vec());
        true
    }

    pub fn pins(&self, handle: &str) -> Option<&[u16]> {
        self.handles.get(handle).map(Vec::as_slice)
    }

    pub fn pin(&self, handle: &str) -> Option<u16> {
        self.pins(handle).and_then(|pins| pins.first().copied())
    }

    pub fn handle_of(&self, pin: u16) -> Option<&str> {
        self.pins.get(&pin).map(String::as_str)
    }

    pub fn handles(&self) -> impl Iterator<Item = &str> {
        self.handles.keys().map(String::as_str)
    }
}

#[derive(Default)]
struct DigitalState {
    handles: HandleRegistry,
    buttons: BTreeSet<String>,
    inputs: BTreeSet<String>,
    outputs: BTreeSet<String>,
    multibit_inputs: BTreeSet<String>,
    multibit_outputs: BTreeSet<String>,
    pwms: BTreeSet<String>,
    output_values: FxHashMap<String, bool>,
    multibit_input_values: FxHashMap<String, u32>,
    multibit_output_values: FxHashMap<String, u32>,
    pwm_levels: FxHashMap<String, u8>,
}

enum Route {
    Button,
    Input(String),
    Multibit(String),
}

fn multibit_mask(width: usize) -> u32 {
    if width >= 32 { u32::MAX } else { (1u32 << width) - 1 }
}

/// Handles over single-bit digital pins of one backend: buttons, inputs,
/// outputs, multibit words and 8-bit PWM levels.
pub struct DigitalIoGroup<B: DigitalBackend> {
    name: String,
    backend: B,
    events: EventSink,
    timer: ButtonTimer,
    state: ReentrantMutex<RefCell<DigitalState>>,
}

impl<B: DigitalBackend> DigitalIoGroup<B> {
    /// Registers every `io` entry and starts the backend. Bad entries are
    /// logged and skipped; a failing backend start fails the group.
    pub fn new(config: &IoGroupConfig, backend: B, events: EventSink) -> Result<Arc<Self>> {
        let short_ms = config
            .button_shortpress_time
            .unwrap_or(DEFAULT_SHORT_PRESS_MS);
        let long_ms = config
            .button_longpress_time
            .unwrap_or(DEFAULT_LONG_PRESS_MS);

        let group = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            name: config.name.clone(),
            backend,
            events,
            timer: ButtonTimer::new(short_ms, long_ms, Self::button_handlers(weak)),
            state: ReentrantMutex::new(RefCell::new(DigitalState::default())),
        });

        for io in &config.io {
            if let Err(e) = group.configure_entry(io) {
                warn!("{}: skipping '{}': {e}", group.name, io.name);
            }
        }

        let weak = Arc::downgrade(&group);
        let sink: InputSink = Arc::new(move |pin: u16, value: bool| {
            if let Some(group) = weak.upgrade() {
                group.on_input(pin, value);
            }
        });
        group.backend.start(sink)?;

        if !group.buttons().is_empty() {
            group.timer.start()?;
        }
        info!(
            "{}: {} buttons, {} inputs, {} outputs, {} pwm",
            group.name,
            group.buttons().len(),
            group.inputs().len() + group.multibit_inputs().len(),
            group.outputs().len() + group.multibit_outputs().len(),
            group.pwms().len()
        );
        Ok(group)
    }

    fn button_handlers(weak: &Weak<Self>) -> ButtonHandlers {
        let short = weak.clone();
        let long = weak.clone();
        let validate = weak.clone();
        ButtonHandlers {
            short_press: Some(Box::new(move |pin| {
                if let Some(group) = short.upgrade() {
                    group.on_button(pin, false);
                }
            })),
            long_press: Some(Box::new(move |pin| {
                if let Some(group) = long.upgrade() {
                    group.on_button(pin, true);
                }
            })),
            // the button must still be down when the hold fires
            validate_long_press: Some(Box::new(move |pin| {
                validate
                    .upgrade()
                    .is_some_and(|group| group.backend.input_pin(pin).unwrap_or(false))
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn button_timer(&self) -> &ButtonTimer {
        &self.timer
    }

    pub fn handle_pins(&self, handle: &str) -> Option<Vec<u16>> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.handles.pins(handle).map(<[u16]>::to_vec)
    }

    pub fn handle_of(&self, pin: u16) -> Option<String> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.handles.handle_of(pin).map(str::to_string)
    }

    fn configure_entry(&self, io: &IoConfig) -> Result<()> {
        let kind = io.io_kind()?;
        let pins: Vec<u16> = match kind {
            IoKind::MultibitIn | IoKind::MultibitOut => io
                .pin_list()?
                .iter()
                .rev()
                .map(|pin| self.backend.resolve(pin))
                .collect::<Result<_>>()?,
            _ => vec![self.backend.resolve(io.single_pin()?)?],
        };

        let guard = self.state.lock();
        if !guard.borrow().handles.can_register(&io.name, &pins) {
            return Err(PiIoError::InvalidArgument(format!(
                "handle '{}' or one of its pins {pins:?} is already registered",
                io.name
            )));
        }

        match kind {
            IoKind::Button => self.backend.configure_input(pins[0], InputSettings::button(io))?,
            IoKind::InputPin | IoKind::MultibitIn => {
                let settings = InputSettings::input(io);
                for &pin in &pins {
                    self.backend.configure_input(pin, settings)?;
                }
            }
            IoKind::OutputPin | IoKind::MultibitOut => {
                for &pin in &pins {
                    self.backend.configure_output(pin)?;
                }
            }
            IoKind::PwmPin => {
                self.backend.configure_output(pins[0])?;
                self.backend.prepare_pwm(pins[0])?;
            }
        }

        let mut state = guard.borrow_mut();
        state.handles.register_multibit(&io.name, &pins);
        let handle = io.name.clone();
        match kind {
            IoKind::Button => {
                state.buttons.insert(handle);
            }
            IoKind::InputPin => {
                state.inputs.insert(handle);
            }
            IoKind::OutputPin => {
                state.output_values.insert(handle.clone(), false);
                state.outputs.insert(handle);
            }
            IoKind::PwmPin => {
                state.pwm_levels.insert(handle.clone(), 0);
                state.pwms.insert(handle);
            }
            IoKind::MultibitIn => {
                state.multibit_input_values.insert(handle.clone(), 0);
                state.multibit_inputs.insert(handle);
            }
            IoKind::MultibitOut => {
                state.multibit_output_values.insert(handle.clone(), 0);
                state.multibit_outputs.insert(handle);
            }
        }
        debug!("{}: {kind:?} '{}' on pins {pins:?}", self.name, io.name);
        Ok(())
    }

    fn lookup(
        &self,
        handle: &str,
        set: impl Fn(&DigitalState) -> &BTreeSet<String>,
    ) -> Result<Vec<u16>> {
        let guard = self.state.lock();
        let state = guard.borrow();
        if !set(&state).contains(handle) {
            return Err(PiIoError::InvalidArgument(format!(
                "{}: no such handle '{handle}'",
                self.name
            )));
        }
        state
            .handles
            .pins(handle)
            .map(<[u16]>::to_vec)
            .ok_or_else(|| {
                PiIoError::InvalidArgument(format!("{}: '{handle}' has no pins", self.name))
            })
    }

    fn on_button(&self, pin: u16, held: bool) {
        let Some(handle) = self.handle_of(pin) else {
            return;
        };
        let group = self.name.clone();
        self.events.dispatch(if held {
            IoEvent::ButtonHeld { group, handle }
        } else {
            IoEvent::ButtonPressed { group, handle }
        });
    }

    fn on_input(&self, pin: u16, value: bool) {
        let route = {
            let guard = self.state.lock();
            let state = guard.borrow();
            let Some(handle) = state.handles.handle_of(pin) else {
                debug!("{}: edge on unregistered pin {pin}", self.name);
                return;
            };
            if state.buttons.contains(handle) {
                Route::Button
            } else if state.inputs.contains(handle) {
                Route::Input(handle.to_string())
            } else if state.multibit_inputs.contains(handle) {
                Route::Multibit(handle.to_string())
            } else {
                return;
            }
        };

        match route {
            Route::Button if value => self.timer.register_press(pin),
            Route::Button => self.timer.register_release(pin),
            Route::Input(handle) => self.events.dispatch(IoEvent::InputChanged {
                group: self.name.clone(),
                handle,
                value,
            }),
            Route::Multibit(handle) => self.refresh_multibit_input(&handle, pin, value),
        }
    }

    fn refresh_multibit_input(&self, handle: &str, pin: u16, value: bool) {
        let guard = self.state.lock();
        let Some(pins) = guard.borrow().handles.pins(handle).map(<[u16]>::to_vec) else {
            return;
        };
        let mut composed = 0u32;
        for (bit, &member) in pins.iter().enumerate() {
            let level = if member == pin {
                value
            } else {
                match self.backend.input_pin(member) {
                    Ok(level) => level,
                    Err(e) => {
                        warn!("{}: reading '{handle}' bit {bit}: {e}", self.name);
                        return;
                    }
                }
            };
            if level {
                composed |= 1 << bit;
            }
        }
        let previous = guard
            .borrow_mut()
            .multibit_input_values
            .insert(handle.to_string(), composed);
        if previous != Some(composed) {
            self.events.dispatch(IoEvent::MultibitInputChanged {
                group: self.name.clone(),
                handle: handle.to_string(),
                value: composed,
            });
        }
    }

    /// Writes an 8-bit level; 0 and 255 drive the pin as a plain output.
    pub fn set_pwm(&self, handle: &str, level: u8) -> Result<()> {
        let pins = self.lookup(handle, |s| &s.pwms)?;
        let guard = self.state.lock();
        self.backend.set_pwm_pin(pins[0], level)?;
        let previous = guard
            .borrow_mut()
            .pwm_levels
            .insert(handle.to_string(), level);
        if previous != Some(level) {
            self.events.dispatch(IoEvent::PwmChanged {
                group: self.name.clone(),
                handle: handle.to_string(),
                value: f64::from(level),
            });
        }
        Ok(())
    }

    /// Like [`DigitalIoGroup::set_pwm`] with perceived-brightness correction.
    pub fn set_led_pwm(&self, handle: &str, brightness: u8) -> Result<()> {
        self.set_pwm(handle, led_gamma(brightness))
    }

    pub fn pwm(&self, handle: &str) -> Result<u8> {
        self.lookup(handle, |s| &s.pwms)?;
        let guard = self.state.lock();
        let level = guard.borrow().pwm_levels.get(handle).copied().unwrap_or(0);
        Ok(level)
    }
}

impl<B: DigitalBackend> InputGroup for DigitalIoGroup<B> {
    fn buttons(&self) -> Vec<String> {
        self.state.lock().borrow().buttons.iter().cloned().collect()
    }

    fn inputs(&self) -> Vec<String> {
        self.state.lock().borrow().inputs.iter().cloned().collect()
    }

    fn multibit_inputs(&self) -> Vec<String> {
        self.state.lock().borrow().multibit_inputs.iter().cloned().collect()
    }

    fn input(&self, handle: &str) -> Result<bool> {
        let pins = {
            let guard = self.state.lock();
            let state = guard.borrow();
            if !state.buttons.contains(handle) && !state.inputs.contains(handle) {
                return Err(PiIoError::InvalidArgument(format!(
                    "{}: no such input '{handle}'",
                    self.name
                )));
            }
            state.handles.pins(handle).map(<[u16]>::to_vec).unwrap_or_default()
        };
        let pin = pins.first().copied().ok_or_else(|| {
            PiIoError::InvalidArgument(format!("{}: '{handle}' has no pins", self.name))
        })?;
        self.backend.input_pin(pin)
    }

    fn multibit_input(&self, handle: &str) -> Result<u32> {
        let pins = self.lookup(handle, |s| &s.multibit_inputs)?;
        let mut value = 0u32;
        for (bit, &pin) in pins.iter().enumerate() {
            if self.backend.input_pin(pin)? {
                value |= 1 << bit;
            }
        }
        Ok(value)
    }
}

impl<B: DigitalBackend> OutputGroup for DigitalIoGroup<B> {
    fn outputs(&self) -> Vec<String> {
        self.state.lock().borrow().outputs.iter().cloned().collect()
    }

    fn multibit_outputs(&self) -> Vec<String> {
        self.state.lock().borrow().multibit_outputs.iter().cloned().collect()
    }

    fn output(&self, handle: &str) -> Result<bool> {
        self.lookup(handle, |s| &s.outputs)?;
        let guard = self.state.lock();
        let value = guard.borrow().output_values.get(handle).copied().unwrap_or(false);
        Ok(value)
    }

    fn set_output(&self, handle: &str, value: bool) -> Result<()> {
        let pins = self.lookup(handle, |s| &s.outputs)?;
        let guard = self.state.lock();
        if guard.borrow().output_values.get(handle) == Some(&value) {
            return Ok(());
        }
        self.backend.set_output_pin(pins[0], value)?;
        guard
            .borrow_mut()
            .output_values
            .insert(handle.to_string(), value);
        self.events.dispatch(IoEvent::OutputChanged {
            group: self.name.clone(),
            handle: handle.to_string(),
            value,
        });
        Ok(())
    }

    fn multibit_output(&self, handle: &str) -> Result<u32> {
        self.lookup(handle, |s| &s.multibit_outputs)?;
        let guard = self.state.lock();
        let value = guard
            .borrow()
            .multibit_output_values
            .get(handle)
            .copied()
            .unwrap_or(0);
        Ok(value)
    }

    fn set_multibit_output(&self, handle: &str, value: u32) -> Result<()> {
        let pins = self.lookup(handle, |s| &s.multibit_outputs)?;
        let value = value & multibit_mask(pins.len());
        let guard = self.state.lock();
        for (bit, &pin) in pins.iter().enumerate() {
            self.backend.set_output_pin(pin, value & (1 << bit) != 0)?;
        }
        let previous = guard
            .borrow_mut()
            .multibit_output_values
            .insert(handle.to_string(), value);
        if previous != Some(value) {
            self.events.dispatch(IoEvent::MultibitOutputChanged {
                group: self.name.clone(),
                handle: handle.to_string(),
                value,
            });
        }
        Ok(())
    }
}

impl<B: DigitalBackend> PwmGroup for DigitalIoGroup<B> {
    fn pwms(&self) -> Vec<String> {
        self.state.lock().borrow().pwms.iter().cloned().collect()
    }

    fn pwm_value(&self, handle: &str) -> Result<f64> {
        self.pwm(handle).map(f64::from)
    }

    fn set_pwm_value(&self, handle: &str, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(PiIoError::InvalidArgument(format!(
                "{}: pwm level {value} for '{handle}'",
                self.name
            )));
        }
        self.set_pwm(handle, value.round().clamp(0.0, 255.0) as u8)
    }
}

impl<B: DigitalBackend> Drop for DigitalIoGroup<B> {
    fn drop(&mut self) {
        self.timer.stop();
    }
}
