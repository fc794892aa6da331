use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{PiIoError, Result};
use crate::worker::{Worker, make_realtime};

pub const DEFAULT_TICK_DELAY_US: u64 = 800;
pub const DEFAULT_PERIOD_TICKS: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftPwmConfig {
    pub tick_delay_us: u64,
    pub period_ticks: u8,
}

impl Default for SoftPwmConfig {
    fn default() -> Self {
        Self {
            tick_delay_us: DEFAULT_TICK_DELAY_US,
            period_ticks: DEFAULT_PERIOD_TICKS,
        }
    }
}

impl SoftPwmConfig {
    /// Builds a config from optional settings; ticks are clamped to 1..=255.
    pub fn from_settings(tick_delay_us: Option<u64>, ticks: Option<u32>) -> Self {
        let defaults = Self::default();
        Self {
            tick_delay_us: tick_delay_us.unwrap_or(defaults.tick_delay_us),
            period_ticks: ticks
                .map(|t| t.clamp(1, 255) as u8)
                .unwrap_or(defaults.period_ticks),
        }
    }

    pub fn tick_delay(&self) -> Duration {
        Duration::from_micros(self.tick_delay_us)
    }

    /// Number of ticks per period a level of 0..=255 stays on.
    pub fn duty_ticks(&self, level: u8) -> u8 {
        let step = 256 / u16::from(self.period_ticks.max(1));
        (u16::from(level) / step) as u8
    }
}

/// Perceived-brightness correction for 8-bit LED levels.
pub const LED_GAMMA: [u8; 256] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 2,
    3, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 6, 6, 6,
    6, 7, 7, 7, 8, 8, 8, 9, 9, 9, 10, 10, 11, 11, 11, 12,
    12, 13, 13, 14, 14, 14, 15, 15, 16, 16, 17, 17, 18, 18, 19, 19,
    20, 21, 21, 22, 22, 23, 23, 24, 25, 25, 26, 27, 27, 28, 28, 29,
    30, 31, 31, 32, 33, 33, 34, 35, 36, 36, 37, 38, 39, 39, 40, 41,
    42, 43, 44, 44, 45, 46, 47, 48, 49, 50, 51, 51, 52, 53, 54, 55,
    56, 57, 58, 59, 60, 61, 62, 63, 64, 65, 66, 67, 68, 70, 71, 72,
    73, 74, 75, 76, 77, 78, 80, 81, 82, 83, 84, 86, 87, 88, 89, 91,
    92, 93, 94, 96, 97, 98, 100, 101, 102, 104, 105, 106, 108, 109, 110, 112,
    113, 115, 116, 118, 119, 120, 122, 123, 125, 126, 128, 129, 131, 132, 134, 136,
    137, 139, 140, 142, 143, 145, 147, 148, 150, 152, 153, 155, 157, 158, 160, 162,
    164, 165, 167, 169, 171, 172, 174, 176, 178, 179, 181, 183, 185, 187, 189, 191,
    192, 194, 196, 198, 200, 202, 204, 206, 208, 210, 212, 214, 216, 218, 220, 222,
    224, 226, 228, 230, 232, 234, 237, 239, 241, 243, 245, 247, 249, 252, 254, 255,
];

pub fn led_gamma(level: u8) -> u8 {
    LED_GAMMA[usize::from(level)]
}

pub type PinWriter = Arc<dyn Fn(u16, bool) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct PwmState {
    config: SoftPwmConfig,
    registered: BTreeSet<u16>,
    levels: FxHashMap<u16, u8>,
    // active pins and their on-ticks
    active: BTreeMap<u16, u8>,
}

struct Shared {
    name: String,
    state: Mutex<PwmState>,
    writer: PinWriter,
}

/// Tick-based software PWM over any digital output.
///
/// Levels 0 and 255 are driven as plain digital levels. The worker runs
/// only while at least one pin sits in between.
pub struct SoftPwm {
    shared: Arc<Shared>,
    worker: Mutex<Worker>,
}

impl SoftPwm {
    pub fn new(name: impl Into<String>, config: SoftPwmConfig, writer: PinWriter) -> Self {
        let name = name.into();
        Self {
            worker: Mutex::new(Worker::new(format!("{name}-pwm"))),
            shared: Arc::new(Shared {
                name,
                state: Mutex::new(PwmState {
                    config,
                    ..PwmState::default()
                }),
                writer,
            }),
        }
    }

    pub fn register(&self, pin: u16) {
        self.shared.state.lock().registered.insert(pin);
    }

    pub fn is_registered(&self, pin: u16) -> bool {
        self.shared.state.lock().registered.contains(&pin)
    }

    pub fn config(&self) -> SoftPwmConfig {
        self.shared.state.lock().config
    }

    pub fn set_config(&self, config: SoftPwmConfig) {
        debug!(
            "{}: software pwm at {} ticks, {}us per tick",
            self.shared.name, config.period_ticks, config.tick_delay_us
        );
        let mut state = self.shared.state.lock();
        state.config = config;
        let PwmState { levels, active, .. } = &mut *state;
        for (pin, ticks) in active.iter_mut() {
            if let Some(level) = levels.get(pin) {
                *ticks = config.duty_ticks(*level);
            }
        }
    }

    pub fn level(&self, pin: u16) -> Option<u8> {
        self.shared.state.lock().levels.get(&pin).copied()
    }

    pub fn is_active(&self, pin: u16) -> bool {
        self.shared.state.lock().active.contains_key(&pin)
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_running()
    }

    /// Sets a pin's level. The worker lock is held throughout so concurrent
    /// callers cannot start and stop the worker out of order.
    pub fn set(&self, pin: u16, level: u8) -> Result<()> {
        let mut worker = self.worker.lock();
        let (solid, idle) = {
            let mut state = self.shared.state.lock();
            if !state.registered.contains(&pin) {
                return Err(PiIoError::InvalidArgument(format!(
                    "{}: pin {pin} is not a pwm pin",
                    self.shared.name
                )));
            }
            state.levels.insert(pin, level);
            let solid = if level == 0 || level == 255 {
                state.active.remove(&pin);
                Some(level == 255)
            } else {
                let ticks = state.config.duty_ticks(level);
                state.active.insert(pin, ticks);
                None
            };
            (solid, state.active.is_empty())
        };

        if let Some(value) = solid {
            (self.shared.writer)(pin, value)?;
        }
        if idle {
            self.stop_locked(&mut worker);
            Ok(())
        } else {
            self.start_locked(&mut worker)
        }
    }

    fn start_locked(&self, worker: &mut Worker) -> Result<()> {
        if worker.is_running() {
            return Ok(());
        }
        debug!("{}: starting software pwm", self.shared.name);
        let shared = self.shared.clone();
        worker.start(
            move |token| {
                make_realtime();
                let mut counter: u8 = 0;
                while token.is_running() {
                    let delay = {
                        let state = shared.state.lock();
                        for (&pin, &ticks) in &state.active {
                            if let Err(e) = (shared.writer)(pin, counter < ticks) {
                                trace!("{}: pwm write to pin {pin}: {e}", shared.name);
                            }
                        }
                        counter = counter.wrapping_add(1);
                        if counter >= state.config.period_ticks {
                            counter = 0;
                        }
                        state.config.tick_delay()
                    };
                    thread::sleep(delay);
                }
                Ok(())
            },
            |_| {},
        )
    }

    /// Stops the worker and drives every active pin low.
    pub fn stop(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        self.stop_locked(&mut worker);
        Ok(())
    }

    fn stop_locked(&self, worker: &mut Worker) {
        if !worker.is_running() {
            return;
        }
        debug!("{}: stopping software pwm", self.shared.name);
        worker.stop();
        let active: Vec<u16> = self.shared.state.lock().active.keys().copied().collect();
        for pin in active {
            if let Err(e) = (self.shared.writer)(pin, false) {
                warn!("{}: unable to clear pwm pin {pin}: {e}", self.shared.name);
            }
        }
    }
}

impl Drop for SoftPwm {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
