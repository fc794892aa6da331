use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Mutex, ReentrantMutex};

use crate::error::Result;
use crate::worker::Worker;

pub const DEFAULT_SHORT_PRESS_MS: u64 = 25;
pub const DEFAULT_LONG_PRESS_MS: u64 = 6000;
pub const SCAN_PERIOD: Duration = Duration::from_millis(50);

/// Millisecond monotonic time source.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::Release);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

pub type KeyCallback = Box<dyn Fn(u16) + Send + Sync>;
pub type KeyValidator = Box<dyn Fn(u16) -> bool + Send + Sync>;

#[derive(Default)]
pub struct ButtonHandlers {
    pub short_press: Option<KeyCallback>,
    pub long_press: Option<KeyCallback>,
    /// Consulted before a long press fires; a missing validator accepts.
    pub validate_long_press: Option<KeyValidator>,
}

#[derive(Default)]
struct TimerState {
    pressed: BTreeMap<u16, u64>,
    in_callback: bool,
}

struct TimerCore {
    short_press_ms: u64,
    long_press_ms: u64,
    clock: Arc<dyn Clock>,
    state: ReentrantMutex<RefCell<TimerState>>,
    handlers: ButtonHandlers,
}

impl TimerCore {
    /// Runs `f` with the re-entrancy flag raised. Caller holds the lock.
    fn guarded<R>(&self, state: &RefCell<TimerState>, f: impl FnOnce() -> R) -> R {
        state.borrow_mut().in_callback = true;
        let result = f();
        state.borrow_mut().in_callback = false;
        result
    }

    fn press(&self, key: u16) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.in_callback {
            debug!("button timer busy, dropping press of {key}");
            return;
        }
        let now = self.clock.now_ms();
        state.pressed.entry(key).or_insert(now);
    }

    fn release(&self, key: u16) {
        let guard = self.state.lock();
        {
            let mut state = guard.borrow_mut();
            if state.in_callback {
                debug!("button timer busy, dropping release of {key}");
                return;
            }
            let Some(pressed_at) = state.pressed.remove(&key) else {
                return;
            };
            if self.clock.now_ms().saturating_sub(pressed_at) < self.short_press_ms {
                return;
            }
        }
        if let Some(short_press) = &self.handlers.short_press {
            self.guarded(&guard, || short_press(key));
        }
    }

    fn cancel(&self, key: u16) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.in_callback {
            debug!("button timer busy, dropping cancel of {key}");
            return;
        }
        state.pressed.remove(&key);
    }

    fn scan(&self) {
        let guard = self.state.lock();
        let expired: Vec<u16> = {
            let mut state = guard.borrow_mut();
            if state.in_callback {
                return;
            }
            let now = self.clock.now_ms();
            let expired: Vec<u16> = state
                .pressed
                .iter()
                .filter(|&(_, &at)| now.saturating_sub(at) >= self.long_press_ms)
                .map(|(&key, _)| key)
                .collect();
            for key in &expired {
                state.pressed.remove(key);
            }
            expired
        };

        for key in expired {
            let valid = match &self.handlers.validate_long_press {
                Some(validate) => self.guarded(&guard, || validate(key)),
                None => true,
            };
            if !valid {
                debug!("long press of {key} rejected by validator");
                continue;
            }
            if let Some(long_press) = &self.handlers.long_press {
                self.guarded(&guard, || long_press(key));
            }
        }
    }
}

/// Classifies press/release timing per keycode into short and long presses.
///
/// Calls made from inside a press callback are dropped.
pub struct ButtonTimer {
    core: Arc<TimerCore>,
    worker: Mutex<Worker>,
}

impl ButtonTimer {
    pub fn new(short_press_ms: u64, long_press_ms: u64, handlers: ButtonHandlers) -> Self {
        Self::with_clock(
            short_press_ms,
            long_press_ms,
            Arc::new(MonotonicClock::default()),
            handlers,
        )
    }

    pub fn with_clock(
        short_press_ms: u64,
        long_press_ms: u64,
        clock: Arc<dyn Clock>,
        handlers: ButtonHandlers,
    ) -> Self {
        Self {
            core: Arc::new(TimerCore {
                short_press_ms,
                long_press_ms,
                clock,
                state: ReentrantMutex::new(RefCell::new(TimerState::default())),
                handlers,
            }),
            worker: Mutex::new(Worker::new("button-timer")),
        }
    }

    pub fn short_press_ms(&self) -> u64 {
        self.core.short_press_ms
    }

    pub fn long_press_ms(&self) -> u64 {
        self.core.long_press_ms
    }

    /// Starts the background long-press scan.
    pub fn start(&self) -> Result<()> {
        let core = self.core.clone();
        self.worker.lock().start_loop(
            SCAN_PERIOD,
            move || {
                core.scan();
                Ok(())
            },
            |_| {},
        )
    }

    pub fn stop(&self) {
        self.worker.lock().stop();
    }

    pub fn register_press(&self, key: u16) {
        self.core.press(key);
    }

    pub fn register_release(&self, key: u16) {
        self.core.release(key);
    }

    pub fn cancel_press(&self, key: u16) {
        self.core.cancel(key);
    }

    /// One pass of the long-press scan.
    pub fn scan(&self) {
        self.core.scan();
    }

    pub fn is_pressed(&self, key: u16) -> bool {
        self.core.state.lock().borrow().pressed.contains_key(&key)
    }
}
