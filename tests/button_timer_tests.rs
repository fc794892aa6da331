use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use piio::button::{ButtonHandlers, ButtonTimer, ManualClock};

#[derive(Default)]
struct Counters {
    short: AtomicUsize,
    long: AtomicUsize,
}

impl Counters {
    fn short(&self) -> usize {
        self.short.load(Ordering::SeqCst)
    }

    fn long(&self) -> usize {
        self.long.load(Ordering::SeqCst)
    }
}

fn timer_with(
    validate: Option<bool>,
) -> (ButtonTimer, Arc<ManualClock>, Arc<Counters>) {
    let clock = Arc::new(ManualClock::default());
    let counters = Arc::new(Counters::default());
    let short = counters.clone();
    let long = counters.clone();
    let handlers = ButtonHandlers {
        short_press: Some(Box::new(move |_| {
            short.short.fetch_add(1, Ordering::SeqCst);
        })),
        long_press: Some(Box::new(move |_| {
            long.long.fetch_add(1, Ordering::SeqCst);
        })),
        validate_long_press: validate.map(|accept| {
            Box::new(move |_: u16| accept) as Box<dyn Fn(u16) -> bool + Send + Sync>
        }),
    };
    let timer = ButtonTimer::with_clock(25, 6000, clock.clone(), handlers);
    (timer, clock, counters)
}

#[test]
fn release_after_short_minimum_fires_short_press() {
    let (timer, clock, counters) = timer_with(None);
    timer.register_press(7);
    clock.advance(100);
    timer.scan();
    timer.register_release(7);

    assert_eq!(counters.short(), 1);
    assert_eq!(counters.long(), 0);
    assert!(!timer.is_pressed(7));
}

#[test]
fn release_exactly_at_short_minimum_counts() {
    let (timer, clock, counters) = timer_with(None);
    timer.register_press(1);
    clock.advance(25);
    timer.register_release(1);
    assert_eq!(counters.short(), 1);
}

#[test]
fn bounce_shorter_than_minimum_is_ignored() {
    let (timer, clock, counters) = timer_with(None);
    timer.register_press(1);
    clock.advance(10);
    timer.register_release(1);
    assert_eq!(counters.short(), 0);
    assert!(!timer.is_pressed(1));
}

#[test]
fn held_key_fires_long_press_once() {
    let (timer, clock, counters) = timer_with(Some(true));
    timer.register_press(3);
    clock.advance(5999);
    timer.scan();
    assert_eq!(counters.long(), 0);

    clock.advance(1);
    timer.scan();
    assert_eq!(counters.long(), 1);
    assert!(!timer.is_pressed(3));

    clock.advance(500);
    timer.scan();
    timer.register_release(3);
    assert_eq!(counters.long(), 1);
    assert_eq!(counters.short(), 0);
}

#[test]
fn rejected_long_press_still_clears_key() {
    let (timer, clock, counters) = timer_with(Some(false));
    timer.register_press(3);
    clock.advance(7000);
    timer.scan();
    assert_eq!(counters.long(), 0);
    assert!(!timer.is_pressed(3));
}

#[test]
fn repeated_press_keeps_first_timestamp() {
    let (timer, clock, counters) = timer_with(None);
    timer.register_press(2);
    clock.advance(3000);
    timer.register_press(2);
    clock.advance(3000);
    timer.scan();
    assert_eq!(counters.long(), 1);
}

#[test]
fn cancel_discards_press_silently() {
    let (timer, clock, counters) = timer_with(None);
    timer.register_press(4);
    timer.cancel_press(4);
    clock.advance(100);
    timer.register_release(4);
    clock.advance(7000);
    timer.scan();
    assert_eq!(counters.short(), 0);
    assert_eq!(counters.long(), 0);
}

#[test]
fn calls_from_inside_a_callback_are_dropped() {
    let clock = Arc::new(ManualClock::default());
    let slot: Arc<OnceLock<Arc<ButtonTimer>>> = Arc::new(OnceLock::new());
    let called = Arc::new(AtomicBool::new(false));

    let inner_slot = slot.clone();
    let inner_called = called.clone();
    let handlers = ButtonHandlers {
        short_press: Some(Box::new(move |_| {
            inner_called.store(true, Ordering::SeqCst);
            if let Some(timer) = inner_slot.get() {
                timer.register_press(99);
            }
        })),
        ..ButtonHandlers::default()
    };
    let timer = Arc::new(ButtonTimer::with_clock(25, 6000, clock.clone(), handlers));
    assert!(slot.set(timer.clone()).is_ok());

    timer.register_press(1);
    clock.advance(50);
    timer.register_release(1);

    assert!(called.load(Ordering::SeqCst));
    assert!(!timer.is_pressed(99));

    // the guard is lowered again once the callback returns
    timer.register_press(99);
    assert!(timer.is_pressed(99));
}

#[test]
fn timings_are_exposed() {
    let (timer, _, _) = timer_with(None);
    assert_eq!(timer.short_press_ms(), 25);
    assert_eq!(timer.long_press_ms(), 6000);
}
