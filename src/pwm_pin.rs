use log::{debug, warn};
use serde::Serialize;

use crate::config::IoConfig;

pub const DEFAULT_GAMMA: f64 = 2.8;
pub const DEFAULT_SERVO_MIN_MS: f64 = 1.0;
pub const DEFAULT_SERVO_MAX_MS: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PwmFilter {
    #[default]
    None,
    Led,
    Servo,
}

impl PwmFilter {
    pub fn parse(filter: &str) -> Self {
        match filter.to_ascii_lowercase().as_str() {
            "led" => PwmFilter::Led,
            "servo" => PwmFilter::Servo,
            _ => PwmFilter::None,
        }
    }
}

/// Raw settings of one PWM channel before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct PwmPinSettings {
    pub filter: PwmFilter,
    pub gamma: f64,
    pub min: f64,
    pub max: f64,
    pub value: f64,
    pub offset: f64,
    pub servo_min_ms: f64,
    pub servo_max_ms: f64,
}

impl Default for PwmPinSettings {
    fn default() -> Self {
        Self {
            filter: PwmFilter::None,
            gamma: DEFAULT_GAMMA,
            min: 0.0,
            max: 1.0,
            value: 0.0,
            offset: 0.0,
            servo_min_ms: DEFAULT_SERVO_MIN_MS,
            servo_max_ms: DEFAULT_SERVO_MAX_MS,
        }
    }
}

impl PwmPinSettings {
    pub fn from_config(io: &IoConfig) -> Self {
        let defaults = Self::default();
        Self {
            filter: io.filter.as_deref().map(PwmFilter::parse).unwrap_or_default(),
            gamma: io.gamma.unwrap_or(defaults.gamma),
            min: io.min.unwrap_or(defaults.min),
            max: io.max.unwrap_or(defaults.max),
            value: io.default.unwrap_or(defaults.value),
            offset: io.offset.unwrap_or(defaults.offset),
            servo_min_ms: io.servo_min_ms.unwrap_or(defaults.servo_min_ms),
            servo_max_ms: io.servo_max_ms.unwrap_or(defaults.servo_max_ms),
        }
    }
}

/// A hardware PWM channel with a user-facing value range and a transfer
/// filter between that value and the duty fraction sent to the chip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PwmPin {
    handle: String,
    pin: u16,
    filter: PwmFilter,
    gamma: f64,
    min: f64,
    max: f64,
    value: f64,
    offset: f64,
    servo_min_ms: f64,
    servo_max_ms: f64,
    value_inverted: bool,
    servo_inverted: bool,
}

impl PwmPin {
    pub fn new(handle: impl Into<String>, pin: u16, settings: PwmPinSettings) -> Self {
        let PwmPinSettings {
            filter,
            mut gamma,
            mut min,
            mut max,
            value,
            mut offset,
            mut servo_min_ms,
            mut servo_max_ms,
        } = settings;

        if !(0.0..1.0).contains(&offset) {
            offset = 0.0;
        }
        let servo_inverted = servo_min_ms > servo_max_ms;
        if servo_inverted {
            std::mem::swap(&mut servo_min_ms, &mut servo_max_ms);
        }
        let value_inverted = min > max;
        if value_inverted {
            std::mem::swap(&mut min, &mut max);
        }
        if filter == PwmFilter::Servo {
            gamma = 1.0;
        }

        let pin = Self {
            handle: handle.into(),
            pin,
            filter,
            gamma,
            min,
            max,
            value: value.clamp(min, max),
            offset,
            servo_min_ms,
            servo_max_ms,
            value_inverted,
            servo_inverted,
        };
        debug!("pwm pin {pin:?}");
        pin
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn pin(&self) -> u16 {
        self.pin
    }

    pub fn filter(&self) -> PwmFilter {
        self.filter
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn is_value_inverted(&self) -> bool {
        self.value_inverted
    }

    pub fn is_servo_inverted(&self) -> bool {
        self.servo_inverted
    }

    pub fn set_value(&mut self, value: f64) {
        self.value = value.clamp(self.min, self.max);
    }

    pub fn forward_gamma(&self, fraction: f64) -> f64 {
        fraction.powf(self.gamma)
    }

    pub fn reverse_gamma(&self, fraction: f64) -> f64 {
        let inverse = if self.gamma != 0.0 { 1.0 / self.gamma } else { 0.0 };
        fraction.powf(inverse)
    }

    /// Servo pulse bounds as fractions of `period_ms`, or None when the
    /// longest pulse does not fit in one period or the window is empty.
    fn servo_range(&self, period_ms: f64) -> Option<(f64, f64)> {
        let lo = self.servo_min_ms / period_ms;
        let hi = self.servo_max_ms / period_ms;
        if hi >= 1.0 || !hi.is_finite() {
            warn!(
                "{}: servo pulse of {}ms exceeds pwm period of {period_ms}ms",
                self.handle, self.servo_max_ms
            );
            return None;
        }
        if hi <= lo {
            warn!(
                "{}: servo pulse window {}..{}ms is empty",
                self.handle, self.servo_min_ms, self.servo_max_ms
            );
            return None;
        }
        Some((lo, hi))
    }

    /// Duty fraction for the current value.
    pub fn filtered_value(&self, period_ms: f64) -> f64 {
        let span = self.max - self.min;
        let mut fraction = if span != 0.0 {
            (self.value - self.min) / span
        } else {
            0.0
        };
        if self.value_inverted {
            fraction = 1.0 - fraction;
        }

        match self.filter {
            PwmFilter::None => fraction,
            PwmFilter::Led => self.forward_gamma(fraction),
            PwmFilter::Servo => match self.servo_range(period_ms) {
                Some((lo, hi)) => {
                    if self.servo_inverted {
                        fraction = 1.0 - fraction;
                    }
                    lo + fraction * (hi - lo)
                }
                None => 0.0,
            },
        }
    }

    /// Inverse of [`PwmPin::filtered_value`]. `offset` is taken only when it
    /// lies in `[0, 1)`.
    pub fn set_from_filtered_value(&mut self, filtered: f64, offset: f64, period_ms: f64) {
        let mut fraction = match self.filter {
            PwmFilter::None => filtered,
            PwmFilter::Led => self.reverse_gamma(filtered),
            PwmFilter::Servo => match self.servo_range(period_ms) {
                Some((lo, hi)) => {
                    let f = (filtered - lo) / (hi - lo);
                    if self.servo_inverted { 1.0 - f } else { f }
                }
                None => 0.0,
            },
        };
        if self.value_inverted {
            fraction = 1.0 - fraction;
        }
        if !fraction.is_finite() {
            fraction = 0.0;
        }
        self.value = (self.min + fraction * (self.max - self.min)).clamp(self.min, self.max);

        if (0.0..1.0).contains(&offset) {
            self.offset = offset;
        }
    }
}
