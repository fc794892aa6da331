use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{PiIoError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Gpio,
    Mcp23017,
    Pca9685,
}

impl GroupKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind.to_ascii_lowercase().as_str() {
            "gpio" => Some(GroupKind::Gpio),
            "mcp23017" => Some(GroupKind::Mcp23017),
            "pca9685" => Some(GroupKind::Pca9685),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Button,
    InputPin,
    OutputPin,
    PwmPin,
    MultibitIn,
    MultibitOut,
}

impl IoKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind.to_ascii_lowercase().as_str() {
            "button" => Some(IoKind::Button),
            "inputpin" => Some(IoKind::InputPin),
            "outputpin" => Some(IoKind::OutputPin),
            "pwmpin" => Some(IoKind::PwmPin),
            "multibitin" => Some(IoKind::MultibitIn),
            "multibitout" => Some(IoKind::MultibitOut),
            _ => None,
        }
    }
}

/// Pin reference as written in the configuration: a numeric id or a
/// backend-specific pin name.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum PinRef {
    Number(i64),
    Name(String),
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct IoConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub pin: Option<PinRef>,
    pub pins: Option<Vec<PinRef>>,
    pub invert: Option<bool>,
    pub pullup: Option<bool>,
    pub pulldown: Option<bool>,
    pub int_enabled: Option<bool>,
    pub filter: Option<String>,
    pub gamma: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub default: Option<f64>,
    pub offset: Option<f64>,
    pub servo_min_ms: Option<f64>,
    pub servo_max_ms: Option<f64>,
}

impl IoConfig {
    pub fn io_kind(&self) -> Result<IoKind> {
        IoKind::parse(&self.kind).ok_or_else(|| {
            PiIoError::ConfigInvalid(format!("{}: unknown io type '{}'", self.name, self.kind))
        })
    }

    pub fn single_pin(&self) -> Result<&PinRef> {
        self.pin
            .as_ref()
            .ok_or_else(|| PiIoError::ConfigInvalid(format!("{}: missing 'pin'", self.name)))
    }

    pub fn pin_list(&self) -> Result<&[PinRef]> {
        match self.pins.as_deref() {
            Some(pins) if !pins.is_empty() => Ok(pins),
            _ => Err(PiIoError::ConfigInvalid(format!(
                "{}: missing or empty 'pins'",
                self.name
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct IoGroupConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub button_shortpress_time: Option<u64>,
    pub button_longpress_time: Option<u64>,
    pub pwm_tickdelay_us: Option<u64>,
    pub pwm_ticks: Option<u32>,
    pub pwm_frequency: Option<u32>,
    pub address: Option<i64>,
    pub swapab: Option<bool>,
    pub intpin: Option<i64>,
    pub int_opendrain: Option<bool>,
    pub int_activehigh: Option<bool>,
    pub noisemargin: Option<u32>,
    pub noisetimeout: Option<u64>,
    pub osc_frequency: Option<u32>,
    pub external_clock: Option<bool>,
    pub output_invert: Option<bool>,
    pub output_type: Option<String>,
    pub output_on_disabled: Option<String>,
    #[serde(default)]
    pub io: Vec<IoConfig>,
}

impl IoGroupConfig {
    pub fn group_kind(&self) -> Result<GroupKind> {
        GroupKind::parse(&self.kind).ok_or_else(|| {
            PiIoError::InvalidArgument(format!("{}: unknown group type '{}'", self.name, self.kind))
        })
    }
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_event_history_capacity() -> usize {
    32
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
    pub iogroups: Vec<IoGroupConfig>,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| PiIoError::ConfigInvalid(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents)
            .map_err(|e| PiIoError::ConfigInvalid(format!("Invalid config json: {e}")))
    }
}
