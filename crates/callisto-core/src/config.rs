//! TOML configuration for an interpreter and its driver thread.
//!
//! ```toml
//! [clock]
//! tempo = 120.0
//! numerator = 4
//! denominator = 4
//!
//! [scheduler]
//! tick_interval = "1ms"
//! max_catch_up = 64
//!
//! [scheduler.time_mode]
//! kind = "scaled"
//! rate = 2.0
//!
//! [interpreter]
//! max_call_depth = 256
//! gc_threshold = 1024
//! ```
//!
//! Every key is optional; missing keys take their defaults.

use crate::error::ConfigError;
use crate::timing::{Clock, TimeMode, TimeSignature};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub clock: ClockSettings,
    pub scheduler: SchedulerSettings,
    pub interpreter: InterpreterSettings,
}

/// Initial tempo and time signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSettings {
    pub tempo: f64,
    pub numerator: u32,
    pub denominator: u32,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            tempo: 120.0,
            numerator: 4,
            denominator: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// How often the driver thread ticks, in humantime syntax ("1ms", "500us").
    pub tick_interval: String,
    /// Firings one thread may make in a single tick before it is re-phased.
    pub max_catch_up: u64,
    pub time_mode: TimeMode,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: "1ms".to_string(),
            max_catch_up: 64,
            time_mode: TimeMode::Wall,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterSettings {
    pub max_call_depth: usize,
    /// Scope frames allocated between reclamation passes.
    pub gc_threshold: usize,
}

impl Default for InterpreterSettings {
    fn default() -> Self {
        Self {
            max_call_depth: 256,
            gc_threshold: 1024,
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Build the initial clock described by `[clock]`.
    pub fn clock(&self) -> Result<Clock, ConfigError> {
        let signature = TimeSignature::new(self.clock.numerator, self.clock.denominator)?;
        Ok(Clock::new(self.clock.tempo, signature)?)
    }

    pub fn tick_interval(&self) -> Result<Duration, ConfigError> {
        humantime::parse_duration(&self.scheduler.tick_interval).map_err(|source| {
            ConfigError::Duration {
                value: self.scheduler.tick_interval.clone(),
                source,
            }
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.clock()?;
        if self.tick_interval()?.is_zero() {
            return Err(ConfigError::Invalid(
                "scheduler.tick_interval must be greater than zero".to_string(),
            ));
        }
        if self.scheduler.max_catch_up == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_catch_up must be at least 1".to_string(),
            ));
        }
        if let TimeMode::Scaled { rate } = self.scheduler.time_mode {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "scheduler.time_mode rate must be positive, got {}",
                    rate
                )));
            }
        }
        if self.interpreter.max_call_depth == 0 {
            return Err(ConfigError::Invalid(
                "interpreter.max_call_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
