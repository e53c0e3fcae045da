//! Persistent settings.
//!
//! A [`ConfigStore`] is a flat key/value store of JSON values. The runtime
//! loads a [`TeleopConfig`] from it once and hands each section to the
//! component that needs it; nothing below the runtime reads the store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::arbiter::ArbiterConfig;
use crate::bus::BusConfig;
use crate::dataset::RECORDING_INTERVAL_MS;
use crate::error::ConfigError;
use crate::input::gamepad::GamepadConfig;
use crate::input::key_sequence::KeySequenceConfig;
use crate::input::leader::LeaderConfig;
use crate::integrator::IntegratorConfig;

/// Store key holding the serialised [`TeleopConfig`].
pub const TELEOP_KEY: &str = "teleop";

pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> Result<(), ConfigError>;
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Option<Value> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value);
        Ok(())
    }
}

/// A single JSON object on disk, rewritten on every `set`.
#[derive(Debug)]
pub struct JsonFileConfigStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileConfigStore {
    /// Open `path`, loading its contents if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonFileConfigStore {
    fn get(&self, key: &str) -> Option<Value> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value);
        fs::write(&self.path, serde_json::to_vec_pretty(&*values)?)?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub interval_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            interval_ms: RECORDING_INTERVAL_MS,
        }
    }
}

/// Every tunable of a teleoperation session. Missing fields take their
/// defaults, so partial documents are valid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeleopConfig {
    /// Arbitration and integration period.
    pub tick_interval_ms: u64,
    pub arbiter: ArbiterConfig,
    pub integrator: IntegratorConfig,
    pub gamepad: GamepadConfig,
    pub bus: BusConfig,
    pub leader: LeaderConfig,
    pub recording: RecordingConfig,
    pub key_sequence: KeySequenceConfig,
}

impl Default for TeleopConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 16,
            arbiter: ArbiterConfig::default(),
            integrator: IntegratorConfig::default(),
            gamepad: GamepadConfig::default(),
            bus: BusConfig::default(),
            leader: LeaderConfig::default(),
            recording: RecordingConfig::default(),
            key_sequence: KeySequenceConfig::default(),
        }
    }
}

impl TeleopConfig {
    /// Read the config stored under [`TELEOP_KEY`], or the defaults when
    /// nothing is stored yet.
    pub fn load(store: &dyn ConfigStore) -> Result<Self, ConfigError> {
        let config: Self = match store.get(TELEOP_KEY) {
            Some(value) => serde_json::from_value(value)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the integrator or the input sources
    /// misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let integrator = &self.integrator;
        if !(integrator.scale_factor.is_finite() && integrator.scale_factor > 0.0) {
            return Err(invalid("integrator.scale_factor", "must be a positive finite number"));
        }
        if let Some(max) = integrator.max_speed {
            if !(max.is_finite() && max >= 0.0) {
                return Err(invalid("integrator.max_speed", "must be a non-negative finite number"));
            }
        }
        if !self.arbiter.sensitivity.is_finite() {
            return Err(invalid("arbiter.sensitivity", "must be finite"));
        }
        if !self.arbiter.continuous_speed.is_finite() {
            return Err(invalid("arbiter.continuous_speed", "must be finite"));
        }
        if !self.gamepad.sensitivity.is_finite() {
            return Err(invalid("gamepad.sensitivity", "must be finite"));
        }
        if !(0.0..1.0).contains(&self.gamepad.dead_zone) {
            return Err(invalid("gamepad.dead_zone", "must be in [0, 1)"));
        }
        Ok(())
    }

    pub fn save(&self, store: &dyn ConfigStore) -> Result<(), ConfigError> {
        store.set(TELEOP_KEY, serde_json::to_value(self)?)
    }
}

fn invalid(field: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::InvalidSetting { field, reason }
}
