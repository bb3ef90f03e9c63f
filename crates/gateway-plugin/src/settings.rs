//! Typed plugin settings.
//!
//! Each plugin declares the keys it understands, their types and optional
//! bounds. Values are validated when set, and the whole object is locked
//! against mutation once the gateway starts the plugin.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

/// Settings errors.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The plugin has started; settings can no longer change.
    #[error("Settings are locked")]
    Locked,

    /// The key was never declared.
    #[error("Unknown setting: {0}")]
    UnknownKey(String),

    /// The value has the wrong type.
    #[error("Setting {key} expects {expected}, got {actual}")]
    WrongType {
        key: String,
        expected: SettingKind,
        actual: SettingKind,
    },

    /// The value is out of the declared bounds.
    #[error("Setting {key} = {value} is out of range {min}..={max}")]
    OutOfRange {
        key: String,
        value: i64,
        min: i64,
        max: i64,
    },

    /// A required key has no value and no default.
    #[error("Missing required setting: {0}")]
    Missing(String),
}

/// Setting value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Bool,
    Integer,
    Float,
    Text,
}

impl fmt::Display for SettingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettingKind::Bool => "bool",
            SettingKind::Integer => "integer",
            SettingKind::Float => "float",
            SettingKind::Text => "text",
        };
        f.write_str(name)
    }
}

/// A setting value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl SettingValue {
    #[must_use]
    pub fn kind(&self) -> SettingKind {
        match self {
            SettingValue::Bool(_) => SettingKind::Bool,
            SettingValue::Integer(_) => SettingKind::Integer,
            SettingValue::Float(_) => SettingKind::Float,
            SettingValue::Text(_) => SettingKind::Text,
        }
    }
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        SettingValue::Integer(v)
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        SettingValue::Float(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::Text(v.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        SettingValue::Text(v)
    }
}

/// Declaration of a single setting.
#[derive(Debug, Clone)]
pub struct SettingSpec {
    kind: SettingKind,
    default: Option<SettingValue>,
    range: Option<(i64, i64)>,
    required: bool,
}

impl SettingSpec {
    fn new(kind: SettingKind) -> Self {
        Self {
            kind,
            default: None,
            range: None,
            required: false,
        }
    }

    #[must_use]
    pub fn bool() -> Self {
        Self::new(SettingKind::Bool)
    }

    #[must_use]
    pub fn integer() -> Self {
        Self::new(SettingKind::Integer)
    }

    #[must_use]
    pub fn float() -> Self {
        Self::new(SettingKind::Float)
    }

    #[must_use]
    pub fn text() -> Self {
        Self::new(SettingKind::Text)
    }

    /// Restrict an integer setting to `min..=max`.
    #[must_use]
    pub fn range(mut self, min: i64, max: i64) -> Self {
        self.range = Some((min, max));
        self
    }

    #[must_use]
    pub fn default_value(mut self, value: impl Into<SettingValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Require a value before the plugin starts.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// A typed, validated key/value settings object.
#[derive(Debug, Default)]
pub struct Settings {
    specs: BTreeMap<String, SettingSpec>,
    values: DashMap<String, SettingValue>,
    /// Held for reading across each write, for writing by `lock`.
    locked: RwLock<bool>,
}

impl Settings {
    /// Create an empty settings object.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a setting.
    #[must_use]
    pub fn declare(mut self, key: impl Into<String>, spec: SettingSpec) -> Self {
        self.specs.insert(key.into(), spec);
        self
    }

    /// Set a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are locked, the key is unknown, or
    /// the value fails validation.
    pub fn set(&self, key: &str, value: impl Into<SettingValue>) -> Result<(), SettingsError> {
        let spec = self
            .specs
            .get(key)
            .ok_or_else(|| SettingsError::UnknownKey(key.to_string()))?;

        let value = match (spec.kind, value.into()) {
            // Integers are accepted where floats are declared.
            (SettingKind::Float, SettingValue::Integer(i)) => SettingValue::Float(i as f64),
            (_, value) => value,
        };

        if value.kind() != spec.kind {
            return Err(SettingsError::WrongType {
                key: key.to_string(),
                expected: spec.kind,
                actual: value.kind(),
            });
        }
        if let (SettingValue::Integer(v), Some((min, max))) = (&value, spec.range) {
            if *v < min || *v > max {
                return Err(SettingsError::OutOfRange {
                    key: key.to_string(),
                    value: *v,
                    min,
                    max,
                });
            }
        }

        let locked = self.locked.read().unwrap_or_else(PoisonError::into_inner);
        if *locked {
            return Err(SettingsError::Locked);
        }
        debug!(key = %key, value = ?value, "Setting updated");
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Apply a batch of values, stopping at the first invalid one.
    ///
    /// # Errors
    ///
    /// Returns the first validation error.
    pub fn apply<I, K>(&self, values: I) -> Result<(), SettingsError>
    where
        I: IntoIterator<Item = (K, SettingValue)>,
        K: AsRef<str>,
    {
        for (key, value) in values {
            self.set(key.as_ref(), value)?;
        }
        Ok(())
    }

    /// Check that every required setting has a value.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Missing`] for the first missing key.
    pub fn validate(&self) -> Result<(), SettingsError> {
        for (key, spec) in &self.specs {
            if spec.required && spec.default.is_none() && !self.values.contains_key(key) {
                return Err(SettingsError::Missing(key.clone()));
            }
        }
        Ok(())
    }

    /// Validate and lock the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails; the settings stay unlocked.
    pub fn lock(&self) -> Result<(), SettingsError> {
        let mut locked = self.locked.write().unwrap_or_else(PoisonError::into_inner);
        if *locked {
            return Ok(());
        }
        self.validate()?;
        *locked = true;
        Ok(())
    }

    /// Check if the settings are locked.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        *self.locked.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a value, falling back to the declared default.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<SettingValue> {
        self.values
            .get(key)
            .map(|v| v.clone())
            .or_else(|| self.specs.get(key).and_then(|s| s.default.clone()))
    }

    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            SettingValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_integer(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            SettingValue::Integer(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_float(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            SettingValue::Float(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            SettingValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Get an integer setting as a port number.
    #[must_use]
    pub fn get_port(&self, key: &str) -> Option<u16> {
        self.get_integer(key).and_then(|v| u16::try_from(v).ok())
    }
}
