//! Per-call options threaded read-only through every driver
//!
//! Options are an immutable map from [`OptionKey`] to [`OptionValue`].
//! Missing keys fall back to defaults. Values are validated once, when the
//! map is built or parsed, so drivers can read them without further checks.
//!
//! ```rust
//! use tessera_core::options::{Options, PanelVariant};
//!
//! let opts = Options::builder()
//!     .lookahead(2)
//!     .panel_variant(PanelVariant::PartialPivot)
//!     .build()
//!     .unwrap();
//! assert_eq!(opts.lookahead(), 2);
//! assert_eq!(opts.devices(), 0);
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default number of panels in flight ahead of the trailing update
pub const DEFAULT_LOOKAHEAD: usize = 1;

/// Default capacity of one simulated device
pub const DEFAULT_DEVICE_MEMORY: usize = 1 << 30;

/// Option names
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OptionKey {
    /// Panels factored ahead of the bulk trailing update
    Lookahead,
    /// Accelerators per rank; 0 keeps everything on the host
    Devices,
    /// Multiplier on machine epsilon for the pivot threshold
    Tolerance,
    /// Pivoting strategy for LU panels
    PanelVariant,
    /// Bytes of memory per device
    DeviceMemory,
    /// Host threads for trailing updates; 0 uses the global pool
    HostThreads,
}

/// Pivoting strategy for the LU panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PanelVariant {
    /// Row interchanges chosen by largest magnitude in the panel column
    #[default]
    PartialPivot,
    /// No interchanges; fails on a zero pivot
    NoPivot,
}

/// Typed option value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Int(i64),
    Real(f64),
    Variant(PanelVariant),
}

/// Immutable option map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options {
    values: BTreeMap<OptionKey, OptionValue>,
}

impl Options {
    /// Empty map; every accessor returns its default
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }

    /// Parse a JSON object such as `{"Lookahead": 3, "PanelVariant": "NoPivot"}`
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Options = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfiguration(format!("Malformed options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::InvalidConfiguration(format!("Cannot serialize options: {e}")))
    }

    /// Raw value for a key, if set
    pub fn get(&self, key: OptionKey) -> Option<&OptionValue> {
        self.values.get(&key)
    }

    /// Copy of these options with one key replaced
    pub fn with(&self, key: OptionKey, value: OptionValue) -> Result<Self> {
        let mut values = self.values.clone();
        values.insert(key, value);
        let options = Self { values };
        options.validate()?;
        Ok(options)
    }

    pub fn lookahead(&self) -> usize {
        self.count(OptionKey::Lookahead).unwrap_or(DEFAULT_LOOKAHEAD)
    }

    pub fn devices(&self) -> usize {
        self.count(OptionKey::Devices).unwrap_or(0)
    }

    pub fn tolerance(&self) -> f64 {
        match self.values.get(&OptionKey::Tolerance) {
            Some(OptionValue::Real(x)) => *x,
            Some(OptionValue::Int(x)) => *x as f64,
            _ => 1.0,
        }
    }

    pub fn panel_variant(&self) -> PanelVariant {
        match self.values.get(&OptionKey::PanelVariant) {
            Some(OptionValue::Variant(v)) => *v,
            _ => PanelVariant::default(),
        }
    }

    pub fn device_memory(&self) -> usize {
        self.count(OptionKey::DeviceMemory)
            .unwrap_or(DEFAULT_DEVICE_MEMORY)
    }

    pub fn host_threads(&self) -> usize {
        self.count(OptionKey::HostThreads).unwrap_or(0)
    }

    fn count(&self, key: OptionKey) -> Option<usize> {
        match self.values.get(&key) {
            Some(OptionValue::Int(x)) => usize::try_from(*x).ok(),
            _ => None,
        }
    }

    /// Check every present key has a value of the right type and range
    pub fn validate(&self) -> Result<()> {
        for (&key, &value) in &self.values {
            match (key, value) {
                (
                    OptionKey::Lookahead | OptionKey::Devices | OptionKey::HostThreads,
                    OptionValue::Int(x),
                ) if x >= 0 => {}
                (OptionKey::DeviceMemory, OptionValue::Int(x)) if x > 0 => {}
                (OptionKey::Tolerance, OptionValue::Real(x)) if x.is_finite() && x > 0.0 => {}
                (OptionKey::Tolerance, OptionValue::Int(x)) if x > 0 => {}
                (OptionKey::PanelVariant, OptionValue::Variant(_)) => {}
                (key, value) => {
                    return Err(Error::InvalidConfiguration(format!(
                        "Option {key:?} cannot take value {value:?}"
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Builder for [`Options`]
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    values: BTreeMap<OptionKey, OptionValue>,
}

impl OptionsBuilder {
    pub fn lookahead(self, depth: i64) -> Self {
        self.set(OptionKey::Lookahead, OptionValue::Int(depth))
    }

    pub fn devices(self, count: i64) -> Self {
        self.set(OptionKey::Devices, OptionValue::Int(count))
    }

    pub fn tolerance(self, factor: f64) -> Self {
        self.set(OptionKey::Tolerance, OptionValue::Real(factor))
    }

    pub fn panel_variant(self, variant: PanelVariant) -> Self {
        self.set(OptionKey::PanelVariant, OptionValue::Variant(variant))
    }

    pub fn device_memory(self, bytes: i64) -> Self {
        self.set(OptionKey::DeviceMemory, OptionValue::Int(bytes))
    }

    pub fn host_threads(self, threads: i64) -> Self {
        self.set(OptionKey::HostThreads, OptionValue::Int(threads))
    }

    pub fn set(mut self, key: OptionKey, value: OptionValue) -> Self {
        self.values.insert(key, value);
        self
    }

    pub fn build(self) -> Result<Options> {
        let options = Options {
            values: self.values,
        };
        options.validate()?;
        Ok(options)
    }
}
