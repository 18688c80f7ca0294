//! Model parameter bookkeeping.
//!
//! Each profile kind declares a static table of [`ParamSpec`]s (name, unit,
//! bounds, cyclic flag, default); a [`ParamSet`] pairs that table with the
//! current named values and locked flags, and provides the ordered
//! free-parameter vector the sampling and jacobian engines consume. Access is
//! by name-keyed lookup against the declared table, so an unknown name is an
//! error instead of a silently injected attribute.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParamError {
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("parameter '{name}' value {value} outside bounds ({lo}, {hi})")]
    OutOfBounds {
        name: String,
        value: f64,
        lo: f64,
        hi: f64,
    },

    #[error("parameter '{0}' has no value yet; set it or run initialization")]
    NotInitialized(String),

    #[error("free parameter vector length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },
}

/// Static declaration of one model parameter.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub unit: &'static str,
    /// `(low, high)` limits. Cyclic parameters wrap into this range; bounded
    /// non-cyclic parameters reject values outside it.
    pub bounds: Option<(f64, f64)>,
    pub cyclic: bool,
    pub default: Option<f64>,
}

impl ParamSpec {
    pub const fn plain(name: &'static str, unit: &'static str) -> Self {
        Self {
            name,
            unit,
            bounds: None,
            cyclic: false,
            default: None,
        }
    }

    pub const fn bounded(name: &'static str, unit: &'static str, lo: f64, hi: f64) -> Self {
        Self {
            name,
            unit,
            bounds: Some((lo, hi)),
            cyclic: false,
            default: None,
        }
    }

    pub const fn cyclic(name: &'static str, unit: &'static str, lo: f64, hi: f64) -> Self {
        Self {
            name,
            unit,
            bounds: Some((lo, hi)),
            cyclic: true,
            default: None,
        }
    }
}

/// Named parameter values and locked flags over a static spec table.
#[derive(Debug, Clone)]
pub struct ParamSet {
    specs: &'static [ParamSpec],
    values: Vec<Option<f64>>,
    locked: Vec<bool>,
}

impl ParamSet {
    pub fn new(specs: &'static [ParamSpec]) -> Self {
        Self {
            specs,
            values: specs.iter().map(|s| s.default).collect(),
            locked: vec![false; specs.len()],
        }
    }

    pub fn specs(&self) -> &'static [ParamSpec] {
        self.specs
    }

    fn index(&self, name: &str) -> Result<usize, ParamError> {
        self.specs
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| ParamError::UnknownParameter(name.to_string()))
    }

    pub fn is_set(&self, name: &str) -> Result<bool, ParamError> {
        Ok(self.values[self.index(name)?].is_some())
    }

    pub fn is_locked(&self, name: &str) -> Result<bool, ParamError> {
        Ok(self.locked[self.index(name)?])
    }

    pub fn set_locked(&mut self, name: &str, locked: bool) -> Result<(), ParamError> {
        let i = self.index(name)?;
        self.locked[i] = locked;
        Ok(())
    }

    /// Current value of `name`; an unset parameter is an error.
    pub fn value(&self, name: &str) -> Result<f64, ParamError> {
        let i = self.index(name)?;
        self.values[i].ok_or_else(|| ParamError::NotInitialized(name.to_string()))
    }

    /// Set `name` to `value`. Cyclic parameters wrap into their range;
    /// bounded parameters reject out-of-range values.
    pub fn set(&mut self, name: &str, value: f64) -> Result<(), ParamError> {
        let i = self.index(name)?;
        let spec = &self.specs[i];
        let value = match spec.bounds {
            Some((lo, hi)) if spec.cyclic => lo + (value - lo).rem_euclid(hi - lo),
            Some((lo, hi)) => {
                if value < lo || value > hi {
                    return Err(ParamError::OutOfBounds {
                        name: name.to_string(),
                        value,
                        lo,
                        hi,
                    });
                }
                value
            }
            None => value,
        };
        self.values[i] = Some(value);
        Ok(())
    }

    /// Names of unlocked parameters, in declaration order.
    pub fn free_names(&self) -> Vec<&'static str> {
        self.specs
            .iter()
            .zip(&self.locked)
            .filter(|(_, &locked)| !locked)
            .map(|(s, _)| s.name)
            .collect()
    }

    /// Values of unlocked parameters, in declaration order.
    pub fn free_vector(&self) -> Result<Vec<f64>, ParamError> {
        self.free_names()
            .into_iter()
            .map(|name| self.value(name))
            .collect()
    }

    /// Write a free-parameter vector back into named values.
    pub fn set_free_vector(&mut self, values: &[f64]) -> Result<(), ParamError> {
        let names = self.free_names();
        if names.len() != values.len() {
            return Err(ParamError::LengthMismatch {
                expected: names.len(),
                got: values.len(),
            });
        }
        for (name, &v) in names.iter().zip(values) {
            self.set(name, v)?;
        }
        Ok(())
    }
}
