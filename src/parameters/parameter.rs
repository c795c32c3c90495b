//! Parameter definition and implementation
//!
//! A [`Parameter`] is a named scalar with a current value, a bounds
//! specification and a free/fixed flag. Only free parameters with a
//! non-degenerate interval are varied by the optimizers.

use crate::parameters::bounds::{Bounds, BoundsError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when working with parameters
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("Bounds error: {0}")]
    BoundsError(#[from] BoundsError),

    #[error("Parameter '{name}' already exists")]
    DuplicateName { name: String },

    #[error("Parameter '{name}' not found")]
    ParameterNotFound { name: String },

    #[error("Parameter '{name}' has non-finite value {value}")]
    NonFiniteValue { name: String, value: f64 },

    #[error("Expected {expected} values, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Malformed parameter file line {line}: {message}")]
    ParFile { line: usize, message: String },
}

/// A parameter of a fit problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Name of the parameter, unique within a problem
    pub name: String,

    /// Current value of the parameter
    value: f64,

    /// Bounds specification
    bounds: Bounds,

    /// Whether this parameter may be varied during optimization
    pub free: bool,
}

impl Parameter {
    /// Create a free, unbounded parameter.
    ///
    /// # Examples
    ///
    /// ```
    /// use reflfit::parameters::Parameter;
    ///
    /// let param = Parameter::new("thickness", 100.0);
    /// assert_eq!(param.name(), "thickness");
    /// assert_eq!(param.value(), 100.0);
    /// assert!(param.free);
    /// ```
    pub fn new(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
            bounds: Bounds::default(),
            free: true,
        }
    }

    /// Create a free parameter constrained to `[lo, hi]`.
    ///
    /// The value is clamped into the interval.
    ///
    /// ```
    /// use reflfit::parameters::Parameter;
    ///
    /// let param = Parameter::with_range("rho", 12.0, 0.0, 10.0).unwrap();
    /// assert_eq!(param.value(), 10.0);
    /// ```
    pub fn with_range(name: &str, value: f64, lo: f64, hi: f64) -> Result<Self, ParameterError> {
        let bounds = Bounds::range(lo, hi)?;
        Ok(Self {
            name: name.to_string(),
            value: bounds.clamp(value),
            bounds,
            free: true,
        })
    }

    /// Create a free parameter allowed to move `pct` percent around `value`.
    pub fn with_percent(name: &str, value: f64, pct: f64) -> Result<Self, ParameterError> {
        let bounds = Bounds::percent(value, pct)?;
        Ok(Self {
            name: name.to_string(),
            value,
            bounds,
            free: true,
        })
    }

    /// Create a fixed parameter.
    pub fn fixed(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
            bounds: Bounds::Fixed,
            free: false,
        }
    }

    /// Get the name of the parameter
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current value of the parameter
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Set the value of the parameter.
    ///
    /// The value is not clamped: values recalled from a file may sit outside
    /// the current bounds, and the optimizer start point clamps them instead.
    pub fn set_value(&mut self, value: f64) -> Result<(), ParameterError> {
        if !value.is_finite() {
            return Err(ParameterError::NonFiniteValue {
                name: self.name.clone(),
                value,
            });
        }
        self.value = value;
        Ok(())
    }

    /// Get the bounds specification
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Replace the bounds specification
    pub fn set_bounds(&mut self, bounds: Bounds) -> Result<(), ParameterError> {
        bounds.validate()?;
        self.bounds = bounds;
        Ok(())
    }

    /// Freeze or release the parameter
    pub fn set_free(&mut self, free: bool) {
        self.free = free;
    }

    /// True when the optimizer will vary this parameter.
    ///
    /// A parameter whose bounds collapse to a point is treated as fixed even
    /// if it is flagged free.
    pub fn is_fitted(&self) -> bool {
        self.free && !self.bounds.is_degenerate()
    }

    /// `(lo, hi)` interval of a fitted parameter
    pub fn limits(&self) -> Option<(f64, f64)> {
        self.bounds.limits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_parameter() {
        let param = Parameter::fixed("substrate", 2.07);
        assert!(!param.free);
        assert!(!param.is_fitted());
        assert_eq!(param.limits(), None);
    }

    #[test]
    fn test_degenerate_range_is_not_fitted() {
        let param = Parameter::with_range("roughness", 5.0, 5.0, 5.0).unwrap();
        assert!(param.free);
        assert!(!param.is_fitted());
    }

    #[test]
    fn test_set_value_rejects_nan() {
        let mut param = Parameter::new("x", 1.0);
        assert!(param.set_value(f64::NAN).is_err());
        assert!(param.set_value(2.5).is_ok());
        assert_eq!(param.value(), 2.5);
    }

    #[test]
    fn test_percent_parameter() {
        let param = Parameter::with_percent("depth", 50.0, 20.0).unwrap();
        assert_eq!(param.limits(), Some((40.0, 60.0)));
        assert!(param.is_fitted());
    }
}
