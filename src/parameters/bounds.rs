//! Parameter bounds implementation
//!
//! A parameter is constrained by one of three bounds specifications: a finite
//! (or half-open) range, a symmetric percentage around a center value, or
//! fixed. Degenerate ranges (`lo == hi`) behave like fixed parameters during
//! optimization.

use serde::{Deserialize, Serialize};
use std::f64::{INFINITY, NEG_INFINITY};
use thiserror::Error;

/// Errors that can occur when working with parameter bounds
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BoundsError {
    #[error("Invalid bounds: lo ({lo}) must not exceed hi ({hi})")]
    InvalidBounds { lo: f64, hi: f64 },

    #[error("Invalid percentage {pct}: must be finite and non-negative")]
    InvalidPercent { pct: f64 },

    #[error("NaN is not allowed in bounds")]
    NotANumber,
}

/// Bounds specification for a single parameter.
///
/// Infinite range ends serialize as `null`, so that the JSON form survives
/// a round trip through strict decoders.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "BoundsRepr", into = "BoundsRepr")]
pub enum Bounds {
    /// Value must lie in `[lo, hi]`; either end may be infinite.
    Range { lo: f64, hi: f64 },

    /// Value must lie within `pct` percent of `center`.
    PercentOffset { center: f64, pct: f64 },

    /// Value is frozen at its current setting.
    Fixed,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BoundsRepr {
    Range {
        #[serde(default)]
        lo: Option<f64>,
        #[serde(default)]
        hi: Option<f64>,
    },
    PercentOffset {
        center: f64,
        pct: f64,
    },
    Fixed,
}

impl From<Bounds> for BoundsRepr {
    fn from(bounds: Bounds) -> Self {
        match bounds {
            Bounds::Range { lo, hi } => BoundsRepr::Range {
                lo: if lo.is_finite() { Some(lo) } else { None },
                hi: if hi.is_finite() { Some(hi) } else { None },
            },
            Bounds::PercentOffset { center, pct } => BoundsRepr::PercentOffset { center, pct },
            Bounds::Fixed => BoundsRepr::Fixed,
        }
    }
}

impl From<BoundsRepr> for Bounds {
    fn from(repr: BoundsRepr) -> Self {
        match repr {
            BoundsRepr::Range { lo, hi } => Bounds::Range {
                lo: lo.unwrap_or(NEG_INFINITY),
                hi: hi.unwrap_or(INFINITY),
            },
            BoundsRepr::PercentOffset { center, pct } => Bounds::PercentOffset { center, pct },
            BoundsRepr::Fixed => Bounds::Fixed,
        }
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Bounds::Range {
            lo: NEG_INFINITY,
            hi: INFINITY,
        }
    }
}

impl Bounds {
    /// Create a range constraint.
    ///
    /// # Examples
    ///
    /// ```
    /// use reflfit::parameters::Bounds;
    ///
    /// let bounds = Bounds::range(0.0, 10.0).unwrap();
    /// assert_eq!(bounds.limits(), Some((0.0, 10.0)));
    /// assert!(Bounds::range(2.0, 1.0).is_err());
    /// ```
    pub fn range(lo: f64, hi: f64) -> Result<Self, BoundsError> {
        if lo.is_nan() || hi.is_nan() {
            return Err(BoundsError::NotANumber);
        }
        if lo > hi {
            return Err(BoundsError::InvalidBounds { lo, hi });
        }
        Ok(Bounds::Range { lo, hi })
    }

    /// Create a `center ± pct%` constraint.
    ///
    /// ```
    /// use reflfit::parameters::Bounds;
    ///
    /// let bounds = Bounds::percent(20.0, 10.0).unwrap();
    /// assert_eq!(bounds.limits(), Some((18.0, 22.0)));
    /// ```
    pub fn percent(center: f64, pct: f64) -> Result<Self, BoundsError> {
        if center.is_nan() {
            return Err(BoundsError::NotANumber);
        }
        if !pct.is_finite() || pct < 0.0 {
            return Err(BoundsError::InvalidPercent { pct });
        }
        Ok(Bounds::PercentOffset { center, pct })
    }

    /// Create an unbounded constraint (negative infinity to positive infinity)
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Check that the stored numbers describe a valid interval.
    ///
    /// Bounds built through the constructors are always valid; this catches
    /// values that arrived through deserialization or direct construction.
    pub fn validate(&self) -> Result<(), BoundsError> {
        match *self {
            Bounds::Range { lo, hi } => Self::range(lo, hi).map(|_| ()),
            Bounds::PercentOffset { center, pct } => Self::percent(center, pct).map(|_| ()),
            Bounds::Fixed => Ok(()),
        }
    }

    /// The `(lo, hi)` interval, or `None` for fixed parameters.
    pub fn limits(&self) -> Option<(f64, f64)> {
        match *self {
            Bounds::Range { lo, hi } => Some((lo, hi)),
            Bounds::PercentOffset { center, pct } => {
                let delta = (center * pct / 100.0).abs();
                Some((center - delta, center + delta))
            }
            Bounds::Fixed => None,
        }
    }

    /// True when the bounds pin the parameter to a single value or freeze it.
    pub fn is_degenerate(&self) -> bool {
        match self.limits() {
            Some((lo, hi)) => lo == hi,
            None => true,
        }
    }

    /// Check if the bounds are finite (both ends are finite)
    pub fn is_finite(&self) -> bool {
        self.limits()
            .map(|(lo, hi)| lo.is_finite() && hi.is_finite())
            .unwrap_or(false)
    }

    /// Check if a value is within the bounds. Fixed bounds contain nothing.
    pub fn contains(&self, value: f64) -> bool {
        match self.limits() {
            Some((lo, hi)) => value >= lo && value <= hi,
            None => false,
        }
    }

    /// Clamp a value to be within the bounds. Fixed bounds leave it alone.
    pub fn clamp(&self, value: f64) -> f64 {
        match self.limits() {
            Some((lo, hi)) => value.clamp(lo, hi),
            None => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_limits() {
        let bounds = Bounds::range(-1.0, 3.0).unwrap();
        assert_eq!(bounds.limits(), Some((-1.0, 3.0)));
        assert!(bounds.contains(0.0));
        assert!(!bounds.contains(3.5));
        assert_eq!(bounds.clamp(5.0), 3.0);
        assert!(!bounds.is_degenerate());
    }

    #[test]
    fn test_invalid_bounds() {
        assert_eq!(
            Bounds::range(1.0, 0.0),
            Err(BoundsError::InvalidBounds { lo: 1.0, hi: 0.0 })
        );
        assert_eq!(Bounds::range(f64::NAN, 0.0), Err(BoundsError::NotANumber));
        assert!(Bounds::percent(1.0, -5.0).is_err());
        assert!(Bounds::Range { lo: 3.0, hi: 1.0 }.validate().is_err());
    }

    #[test]
    fn test_percent_offset_negative_center() {
        let bounds = Bounds::percent(-50.0, 10.0).unwrap();
        assert_eq!(bounds.limits(), Some((-55.0, -45.0)));
    }

    #[test]
    fn test_degenerate() {
        assert!(Bounds::range(2.0, 2.0).unwrap().is_degenerate());
        assert!(Bounds::percent(4.0, 0.0).unwrap().is_degenerate());
        assert!(Bounds::Fixed.is_degenerate());
        assert!(!Bounds::unbounded().is_degenerate());
    }

    #[test]
    fn test_serialization_with_infinities() {
        let bounds = Bounds::Range {
            lo: 0.0,
            hi: INFINITY,
        };
        let json = serde_json::to_string(&bounds).unwrap();
        assert!(json.contains("\"type\":\"range\""));
        assert!(json.contains("null"));

        let back: Bounds = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bounds);

        let fixed: Bounds = serde_json::from_str(r#"{"type":"fixed"}"#).unwrap();
        assert_eq!(fixed, Bounds::Fixed);
    }
}
