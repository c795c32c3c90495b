//! The optimization space of a problem.
//!
//! [`ParameterSpace`] freezes the order of the fitted parameters when an
//! optimization starts and translates between optimization vectors (fitted
//! parameters only) and full parameter vectors (every parameter, fixed ones at
//! their current value, pinned ones at their bound).

use ndarray::{Array1, Array2};
use rand::Rng;

use crate::error::{FitError, Result};
use crate::parameters::Parameters;

/// Width used to draw random values along an infinite bound.
const UNBOUNDED_SPAN: f64 = 10.0;

/// Fitted-parameter layout with bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpace {
    names: Vec<String>,
    positions: Vec<usize>,
    template: Array1<f64>,
    lower: Array1<f64>,
    upper: Array1<f64>,
}

impl ParameterSpace {
    /// Capture the fitted parameters of a collection.
    pub fn from_parameters(params: &Parameters) -> Result<Self> {
        let mut names = Vec::new();
        let mut positions = Vec::new();
        let mut lower = Vec::new();
        let mut upper = Vec::new();
        let mut template = params.values();

        for (i, param) in params.iter().enumerate() {
            if !param.is_fitted() {
                if let Some((lo, hi)) = param.limits() {
                    if lo == hi {
                        template[i] = lo;
                    }
                }
                continue;
            }
            param.bounds().validate().map_err(FitError::Bounds)?;
            // `is_fitted` guarantees limits exist
            let (lo, hi) = param.limits().unwrap_or((f64::NEG_INFINITY, f64::INFINITY));
            names.push(param.name.clone());
            positions.push(i);
            lower.push(lo);
            upper.push(hi);
        }

        Ok(Self {
            names,
            positions,
            template,
            lower: Array1::from(lower),
            upper: Array1::from(upper),
        })
    }

    /// Number of fitted parameters
    pub fn dim(&self) -> usize {
        self.names.len()
    }

    /// Names of the fitted parameters, in vector order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of parameters in a full vector
    pub fn full_len(&self) -> usize {
        self.template.len()
    }

    /// `(lo, hi)` per fitted parameter
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.lower
            .iter()
            .zip(self.upper.iter())
            .map(|(&lo, &hi)| (lo, hi))
            .collect()
    }

    pub fn lower(&self) -> &Array1<f64> {
        &self.lower
    }

    pub fn upper(&self) -> &Array1<f64> {
        &self.upper
    }

    /// Spread of parameter `i` used to scale random steps.
    ///
    /// Infinite intervals fall back to the magnitude of the start value.
    pub fn scale(&self, i: usize) -> f64 {
        let (lo, hi) = (self.lower[i], self.upper[i]);
        if lo.is_finite() && hi.is_finite() {
            hi - lo
        } else {
            self.template[self.positions[i]].abs().max(1.0)
        }
    }

    /// Starting point: current values of the fitted parameters, clamped.
    pub fn start(&self) -> Array1<f64> {
        Array1::from_shape_fn(self.dim(), |i| {
            self.template[self.positions[i]].clamp(self.lower[i], self.upper[i])
        })
    }

    /// Expand an optimization vector into a full parameter vector.
    pub fn expand(&self, point: &Array1<f64>) -> Array1<f64> {
        let mut full = self.template.clone();
        for (&pos, &value) in self.positions.iter().zip(point.iter()) {
            full[pos] = value;
        }
        full
    }

    /// Expand every row of a batch.
    pub fn expand_batch(&self, batch: &Array2<f64>) -> Array2<f64> {
        let mut full = Array2::zeros((batch.nrows(), self.full_len()));
        for (mut row, point) in full.rows_mut().into_iter().zip(batch.rows()) {
            row.assign(&self.template);
            for (&pos, &value) in self.positions.iter().zip(point.iter()) {
                row[pos] = value;
            }
        }
        full
    }

    /// Check whether a point lies inside the bounds.
    pub fn contains(&self, point: &Array1<f64>) -> bool {
        point.len() == self.dim()
            && point
                .iter()
                .enumerate()
                .all(|(i, &v)| v >= self.lower[i] && v <= self.upper[i])
    }

    /// Reject a batch that holds a non-finite or out-of-bounds vector.
    pub fn check_batch(&self, batch: &Array2<f64>) -> Result<()> {
        if batch.ncols() != self.dim() {
            return Err(FitError::DimensionMismatch(format!(
                "Expected {} columns in batch, got {}",
                self.dim(),
                batch.ncols()
            )));
        }
        for (row, point) in batch.rows().into_iter().enumerate() {
            for (i, &value) in point.iter().enumerate() {
                let (lo, hi) = (self.lower[i], self.upper[i]);
                if value.is_nan() || value < lo || value > hi {
                    return Err(FitError::OutOfBounds {
                        row,
                        parameter: self.names[i].clone(),
                        value,
                        lo,
                        hi,
                    });
                }
            }
        }
        Ok(())
    }

    /// Clip a point into the bounds.
    pub fn clip(&self, point: &mut Array1<f64>) {
        for (i, value) in point.iter_mut().enumerate() {
            *value = value.clamp(self.lower[i], self.upper[i]);
        }
    }

    /// Fold a point back into the bounds by reflecting at each edge.
    ///
    /// Points that overshoot by more than a full width are clipped.
    pub fn reflect(&self, point: &mut Array1<f64>) {
        for (i, value) in point.iter_mut().enumerate() {
            let (lo, hi) = (self.lower[i], self.upper[i]);
            if *value < lo {
                *value = lo + (lo - *value);
            } else if *value > hi {
                *value = hi - (*value - hi);
            }
            *value = value.clamp(lo, hi);
        }
    }

    /// Draw a point uniformly within the bounds.
    ///
    /// Half-open and open intervals draw within a fixed span of their finite
    /// end, or of zero.
    pub fn random_point(&self, rng: &mut impl Rng) -> Array1<f64> {
        Array1::from_shape_fn(self.dim(), |i| {
            let (lo, hi) = (self.lower[i], self.upper[i]);
            if lo.is_finite() && hi.is_finite() {
                if lo < hi {
                    rng.gen_range(lo..hi)
                } else {
                    lo
                }
            } else if lo.is_finite() {
                lo + rng.gen::<f64>() * UNBOUNDED_SPAN
            } else if hi.is_finite() {
                hi - rng.gen::<f64>() * UNBOUNDED_SPAN
            } else {
                rng.gen_range(-UNBOUNDED_SPAN..UNBOUNDED_SPAN)
            }
        })
    }
}
