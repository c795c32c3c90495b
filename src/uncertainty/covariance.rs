//! # Covariance Matrix Calculations
//!
//! The covariance of the fitted parameters is estimated as the inverse of the
//! Hessian of the negative log-likelihood at the best point. The Hessian is
//! built from central differences; every probe point is evaluated in a
//! single batch so the estimate runs on whatever transport the fit used.

use nalgebra::DMatrix;
use ndarray::{Array1, Array2};
use tracing::debug;

use crate::error::{FitError, Result};
use crate::mapper::Evaluator;
use crate::parameters::ParameterSpace;

/// Finite-difference step as a fraction of each parameter's spread.
const RELATIVE_STEP: f64 = 1e-3;

/// Probe offsets for a central-difference Hessian around `point`.
///
/// Returns the probe batch and the step used per parameter. The center is
/// moved inward where needed so that every probe stays within the bounds.
fn hessian_probes(space: &ParameterSpace, point: &Array1<f64>) -> (Array2<f64>, Array1<f64>) {
    let dim = space.dim();
    let mut center = point.clone();
    let mut h = Array1::zeros(dim);
    for i in 0..dim {
        let (lo, hi) = (space.lower()[i], space.upper()[i]);
        let mut step = RELATIVE_STEP * space.scale(i);
        if (hi - lo).is_finite() {
            step = step.min((hi - lo) / 4.0);
        }
        h[i] = step;
        center[i] = center[i].clamp(lo + step, hi - step);
    }

    let n_probes = 1 + 2 * dim + 2 * dim * dim.saturating_sub(1);
    let mut probes = Array2::zeros((n_probes, dim));
    for mut row in probes.rows_mut() {
        row.assign(&center);
    }

    let mut k = 1;
    for i in 0..dim {
        probes[[k, i]] += h[i];
        probes[[k + 1, i]] -= h[i];
        k += 2;
    }
    for i in 0..dim {
        for j in (i + 1)..dim {
            for (si, sj) in [(1.0, 1.0), (1.0, -1.0), (-1.0, 1.0), (-1.0, -1.0)] {
                probes[[k, i]] += si * h[i];
                probes[[k, j]] += sj * h[j];
                k += 1;
            }
        }
    }
    (probes, h)
}

/// Hessian of the objective at `point`, in one batch.
pub fn hessian(evaluator: &mut Evaluator<'_>, point: &Array1<f64>) -> Result<Array2<f64>> {
    let dim = evaluator.space().dim();
    if point.len() != dim {
        return Err(FitError::DimensionMismatch(format!(
            "Expected point of length {}, got {}",
            dim,
            point.len()
        )));
    }
    let (probes, h) = hessian_probes(evaluator.space(), point);
    let f = evaluator.evaluate(&probes)?;
    if let Some(bad) = f.iter().position(|v| !v.is_finite()) {
        return Err(FitError::LinearAlgebra(format!(
            "objective is not finite at Hessian probe {}",
            bad
        )));
    }

    let f0 = f[0];
    let mut hess = Array2::zeros((dim, dim));
    for i in 0..dim {
        let (plus, minus) = (f[1 + 2 * i], f[2 + 2 * i]);
        hess[[i, i]] = (plus - 2.0 * f0 + minus) / (h[i] * h[i]);
    }
    let mut k = 1 + 2 * dim;
    for i in 0..dim {
        for j in (i + 1)..dim {
            let (pp, pm, mp, mm) = (f[k], f[k + 1], f[k + 2], f[k + 3]);
            let value = (pp - pm - mp + mm) / (4.0 * h[i] * h[j]);
            hess[[i, j]] = value;
            hess[[j, i]] = value;
            k += 4;
        }
    }
    Ok(hess)
}

/// Covariance matrix of the fitted parameters at `point`.
///
/// # Arguments
///
/// * `evaluator` - Evaluator over the problem's optimization space
/// * `point` - Best-fit optimization vector
///
/// # Returns
///
/// * The inverse Hessian of the negative log-likelihood, or an error when
///   the Hessian is singular
pub fn estimate_covariance(
    evaluator: &mut Evaluator<'_>,
    point: &Array1<f64>,
) -> Result<Array2<f64>> {
    let hess = hessian(evaluator, point)?;
    let dim = hess.nrows();
    let matrix = DMatrix::from_fn(dim, dim, |i, j| hess[[i, j]]);
    let inverse = matrix.try_inverse().ok_or_else(|| {
        FitError::LinearAlgebra("Hessian is singular; covariance is undefined".to_string())
    })?;
    debug!("estimated {}x{} covariance", dim, dim);
    Ok(Array2::from_shape_fn((dim, dim), |(i, j)| inverse[(i, j)]))
}

/// Calculate correlation matrix from covariance matrix.
///
/// The correlation matrix is calculated as:
///   correl[i,j] = covar[i,j] / sqrt(covar[i,i] * covar[j,j])
pub fn calculate_correlation(covar: &Array2<f64>) -> Array2<f64> {
    let n = covar.nrows();
    Array2::from_shape_fn((n, n), |(i, j)| {
        if i == j {
            1.0
        } else {
            let denom = (covar[[i, i]] * covar[[j, j]]).sqrt();
            if denom > 0.0 {
                covar[[i, j]] / denom
            } else {
                0.0
            }
        }
    })
}

/// Extract standard errors from the covariance matrix.
///
/// Negative diagonal entries (a saddle rather than a minimum) give NaN.
pub fn standard_errors_from_covariance(covar: &Array2<f64>) -> Array1<f64> {
    covar.diag().mapv(|v| if v >= 0.0 { v.sqrt() } else { f64::NAN })
}
