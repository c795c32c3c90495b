//! Sample statistics for posterior traces and resynthesis results.

use ndarray::{Array1, Array2, Axis};

use crate::error::{FitError, Result};
use crate::optimizer::PosteriorTrace;

/// Gelman-Rubin potential scale reduction factor per parameter.
///
/// Values close to 1 indicate that the chains have mixed. Needs at least two
/// chains with at least two draws each.
pub fn gelman_rubin(trace: &PosteriorTrace) -> Result<Array1<f64>> {
    let (n, m, dim) = trace.points.dim();
    if m < 2 || n < 2 {
        return Err(FitError::InvalidState(format!(
            "R-hat needs at least 2 chains and 2 draws, got {} chains and {} draws",
            m, n
        )));
    }
    let n_f = n as f64;

    let mut r_hat = Array1::zeros(dim);
    for p in 0..dim {
        // (draw, chain) samples of one parameter
        let samples = trace.points.index_axis(Axis(2), p);
        let chain_means = samples.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(m));
        let chain_vars = samples.var_axis(Axis(0), 1.0);

        let within = chain_vars.mean().unwrap_or(0.0);
        let grand_mean = chain_means.mean().unwrap_or(0.0);
        let between = n_f * chain_means.mapv(|v| (v - grand_mean).powi(2)).sum() / (m - 1) as f64;
        let pooled = (n_f - 1.0) / n_f * within + between / n_f;

        r_hat[p] = if within > 0.0 {
            (pooled / within).sqrt()
        } else if between > 0.0 {
            f64::INFINITY
        } else {
            1.0
        };
    }
    Ok(r_hat)
}

/// Per-column mean and sample standard deviation of a set of vectors.
///
/// One row per sample. With fewer than two rows the deviation is zero.
pub fn mean_std(samples: &Array2<f64>) -> (Array1<f64>, Array1<f64>) {
    let dim = samples.ncols();
    if samples.nrows() == 0 {
        return (Array1::from_elem(dim, f64::NAN), Array1::zeros(dim));
    }
    let mean = samples
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(dim));
    let std = if samples.nrows() > 1 {
        samples.std_axis(Axis(0), 1.0)
    } else {
        Array1::zeros(dim)
    };
    (mean, std)
}
