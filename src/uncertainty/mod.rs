//! # Uncertainty Calculation
//!
//! Error estimates for fitted parameters:
//!
//! - covariance from the Hessian of the negative log-likelihood at the best
//!   point, with standard errors and correlations
//! - the Gelman-Rubin mixing diagnostic for sampler traces
//! - mean and spread of resynthesis results

mod covariance;
mod diagnostics;

pub use covariance::{
    calculate_correlation, estimate_covariance, hessian, standard_errors_from_covariance,
};
pub use diagnostics::{gelman_rubin, mean_std};
