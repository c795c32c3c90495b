//! Starting populations.

use nalgebra::DMatrix;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::{FitError, Result};
use crate::parameters::ParameterSpace;

/// How the starting population is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitMethod {
    /// Uniform within the bounds
    #[serde(rename = "random")]
    Random,

    /// Latin hypercube: one individual per stratum of every parameter
    #[serde(rename = "lhs")]
    Lhs,

    /// Gaussian around the start point with a covariance estimate
    #[serde(rename = "cov")]
    Covariance,
}

impl InitMethod {
    pub fn name(self) -> &'static str {
        match self {
            InitMethod::Random => "random",
            InitMethod::Lhs => "lhs",
            InitMethod::Covariance => "cov",
        }
    }
}

impl fmt::Display for InitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InitMethod {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "random" => Ok(InitMethod::Random),
            "lhs" => Ok(InitMethod::Lhs),
            "cov" | "covariance" => Ok(InitMethod::Covariance),
            other => Err(FitError::invalid_option("init", other, "lhs|cov|random")),
        }
    }
}

/// Generate `n` optimization vectors, one per row.
///
/// The first row is always the start point, so the current parameter values
/// are never lost from the population. Every row lies within the bounds.
///
/// # Arguments
///
/// * `method` - Sampling method for the remaining rows
/// * `n` - Population size
/// * `start` - Start point (current fitted values)
/// * `space` - Bounds of the optimization vector
/// * `covariance` - Covariance for [`InitMethod::Covariance`]; a diagonal
///   guess from the bounds is used when absent
/// * `rng` - Random number generator
pub fn generate(
    method: InitMethod,
    n: usize,
    start: &Array1<f64>,
    space: &ParameterSpace,
    covariance: Option<&Array2<f64>>,
    rng: &mut StdRng,
) -> Result<Array2<f64>> {
    let dim = space.dim();
    if start.len() != dim {
        return Err(FitError::DimensionMismatch(format!(
            "Expected start point of length {}, got {}",
            dim,
            start.len()
        )));
    }

    let mut population = match method {
        InitMethod::Random => {
            let mut population = Array2::zeros((n, dim));
            for mut row in population.rows_mut() {
                row.assign(&space.random_point(rng));
            }
            population
        }
        InitMethod::Lhs => latin_hypercube(n, space, rng),
        InitMethod::Covariance => gaussian(n, start, space, covariance, rng)?,
    };

    if n > 0 {
        let mut first = start.clone();
        space.clip(&mut first);
        population.row_mut(0).assign(&first);
    }
    Ok(population)
}

fn latin_hypercube(n: usize, space: &ParameterSpace, rng: &mut StdRng) -> Array2<f64> {
    let dim = space.dim();
    let mut population = Array2::zeros((n, dim));
    for j in 0..dim {
        let (lo, hi) = (space.lower()[j], space.upper()[j]);
        let mut strata: Vec<usize> = (0..n).collect();
        strata.shuffle(rng);
        for (i, &stratum) in strata.iter().enumerate() {
            population[[i, j]] = if lo.is_finite() && hi.is_finite() {
                let u = (stratum as f64 + rng.gen::<f64>()) / n as f64;
                (lo + u * (hi - lo)).clamp(lo, hi)
            } else {
                space.random_point(rng)[j]
            };
        }
    }
    population
}

fn gaussian(
    n: usize,
    start: &Array1<f64>,
    space: &ParameterSpace,
    covariance: Option<&Array2<f64>>,
    rng: &mut StdRng,
) -> Result<Array2<f64>> {
    let dim = space.dim();
    let guess = || DMatrix::from_fn(dim, dim, |i, j| {
        if i == j {
            (space.scale(i) / 10.0).powi(2)
        } else {
            0.0
        }
    });

    let cov = match covariance {
        Some(c) if c.nrows() == dim && c.ncols() == dim => {
            DMatrix::from_fn(dim, dim, |i, j| c[[i, j]])
        }
        Some(c) => {
            return Err(FitError::DimensionMismatch(format!(
                "Expected {}x{} covariance, got {}x{}",
                dim,
                dim,
                c.nrows(),
                c.ncols()
            )))
        }
        None => guess(),
    };
    let factor = match cov.clone().cholesky() {
        Some(chol) => chol.l(),
        None => {
            debug!("covariance is not positive definite; seeding from bounds");
            guess()
                .cholesky()
                .map(|chol| chol.l())
                .unwrap_or_else(|| DMatrix::identity(dim, dim))
        }
    };

    let mut population = Array2::zeros((n, dim));
    for mut row in population.rows_mut() {
        let z = nalgebra::DVector::from_fn(dim, |_, _| rng.sample::<f64, _>(StandardNormal));
        let offset = &factor * z;
        let mut point = Array1::from_shape_fn(dim, |i| start[i] + offset[i]);
        space.clip(&mut point);
        row.assign(&point);
    }
    Ok(population)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::Parameters;
    use ndarray::array;
    use rand::SeedableRng;

    fn space() -> ParameterSpace {
        let mut params = Parameters::new();
        params.add_param_with_bounds("a", 2.0, 0.0, 10.0).unwrap();
        params.add_param_with_bounds("b", 5.0, -1.0, 1.0).unwrap();
        ParameterSpace::from_parameters(&params).unwrap()
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("lhs".parse::<InitMethod>().unwrap(), InitMethod::Lhs);
        assert_eq!("cov".parse::<InitMethod>().unwrap(), InitMethod::Covariance);
        assert!("sobol".parse::<InitMethod>().is_err());
    }

    #[test]
    fn test_first_row_is_start_and_all_rows_in_bounds() {
        let space = space();
        let mut rng = StdRng::seed_from_u64(11);
        for method in [InitMethod::Random, InitMethod::Lhs, InitMethod::Covariance] {
            let pop = generate(method, 12, &array![2.0, 0.5], &space, None, &mut rng).unwrap();
            assert_eq!(pop.dim(), (12, 2));
            assert_eq!(pop.row(0).to_vec(), vec![2.0, 0.5]);
            for row in pop.rows() {
                assert!(space.contains(&row.to_owned()));
            }
        }
    }

    #[test]
    fn test_lhs_fills_every_stratum() {
        let space = space();
        let mut rng = StdRng::seed_from_u64(3);
        let pop = latin_hypercube(10, &space, &mut rng);
        let mut strata: Vec<usize> = pop.column(0).iter().map(|v| (v / 1.0) as usize).collect();
        strata.sort_unstable();
        assert_eq!(strata, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_covariance_shape_is_checked() {
        let space = space();
        let mut rng = StdRng::seed_from_u64(3);
        let bad = Array2::eye(3);
        assert!(generate(
            InitMethod::Covariance,
            4,
            &array![1.0, 0.0],
            &space,
            Some(&bad),
            &mut rng
        )
        .is_err());
    }
}
