//! Test problems shared by the integration tests.

#![allow(dead_code)]

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use reflfit::{FitError, FitProblem, Parameters, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Convex bowl with its unique minimum at (3, 7).
///
/// Two free parameters on [0, 10]; extra fixed or degenerate parameters can
/// be added and must not change the minimum.
#[derive(Clone)]
pub struct Bowl {
    pub params: Parameters,
    /// Evaluations across every clone
    pub calls: Arc<AtomicUsize>,
    /// Evaluations beyond this count fail
    pub fail_after: Option<usize>,
}

impl Bowl {
    pub fn new() -> Self {
        let mut params = Parameters::new();
        params.add_param_with_bounds("x", 5.0, 0.0, 10.0).unwrap();
        params.add_param_with_bounds("y", 5.0, 0.0, 10.0).unwrap();
        Self {
            params,
            calls: Arc::new(AtomicUsize::new(0)),
            fail_after: None,
        }
    }

    pub fn failing_after(evaluations: usize) -> Self {
        Self {
            fail_after: Some(evaluations),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FitProblem for Bowl {
    fn parameters(&self) -> &Parameters {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    fn nllf(&self, values: &Array1<f64>) -> Result<f64> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after {
            if n >= limit {
                return Err(FitError::InvalidState("model diverged".to_string()));
            }
        }
        let x = values[self.params.position("x").unwrap_or(0)];
        let y = values[self.params.position("y").unwrap_or(1)];
        Ok((x - 3.0).powi(2) + (y - 7.0).powi(2))
    }

    fn degrees_of_freedom(&self) -> usize {
        8
    }

    fn kind(&self) -> &str {
        "bowl"
    }
}

/// Double well in one dimension with the deeper minimum near x = 2.
#[derive(Clone)]
pub struct DoubleWell {
    pub params: Parameters,
}

impl DoubleWell {
    pub fn new(start: f64) -> Self {
        let mut params = Parameters::new();
        params.add_param_with_bounds("x", start, -3.0, 3.0).unwrap();
        Self { params }
    }
}

impl FitProblem for DoubleWell {
    fn parameters(&self) -> &Parameters {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    fn nllf(&self, values: &Array1<f64>) -> Result<f64> {
        let x = values[0];
        Ok((x * x - 4.0).powi(2) - 3.0 * x)
    }

    fn degrees_of_freedom(&self) -> usize {
        1
    }
}

/// Straight line `y = a x + b` fitted to noisy data with unit errors.
///
/// Resynthesis replaces the data by the line at the current parameters plus
/// fresh Gaussian noise.
#[derive(Clone)]
pub struct NoisyLine {
    pub params: Parameters,
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    original: Array1<f64>,
    /// Resynthesis calls across every clone
    pub resyntheses: Arc<AtomicUsize>,
    /// Resynthesis call that fails
    pub fail_on: Option<usize>,
}

impl NoisyLine {
    pub fn new(seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let x = Array1::linspace(0.0, 9.0, 10);
        let y = x.mapv(|xi| 2.0 * xi + 1.0 + noise.sample(&mut rng));

        let mut params = Parameters::new();
        params.add_param_with_bounds("a", 1.5, -10.0, 10.0).unwrap();
        params.add_param_with_bounds("b", 0.0, -10.0, 10.0).unwrap();
        Self {
            params,
            x,
            original: y.clone(),
            y,
            resyntheses: Arc::new(AtomicUsize::new(0)),
            fail_on: None,
        }
    }

    pub fn with_failure_on(mut self, call: usize) -> Self {
        self.fail_on = Some(call);
        self
    }

    pub fn resyntheses(&self) -> usize {
        self.resyntheses.load(Ordering::SeqCst)
    }

    pub fn data_is_original(&self) -> bool {
        self.y == self.original
    }
}

impl FitProblem for NoisyLine {
    fn parameters(&self) -> &Parameters {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    fn nllf(&self, values: &Array1<f64>) -> Result<f64> {
        let (a, b) = (values[0], values[1]);
        let residuals = &self.y - &self.x.mapv(|xi| a * xi + b);
        Ok(0.5 * residuals.mapv(|r| r * r).sum())
    }

    fn degrees_of_freedom(&self) -> usize {
        self.x.len() - 2
    }

    fn kind(&self) -> &str {
        "line"
    }

    fn resynthesize(&mut self, rng: &mut StdRng) -> Result<()> {
        let call = self.resyntheses.fetch_add(1, Ordering::SeqCst);
        if self.fail_on == Some(call) {
            return Err(FitError::InvalidState("resampling failed".to_string()));
        }
        let a = self.params.get("a").map(|p| p.value()).unwrap_or(0.0);
        let b = self.params.get("b").map(|p| p.value()).unwrap_or(0.0);
        let noise = Normal::new(0.0, 1.0).map_err(|e| FitError::InvalidState(e.to_string()))?;
        self.y = self.x.mapv(|xi| a * xi + b + noise.sample(rng));
        Ok(())
    }

    fn restore_data(&mut self) {
        self.y = self.original.clone();
    }
}
