//! Parallel tempering.
//!
//! One replica per temperature on a geometric ladder between `t_min` and
//! `t_max`. Every step moves all replicas with a Gaussian Metropolis proposal
//! (one batch for the whole ladder), then proposes exchanges between
//! adjacent temperatures, alternating between even and odd pairs. After
//! burn-in the coldest replica is recorded once per step.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::debug;

use super::{crossover_mask, update_best, PosteriorTrace, Strategy, StrategyKind};
use crate::error::{FitError, Result};
use crate::mapper::Evaluator;

/// Initial proposal width as a fraction of each parameter's spread.
const INITIAL_WIDTH: f64 = 0.1;

/// Acceptance rate the burn-in adaptation aims for.
const TARGET_ACCEPTANCE: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct ParallelTempering {
    temperatures: Vec<f64>,
    burn: usize,
    draws: usize,
    crossover: f64,

    points: Array2<f64>,
    values: Array1<f64>,
    width: Vec<f64>,
    best: Option<(Array1<f64>, f64)>,
    step: usize,

    accepted: Vec<usize>,
    proposed: usize,
    swaps_accepted: usize,
    swaps_proposed: usize,
    trace: PosteriorTrace,
}

impl ParallelTempering {
    /// Ladder of `n_temps` geometrically spaced temperatures.
    pub fn new(n_temps: usize, t_min: f64, t_max: f64) -> Self {
        let n = n_temps.max(1);
        let temperatures = if n == 1 {
            vec![t_min]
        } else {
            let ratio = (t_max / t_min).powf(1.0 / (n - 1) as f64);
            (0..n).map(|k| t_min * ratio.powi(k as i32)).collect()
        };
        Self {
            temperatures,
            burn: 0,
            draws: 1000,
            crossover: 0.9,
            points: Array2::zeros((0, 0)),
            values: Array1::zeros(0),
            width: Vec::new(),
            best: None,
            step: 0,
            accepted: Vec::new(),
            proposed: 0,
            swaps_accepted: 0,
            swaps_proposed: 0,
            trace: PosteriorTrace::new(0, 0, 0),
        }
    }

    /// Set burn-in and retained steps.
    pub fn with_schedule(mut self, burn: usize, draws: usize) -> Self {
        self.burn = burn;
        self.draws = draws;
        self
    }

    /// Probability that a dimension is moved by a proposal.
    pub fn with_crossover(mut self, crossover: f64) -> Self {
        self.crossover = crossover;
        self
    }

    pub fn temperatures(&self) -> &[f64] {
        &self.temperatures
    }

    /// Fraction of exchange proposals accepted so far
    pub fn swap_rate(&self) -> f64 {
        if self.swaps_proposed == 0 {
            0.0
        } else {
            self.swaps_accepted as f64 / self.swaps_proposed as f64
        }
    }

    fn acceptance_rate(&self) -> f64 {
        let total = self.proposed * self.temperatures.len();
        if total == 0 {
            0.0
        } else {
            self.accepted.iter().sum::<usize>() as f64 / total as f64
        }
    }

    fn exchange(&mut self, rng: &mut StdRng) {
        let n = self.temperatures.len();
        let mut k = self.step % 2;
        while k + 1 < n {
            self.swaps_proposed += 1;
            let beta_k = 1.0 / self.temperatures[k];
            let beta_next = 1.0 / self.temperatures[k + 1];
            let log_ratio = (beta_k - beta_next) * (self.values[k] - self.values[k + 1]);
            if log_ratio >= 0.0 || rng.gen::<f64>().ln() < log_ratio {
                let (a, b) = (self.points.row(k).to_owned(), self.points.row(k + 1).to_owned());
                self.points.row_mut(k).assign(&b);
                self.points.row_mut(k + 1).assign(&a);
                self.values.swap(k, k + 1);
                self.swaps_accepted += 1;
            }
            k += 2;
        }
    }
}

impl Strategy for ParallelTempering {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Tempering
    }

    fn population_size(&self, _dim: usize) -> usize {
        self.temperatures.len()
    }

    fn planned_steps(&self) -> usize {
        self.burn + self.draws
    }

    fn initialize(
        &mut self,
        population: Array2<f64>,
        evaluator: &mut Evaluator<'_>,
        _rng: &mut StdRng,
    ) -> Result<()> {
        let n = self.temperatures.len();
        if population.nrows() != n {
            return Err(FitError::DimensionMismatch(format!(
                "Expected {} replicas, got {}",
                n,
                population.nrows()
            )));
        }
        self.values = evaluator.evaluate(&population)?;
        self.width = vec![INITIAL_WIDTH; n];
        self.accepted = vec![0; n];
        self.proposed = 0;
        self.swaps_accepted = 0;
        self.swaps_proposed = 0;
        self.step = 0;
        self.trace = PosteriorTrace::new(self.draws, 1, population.ncols());
        self.best = None;
        update_best(&mut self.best, &population, &self.values);
        self.points = population;
        Ok(())
    }

    fn step(&mut self, evaluator: &mut Evaluator<'_>, rng: &mut StdRng) -> Result<()> {
        let (n, dim) = self.points.dim();
        let space = evaluator.space();

        let mut proposals = self.points.clone();
        for k in 0..n {
            let width = self.width[k] * self.temperatures[k].sqrt();
            let mask = crossover_mask(dim, self.crossover, rng);
            let mut proposal = self.points.row(k).to_owned();
            for j in 0..dim {
                if mask[j] {
                    let z: f64 = rng.sample(StandardNormal);
                    proposal[j] += width * space.scale(j) * z;
                }
            }
            space.reflect(&mut proposal);
            proposals.row_mut(k).assign(&proposal);
        }

        let proposal_values = evaluator.evaluate(&proposals)?;
        update_best(&mut self.best, &proposals, &proposal_values);

        let burning = self.step < self.burn;
        self.proposed += 1;
        for k in 0..n {
            let delta = proposal_values[k] - self.values[k];
            let accept = proposal_values[k].is_finite()
                && (delta <= 0.0 || rng.gen::<f64>().ln() < -delta / self.temperatures[k]);
            if accept {
                self.points.row_mut(k).assign(&proposals.row(k));
                self.values[k] = proposal_values[k];
                self.accepted[k] += 1;
            }
            if burning {
                let rate = self.accepted[k] as f64 / self.proposed as f64;
                self.width[k] *= if rate > TARGET_ACCEPTANCE { 1.1 } else { 0.9 };
                self.width[k] = self.width[k].clamp(1e-6, 1.0);
            }
        }

        self.exchange(rng);

        if !burning {
            let draw = self.step - self.burn;
            if draw < self.draws {
                self.trace
                    .points
                    .index_axis_mut(Axis(0), draw)
                    .row_mut(0)
                    .assign(&self.points.row(0));
                self.trace.nllf[[draw, 0]] = self.values[0];
            }
        }
        self.step += 1;
        debug!(
            "pt step {}: acceptance {:.3}, swap rate {:.3}",
            self.step,
            self.acceptance_rate(),
            self.swap_rate()
        );
        Ok(())
    }

    fn best(&self) -> Option<(Array1<f64>, f64)> {
        self.best.clone()
    }

    fn posterior(&self) -> Option<PosteriorTrace> {
        let recorded = self.step.saturating_sub(self.burn).min(self.draws);
        let mut trace = self.trace.clone();
        if recorded < self.draws {
            trace.points = trace.points.slice(ndarray::s![..recorded, .., ..]).to_owned();
            trace.nllf = trace.nllf.slice(ndarray::s![..recorded, ..]).to_owned();
        }
        trace.acceptance_rate = self.acceptance_rate();
        Some(trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{RetryPolicy, SerialMapper};
    use crate::optimizer::{minimize, InitMethod};
    use crate::parameters::{ParameterSpace, Parameters};
    use crate::problem::FitProblem;
    use crate::progress::CancelToken;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    #[derive(Clone)]
    struct DoubleWell {
        params: Parameters,
    }

    impl FitProblem for DoubleWell {
        fn parameters(&self) -> &Parameters {
            &self.params
        }

        fn parameters_mut(&mut self) -> &mut Parameters {
            &mut self.params
        }

        // Shallow well at -2, deep well at +2
        fn nllf(&self, v: &Array1<f64>) -> Result<f64> {
            let x = v[0];
            Ok(5.0 * (x * x - 4.0).powi(2) / 16.0 - 0.5 * x)
        }

        fn degrees_of_freedom(&self) -> usize {
            1
        }
    }

    #[test]
    fn test_geometric_ladder() {
        let pt = ParallelTempering::new(3, 0.1, 10.0);
        assert_eq!(pt.temperatures().len(), 3);
        assert_relative_eq!(pt.temperatures()[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(pt.temperatures()[2], 10.0, epsilon = 1e-12);
        assert_eq!(ParallelTempering::new(1, 0.5, 2.0).temperatures(), &[0.5]);
    }

    #[test]
    fn test_tempering_escapes_shallow_well() {
        let mut params = Parameters::new();
        params.add_param_with_bounds("x", -2.0, -4.0, 4.0).unwrap();
        let problem = DoubleWell { params };
        let space = ParameterSpace::from_parameters(problem.parameters()).unwrap();
        let mut mapper = SerialMapper::new(problem, RetryPolicy::default());
        let mut evaluator = Evaluator::new(&space, &mut mapper, CancelToken::new());

        let mut pt = ParallelTempering::new(6, 0.05, 20.0).with_schedule(100, 400);
        let mut rng = StdRng::seed_from_u64(4);
        let (point, _) =
            minimize(&mut pt, &mut evaluator, InitMethod::Lhs, None, &mut rng).unwrap();
        assert!((point[0] - 2.0).abs() < 0.2, "x = {}", point[0]);
        assert!(pt.swap_rate() > 0.0);

        let trace = pt.posterior().unwrap();
        assert_eq!(trace.draws(), 400);
        assert_eq!(trace.chains(), 1);
    }
}
