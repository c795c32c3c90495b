//! Population MCMC sampler with differential proposals.
//!
//! K chains advance together. Each step proposes a new state for every chain
//! from the difference of two other chains' current states, restricted to a
//! random subset of dimensions, and evaluates all proposals as one batch.
//! Proposals are accepted by the Metropolis rule on the negative
//! log-likelihood. During burn-in the probability of each crossover ratio is
//! adapted towards the ratios that produce the largest normalized jumps;
//! after burn-in the chain states are recorded once per step.

use ndarray::{Array1, Array2};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::debug;

use super::{crossover_mask, pick_distinct, update_best, PosteriorTrace, Strategy, StrategyKind};
use crate::error::{FitError, Result};
use crate::mapper::Evaluator;

/// Smallest number of chains that leaves two donors for every chain.
const MIN_CHAINS: usize = 3;

/// Number of crossover ratios; ratio `m` is `(m + 1) / N_CR`.
const N_CR: usize = 3;

/// Probability of a unit jump that lets chains hop between modes.
const JUMP_PROBABILITY: f64 = 0.2;

/// Relative scale of the small isotropic noise added to every proposal.
const NOISE: f64 = 1e-6;

/// DREAM-style population sampler.
#[derive(Debug, Clone)]
pub struct Dream {
    chains: usize,
    burn: usize,
    draws: usize,

    points: Array2<f64>,
    values: Array1<f64>,
    best: Option<(Array1<f64>, f64)>,
    step: usize,

    cr_probability: [f64; N_CR],
    cr_jump: [f64; N_CR],
    cr_count: [usize; N_CR],

    proposed: usize,
    accepted: usize,
    trace: PosteriorTrace,
}

impl Dream {
    /// Sampler with `chains` chains, `burn` discarded steps and `draws`
    /// retained steps.
    pub fn new(chains: usize, burn: usize, draws: usize) -> Self {
        Self {
            chains,
            burn,
            draws,
            points: Array2::zeros((0, 0)),
            values: Array1::zeros(0),
            best: None,
            step: 0,
            cr_probability: [1.0 / N_CR as f64; N_CR],
            cr_jump: [0.0; N_CR],
            cr_count: [0; N_CR],
            proposed: 0,
            accepted: 0,
            trace: PosteriorTrace::new(0, 0, 0),
        }
    }

    /// Current probability of each crossover ratio
    pub fn crossover_probabilities(&self) -> [f64; N_CR] {
        self.cr_probability
    }

    /// Fraction of proposals accepted so far
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }

    fn adapt_crossover(&mut self) {
        let rates: Vec<f64> = (0..N_CR)
            .map(|m| {
                if self.cr_count[m] == 0 {
                    0.0
                } else {
                    self.cr_jump[m] / self.cr_count[m] as f64
                }
            })
            .collect();
        let total: f64 = rates.iter().sum();
        if total > 0.0 && total.is_finite() {
            for m in 0..N_CR {
                // Keep every ratio alive
                self.cr_probability[m] = (rates[m] / total).max(0.01);
            }
            let norm: f64 = self.cr_probability.iter().sum();
            for p in self.cr_probability.iter_mut() {
                *p /= norm;
            }
        }
    }
}

impl Strategy for Dream {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Dream
    }

    fn population_size(&self, _dim: usize) -> usize {
        self.chains.max(MIN_CHAINS)
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
        if population.nrows() < MIN_CHAINS {
            return Err(FitError::invalid_option(
                "pop",
                population.nrows(),
                format!("at least {} chains", MIN_CHAINS),
            ));
        }
        self.values = evaluator.evaluate(&population)?;
        self.trace = PosteriorTrace::new(self.draws, population.nrows(), population.ncols());
        self.points = population;
        self.best = None;
        self.step = 0;
        self.proposed = 0;
        self.accepted = 0;
        self.cr_probability = [1.0 / N_CR as f64; N_CR];
        self.cr_jump = [0.0; N_CR];
        self.cr_count = [0; N_CR];
        update_best(&mut self.best, &self.points, &self.values);
        Ok(())
    }

    fn step(&mut self, evaluator: &mut Evaluator<'_>, rng: &mut StdRng) -> Result<()> {
        let (n_chains, dim) = self.points.dim();
        let space = evaluator.space();
        let spread = Array1::from_shape_fn(dim, |j| {
            let column = self.points.column(j);
            let mean = column.mean().unwrap_or(0.0);
            let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n_chains as f64;
            if var > 0.0 {
                var.sqrt()
            } else {
                space.scale(j)
            }
        });

        let cr_choice = WeightedIndex::new(self.cr_probability)
            .map_err(|e| FitError::InvalidState(format!("crossover weights: {}", e)))?;

        let mut proposals = self.points.clone();
        let mut cr_used = Vec::with_capacity(n_chains);
        for i in 0..n_chains {
            let m = cr_choice.sample(rng);
            cr_used.push(m);
            let cr = (m + 1) as f64 / N_CR as f64;
            let mask = crossover_mask(dim, cr, rng);
            let d_eff = mask.iter().filter(|&&b| b).count().max(1);
            let gamma = if rng.gen::<f64>() < JUMP_PROBABILITY {
                1.0
            } else {
                2.38 / (2.0 * d_eff as f64).sqrt()
            };

            let r = pick_distinct(n_chains, 2, &[i], rng);
            let mut proposal = self.points.row(i).to_owned();
            for j in 0..dim {
                if mask[j] {
                    let e: f64 = rng.gen_range(-0.1..0.1);
                    let noise: f64 = rng.sample(StandardNormal);
                    proposal[j] += (1.0 + e) * gamma * (self.points[[r[0], j]] - self.points[[r[1], j]])
                        + NOISE * space.scale(j) * noise;
                }
            }
            space.reflect(&mut proposal);
            proposals.row_mut(i).assign(&proposal);
        }

        let proposal_values = evaluator.evaluate(&proposals)?;
        update_best(&mut self.best, &proposals, &proposal_values);

        let burning = self.step < self.burn;
        for i in 0..n_chains {
            self.proposed += 1;
            let delta = self.values[i] - proposal_values[i];
            let accept = proposal_values[i].is_finite()
                && (delta >= 0.0 || rng.gen::<f64>().ln() < delta);
            if burning {
                self.cr_count[cr_used[i]] += 1;
            }
            if accept {
                if burning {
                    let jump: f64 = (0..dim)
                        .map(|j| ((proposals[[i, j]] - self.points[[i, j]]) / spread[j]).powi(2))
                        .sum();
                    self.cr_jump[cr_used[i]] += jump;
                }
                self.points.row_mut(i).assign(&proposals.row(i));
                self.values[i] = proposal_values[i];
                self.accepted += 1;
            }
        }

        if burning {
            self.adapt_crossover();
        } else {
            let draw = self.step - self.burn;
            if draw < self.draws {
                self.trace
                    .points
                    .index_axis_mut(ndarray::Axis(0), draw)
                    .assign(&self.points);
                self.trace
                    .nllf
                    .row_mut(draw)
                    .assign(&self.values);
            }
        }
        self.step += 1;
        debug!(
            "dream step {} ({}): acceptance {:.3}",
            self.step,
            if burning { "burn" } else { "draw" },
            self.acceptance_rate()
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
            trace.points = trace
                .points
                .slice(ndarray::s![..recorded, .., ..])
                .to_owned();
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
    use crate::optimizer::{init, InitMethod};
    use crate::parameters::{ParameterSpace, Parameters};
    use crate::problem::FitProblem;
    use crate::progress::CancelToken;
    use rand::SeedableRng;

    #[derive(Clone)]
    struct Gaussian {
        params: Parameters,
    }

    impl FitProblem for Gaussian {
        fn parameters(&self) -> &Parameters {
            &self.params
        }

        fn parameters_mut(&mut self) -> &mut Parameters {
            &mut self.params
        }

        fn nllf(&self, v: &Array1<f64>) -> Result<f64> {
            Ok(0.5 * ((v[0] - 1.0).powi(2) + (v[1] + 2.0).powi(2)))
        }

        fn degrees_of_freedom(&self) -> usize {
            1
        }
    }

    fn sample(chains: usize, burn: usize, draws: usize, seed: u64) -> (Dream, usize) {
        let mut params = Parameters::new();
        params.add_param_with_bounds("a", 0.0, -10.0, 10.0).unwrap();
        params.add_param_with_bounds("b", 0.0, -10.0, 10.0).unwrap();
        let problem = Gaussian { params };
        let space = ParameterSpace::from_parameters(problem.parameters()).unwrap();
        let mut mapper = SerialMapper::new(problem, RetryPolicy::default());
        let mut evaluator = Evaluator::new(&space, &mut mapper, CancelToken::new());

        let mut rng = StdRng::seed_from_u64(seed);
        let mut dream = Dream::new(chains, burn, draws);
        let n = dream.population_size(space.dim());
        let population =
            init::generate(InitMethod::Lhs, n, &space.start(), &space, None, &mut rng).unwrap();
        dream.initialize(population, &mut evaluator, &mut rng).unwrap();
        for _ in 0..dream.planned_steps() {
            dream.step(&mut evaluator, &mut rng).unwrap();
        }
        let batches = evaluator.batches();
        (dream, batches)
    }

    #[test]
    fn test_exact_number_of_draws() {
        let (dream, batches) = sample(5, 20, 30, 1);
        let trace = dream.posterior().unwrap();
        assert_eq!(trace.draws(), 30);
        assert_eq!(trace.chains(), 5);
        assert_eq!(trace.dim(), 2);
        assert_eq!(batches, 1 + 50);
    }

    #[test]
    fn test_zero_draws_keeps_nothing() {
        let (dream, _) = sample(4, 10, 0, 2);
        let trace = dream.posterior().unwrap();
        assert_eq!(trace.draws(), 0);
        assert!(dream.best().is_some());
    }

    #[test]
    fn test_sampler_finds_the_mode() {
        let (dream, _) = sample(8, 300, 300, 3);
        let trace = dream.posterior().unwrap();
        let flat = trace.flatten();
        let mean_a = flat.column(0).mean().unwrap();
        let mean_b = flat.column(1).mean().unwrap();
        assert!((mean_a - 1.0).abs() < 0.5, "mean a = {}", mean_a);
        assert!((mean_b + 2.0).abs() < 0.5, "mean b = {}", mean_b);
        assert!(trace.acceptance_rate > 0.0 && trace.acceptance_rate < 1.0);

        let p = dream.crossover_probabilities();
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_chain_minimum_is_enforced() {
        assert_eq!(Dream::new(1, 0, 5).population_size(4), MIN_CHAINS);
    }
}
