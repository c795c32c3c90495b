//! Random-lines local search.
//!
//! Every individual probes one point along a random line through itself,
//! the line direction being the difference of two other individuals. The
//! step length along the line is per individual: it grows after a success
//! and shrinks after a failure, so the population settles into quick local
//! refinement.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::debug;

use super::{crossover_mask, pick_distinct, update_best, Strategy, StrategyKind};
use crate::error::{FitError, Result};
use crate::mapper::Evaluator;

const MIN_POPULATION: usize = 4;

/// Offsets along the line, in units of the current step length.
const OFFSETS: [f64; 4] = [-1.0, -0.5, 0.5, 1.0];

const MAX_STEP: f64 = 4.0;
const MIN_STEP: f64 = 1e-3;

#[derive(Debug, Clone)]
pub struct RandomLines {
    population_size: usize,
    generations: usize,
    crossover: f64,

    population: Array2<f64>,
    values: Array1<f64>,
    step_length: Vec<f64>,
    best: Option<(Array1<f64>, f64)>,
}

impl RandomLines {
    pub fn new(population_size: usize, generations: usize) -> Self {
        Self {
            population_size,
            generations,
            crossover: 0.9,
            population: Array2::zeros((0, 0)),
            values: Array1::zeros(0),
            step_length: Vec::new(),
            best: None,
        }
    }

    /// Probability that a dimension takes part in a line.
    pub fn with_crossover(mut self, crossover: f64) -> Self {
        self.crossover = crossover;
        self
    }
}

impl Strategy for RandomLines {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RandomLines
    }

    fn population_size(&self, _dim: usize) -> usize {
        self.population_size.max(MIN_POPULATION)
    }

    fn planned_steps(&self) -> usize {
        self.generations
    }

    fn initialize(
        &mut self,
        population: Array2<f64>,
        evaluator: &mut Evaluator<'_>,
        _rng: &mut StdRng,
    ) -> Result<()> {
        if population.nrows() < MIN_POPULATION {
            return Err(FitError::invalid_option(
                "pop",
                population.nrows(),
                format!("at least {} individuals", MIN_POPULATION),
            ));
        }
        self.values = evaluator.evaluate(&population)?;
        self.step_length = vec![1.0; population.nrows()];
        self.population = population;
        self.best = None;
        update_best(&mut self.best, &self.population, &self.values);
        Ok(())
    }

    fn step(&mut self, evaluator: &mut Evaluator<'_>, rng: &mut StdRng) -> Result<()> {
        let (n_pop, dim) = self.population.dim();
        let mut candidates = self.population.clone();
        for i in 0..n_pop {
            let r = pick_distinct(n_pop, 2, &[i], rng);
            let mask = crossover_mask(dim, self.crossover, rng);
            let offset = OFFSETS.choose(rng).copied().unwrap_or(1.0) * self.step_length[i];
            let mut candidate = self.population.row(i).to_owned();
            for j in 0..dim {
                if mask[j] {
                    candidate[j] +=
                        offset * (self.population[[r[0], j]] - self.population[[r[1], j]]);
                }
            }
            evaluator.space().clip(&mut candidate);
            candidates.row_mut(i).assign(&candidate);
        }

        let candidate_values = evaluator.evaluate(&candidates)?;
        let mut improved = 0;
        for i in 0..n_pop {
            if candidate_values[i] < self.values[i] {
                self.population.row_mut(i).assign(&candidates.row(i));
                self.values[i] = candidate_values[i];
                self.step_length[i] = (self.step_length[i] * 2.0).min(MAX_STEP);
                improved += 1;
            } else {
                self.step_length[i] = (self.step_length[i] * 0.5).max(MIN_STEP);
            }
        }
        update_best(&mut self.best, &candidates, &candidate_values);
        debug!("rl step: {} of {} individuals improved", improved, n_pop);
        Ok(())
    }

    fn best(&self) -> Option<(Array1<f64>, f64)> {
        self.best.clone()
    }
}
