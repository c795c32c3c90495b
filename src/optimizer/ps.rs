//! Particle swarm.
//!
//! Each particle moves with a velocity pulled towards its own best position
//! and the swarm's best position. The whole swarm is evaluated as one batch
//! per step.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::Rng;
use tracing::debug;

use super::{argmin, update_best, Strategy, StrategyKind};
use crate::error::{FitError, Result};
use crate::mapper::Evaluator;

const MIN_POPULATION: usize = 2;

/// Particle swarm optimizer (defaults: w=0.7, c1=1.5, c2=1.5).
#[derive(Debug, Clone)]
pub struct ParticleSwarm {
    population_size: usize,
    generations: usize,
    inertia: f64,   // w - velocity inertia weight
    cognitive: f64, // c1 - personal best influence
    social: f64,    // c2 - global best influence

    positions: Array2<f64>,
    velocities: Array2<f64>,
    personal_best: Array2<f64>,
    personal_best_values: Array1<f64>,
    best: Option<(Array1<f64>, f64)>,
}

impl ParticleSwarm {
    pub fn new(population_size: usize, generations: usize) -> Self {
        Self {
            population_size,
            generations,
            inertia: 0.7,
            cognitive: 1.5,
            social: 1.5,
            positions: Array2::zeros((0, 0)),
            velocities: Array2::zeros((0, 0)),
            personal_best: Array2::zeros((0, 0)),
            personal_best_values: Array1::zeros(0),
            best: None,
        }
    }

    /// Configure swarm coefficients.
    pub fn with_coefficients(mut self, inertia: f64, cognitive: f64, social: f64) -> Self {
        self.inertia = inertia;
        self.cognitive = cognitive;
        self.social = social;
        self
    }
}

impl Strategy for ParticleSwarm {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ParticleSwarm
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
        rng: &mut StdRng,
    ) -> Result<()> {
        if population.nrows() < MIN_POPULATION {
            return Err(FitError::invalid_option(
                "pop",
                population.nrows(),
                format!("at least {} particles", MIN_POPULATION),
            ));
        }
        let values = evaluator.evaluate(&population)?;
        let space = evaluator.space();

        // Small random velocities, a tenth of each parameter's spread
        self.velocities = Array2::from_shape_fn(population.raw_dim(), |(_, j)| {
            let range = space.scale(j) * 0.1;
            rng.gen_range(-range..=range)
        });
        self.best = None;
        update_best(&mut self.best, &population, &values);
        self.personal_best = population.clone();
        self.personal_best_values = values;
        self.positions = population;
        Ok(())
    }

    fn step(&mut self, evaluator: &mut Evaluator<'_>, rng: &mut StdRng) -> Result<()> {
        let (n_pop, dim) = self.positions.dim();
        let leader = argmin(&self.personal_best_values);
        let space = evaluator.space();

        for p in 0..n_pop {
            for i in 0..dim {
                let r1 = rng.gen::<f64>();
                let r2 = rng.gen::<f64>();
                let x = self.positions[[p, i]];
                let limit = space.scale(i);
                let v = self.inertia * self.velocities[[p, i]]
                    + self.cognitive * r1 * (self.personal_best[[p, i]] - x)
                    + self.social * r2 * (self.personal_best[[leader, i]] - x);
                let v = v.clamp(-limit, limit);

                let (lo, hi) = (space.lower()[i], space.upper()[i]);
                let moved = x + v;
                if moved < lo || moved > hi {
                    // Stop at the wall
                    self.positions[[p, i]] = moved.clamp(lo, hi);
                    self.velocities[[p, i]] = 0.0;
                } else {
                    self.positions[[p, i]] = moved;
                    self.velocities[[p, i]] = v;
                }
            }
        }

        let values = evaluator.evaluate(&self.positions)?;
        let mut improved = 0;
        for p in 0..n_pop {
            if values[p] < self.personal_best_values[p] {
                self.personal_best.row_mut(p).assign(&self.positions.row(p));
                self.personal_best_values[p] = values[p];
                improved += 1;
            }
        }
        update_best(&mut self.best, &self.positions, &values);
        debug!("ps step: {} personal bests improved", improved);
        Ok(())
    }

    fn best(&self) -> Option<(Array1<f64>, f64)> {
        self.best.clone()
    }
}
