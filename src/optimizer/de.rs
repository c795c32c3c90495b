//! Differential evolution point optimizer.
//!
//! Each generation builds one trial vector per individual from vector
//! differences of the population, evaluates all trials as a single batch and
//! keeps a trial whenever it is no worse than its target.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::Rng;
use tracing::debug;

use super::{argmin, crossover_mask, pick_distinct, update_best, Strategy, StrategyKind};
use crate::error::{FitError, Result};
use crate::mapper::Evaluator;

/// Smallest population that leaves three donors for every target.
const MIN_POPULATION: usize = 4;

/// Strategies for creating candidate solutions in Differential Evolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DEStrategy {
    /// DE/rand/1: x_r1 + F * (x_r2 - x_r3)
    Rand1,

    /// DE/best/1: x_best + F * (x_r1 - x_r2)
    Best1,

    /// DE/current-to-best/1: x_i + F * (x_best - x_i) + F * (x_r1 - x_r2)
    CurrentToBest1,
}

/// Differential Evolution optimizer.
#[derive(Debug, Clone)]
pub struct DifferentialEvolution {
    /// Number of individuals
    pub population_size: usize,

    /// Number of generations
    pub generations: usize,

    /// Differential weight (F) in range [0, 2]
    pub differential_weight: f64,

    /// Crossover probability (CR) in range [0, 1]
    pub crossover_prob: f64,

    /// Strategy for creating candidate solutions
    pub strategy: DEStrategy,

    population: Array2<f64>,
    values: Array1<f64>,
    best: Option<(Array1<f64>, f64)>,
    generation: usize,
}

impl Default for DifferentialEvolution {
    fn default() -> Self {
        Self::new(10, 1000)
    }
}

impl DifferentialEvolution {
    /// Create a new optimizer.
    ///
    /// # Arguments
    ///
    /// * `population_size` - Number of individuals, raised to at least 4
    /// * `generations` - Number of generations to run
    pub fn new(population_size: usize, generations: usize) -> Self {
        Self {
            population_size,
            generations,
            differential_weight: 0.8,
            crossover_prob: 0.9,
            strategy: DEStrategy::Best1,
            population: Array2::zeros((0, 0)),
            values: Array1::zeros(0),
            best: None,
            generation: 0,
        }
    }

    /// Set the differential weight (F).
    ///
    /// # Arguments
    ///
    /// * `weight` - Differential weight in range [0, 2]
    ///
    /// # Returns
    ///
    /// * Self for method chaining
    pub fn with_differential_weight(mut self, weight: f64) -> Self {
        self.differential_weight = weight;
        self
    }

    /// Set the crossover probability (CR).
    ///
    /// # Arguments
    ///
    /// * `prob` - Crossover probability in range [0, 1]
    ///
    /// # Returns
    ///
    /// * Self for method chaining
    pub fn with_crossover_probability(mut self, prob: f64) -> Self {
        self.crossover_prob = prob;
        self
    }

    /// Set the mutation strategy.
    pub fn with_strategy(mut self, strategy: DEStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Generations completed so far
    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Create a trial vector for `target` using the configured strategy.
    fn create_trial_vector(&self, target: usize, best: usize, rng: &mut StdRng) -> Array1<f64> {
        let n_pop = self.population.nrows();
        let pop = &self.population;
        let f = self.differential_weight;

        let mut trial = match self.strategy {
            DEStrategy::Rand1 => {
                let r = pick_distinct(n_pop, 3, &[target], rng);
                &pop.row(r[0]) + &((&pop.row(r[1]) - &pop.row(r[2])) * f)
            }
            DEStrategy::Best1 => {
                let r = pick_distinct(n_pop, 2, &[target, best], rng);
                &pop.row(best) + &((&pop.row(r[0]) - &pop.row(r[1])) * f)
            }
            DEStrategy::CurrentToBest1 => {
                let r = pick_distinct(n_pop, 2, &[target, best], rng);
                &pop.row(target)
                    + &((&pop.row(best) - &pop.row(target)) * f)
                    + &((&pop.row(r[0]) - &pop.row(r[1])) * f)
            }
        };

        // Binomial crossover with the target vector
        let mask = crossover_mask(trial.len(), self.crossover_prob, rng);
        for (j, keep_trial) in mask.into_iter().enumerate() {
            if !keep_trial {
                trial[j] = pop[[target, j]];
            }
        }
        trial
    }
}

impl Strategy for DifferentialEvolution {
    fn kind(&self) -> StrategyKind {
        StrategyKind::De
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
        self.population = population;
        self.best = None;
        self.generation = 0;
        update_best(&mut self.best, &self.population, &self.values);
        Ok(())
    }

    fn step(&mut self, evaluator: &mut Evaluator<'_>, rng: &mut StdRng) -> Result<()> {
        let n_pop = self.population.nrows();
        let best = argmin(&self.values);

        let mut trials = Array2::zeros(self.population.raw_dim());
        for i in 0..n_pop {
            let mut trial = self.create_trial_vector(i, best, rng);
            evaluator.space().clip(&mut trial);
            trials.row_mut(i).assign(&trial);
        }

        let trial_values = evaluator.evaluate(&trials)?;
        let mut replaced = 0;
        for i in 0..n_pop {
            if trial_values[i] <= self.values[i] {
                self.population.row_mut(i).assign(&trials.row(i));
                self.values[i] = trial_values[i];
                replaced += 1;
            }
        }
        update_best(&mut self.best, &trials, &trial_values);
        self.generation += 1;
        debug!(
            "de generation {}: {} of {} replaced",
            self.generation, replaced, n_pop
        );
        Ok(())
    }

    fn best(&self) -> Option<(Array1<f64>, f64)> {
        self.best.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{Mapper, SerialMapper, RetryPolicy};
    use crate::optimizer::{minimize, InitMethod};
    use crate::parameters::{ParameterSpace, Parameters};
    use crate::problem::FitProblem;
    use crate::progress::CancelToken;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    #[derive(Clone)]
    struct Bowl {
        params: Parameters,
    }

    impl FitProblem for Bowl {
        fn parameters(&self) -> &Parameters {
            &self.params
        }

        fn parameters_mut(&mut self) -> &mut Parameters {
            &mut self.params
        }

        fn nllf(&self, v: &Array1<f64>) -> Result<f64> {
            Ok((v[0] - 3.0).powi(2) + (v[1] - 7.0).powi(2))
        }

        fn degrees_of_freedom(&self) -> usize {
            1
        }
    }

    fn bowl() -> Bowl {
        let mut params = Parameters::new();
        params.add_param_with_bounds("x", 5.0, 0.0, 10.0).unwrap();
        params.add_param_with_bounds("y", 5.0, 0.0, 10.0).unwrap();
        Bowl { params }
    }

    fn run(strategy: DEStrategy, seed: u64) -> (Array1<f64>, f64) {
        let problem = bowl();
        let space = ParameterSpace::from_parameters(problem.parameters()).unwrap();
        let mut mapper = SerialMapper::new(problem, RetryPolicy::default());
        let mapper: &mut dyn Mapper = &mut mapper;
        let mut evaluator = Evaluator::new(&space, mapper, CancelToken::new());
        let mut de = DifferentialEvolution::new(20, 200).with_strategy(strategy);
        let mut rng = StdRng::seed_from_u64(seed);
        minimize(&mut de, &mut evaluator, InitMethod::Lhs, None, &mut rng).unwrap()
    }

    #[test]
    fn test_de_converges_on_bowl() {
        for strategy in [DEStrategy::Rand1, DEStrategy::Best1, DEStrategy::CurrentToBest1] {
            let (point, value) = run(strategy, 42);
            assert_relative_eq!(point[0], 3.0, epsilon = 1e-2);
            assert_relative_eq!(point[1], 7.0, epsilon = 1e-2);
            assert!(value < 1e-4);
        }
    }

    #[test]
    fn test_de_is_reproducible() {
        assert_eq!(run(DEStrategy::Best1, 9), run(DEStrategy::Best1, 9));
    }

    #[test]
    fn test_de_rejects_tiny_population() {
        let problem = bowl();
        let space = ParameterSpace::from_parameters(problem.parameters()).unwrap();
        let mut mapper = SerialMapper::new(problem, RetryPolicy::default());
        let mut evaluator = Evaluator::new(&space, &mut mapper, CancelToken::new());
        let mut de = DifferentialEvolution::new(2, 10);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(de
            .initialize(Array2::from_elem((2, 2), 1.0), &mut evaluator, &mut rng)
            .is_err());
    }
}
