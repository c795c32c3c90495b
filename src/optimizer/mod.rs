//! Optimization strategies.
//!
//! Every strategy follows the same lifecycle:
//!
//! 1. configure: [`StrategyKind::build`] turns a [`FitConfig`] into a boxed
//!    [`Strategy`];
//! 2. initialize: the caller generates a starting population with
//!    [`init::generate`] and hands it to [`Strategy::initialize`];
//! 3. iterate: [`Strategy::step`] is called [`Strategy::planned_steps`]
//!    times;
//! 4. [`Strategy::best`] (and [`Strategy::posterior`] for the samplers).
//!
//! Strategies never call the objective directly. Each step proposes a whole
//! population and submits it to an [`Evaluator`] as one batch, so the same
//! code runs unchanged on the serial, pool and queue transports. All random
//! draws happen on the calling thread, which keeps a seeded run identical
//! across transports.

use ndarray::{Array1, Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::FitConfig;
use crate::error::{FitError, Result};
use crate::mapper::Evaluator;

mod de;
mod dream;
pub mod init;
mod ps;
mod pt;
mod rl;

pub use de::{DEStrategy, DifferentialEvolution};
pub use dream::Dream;
pub use init::InitMethod;
pub use ps::ParticleSwarm;
pub use pt::ParallelTempering;
pub use rl::RandomLines;

/// A stateful population-based optimizer.
pub trait Strategy: Send {
    fn kind(&self) -> StrategyKind;

    /// Number of individuals (or chains, or replicas) for a `dim`-dimensional
    /// problem.
    fn population_size(&self, dim: usize) -> usize;

    /// Steps the strategy runs after initialization.
    fn planned_steps(&self) -> usize;

    /// Evaluate the starting population. Rows are optimization vectors.
    fn initialize(
        &mut self,
        population: Array2<f64>,
        evaluator: &mut Evaluator<'_>,
        rng: &mut StdRng,
    ) -> Result<()>;

    /// Advance by one generation or sampling step (one batch).
    fn step(&mut self, evaluator: &mut Evaluator<'_>, rng: &mut StdRng) -> Result<()>;

    /// Best vector seen so far and its objective value.
    fn best(&self) -> Option<(Array1<f64>, f64)>;

    /// Retained post-burn samples; samplers only.
    fn posterior(&self) -> Option<PosteriorTrace> {
        None
    }
}

/// Named optimizer strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    /// Differential evolution point optimizer
    #[serde(rename = "de")]
    De,

    /// Population MCMC sampler with adaptive crossover
    #[serde(rename = "dream")]
    Dream,

    /// Random-lines local search
    #[serde(rename = "rl")]
    RandomLines,

    /// Particle swarm
    #[serde(rename = "ps")]
    ParticleSwarm,

    /// Parallel tempering
    #[serde(rename = "pt")]
    Tempering,
}

impl StrategyKind {
    /// Every strategy, in the order they are listed to users.
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::De,
        StrategyKind::Dream,
        StrategyKind::RandomLines,
        StrategyKind::ParticleSwarm,
        StrategyKind::Tempering,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StrategyKind::De => "de",
            StrategyKind::Dream => "dream",
            StrategyKind::RandomLines => "rl",
            StrategyKind::ParticleSwarm => "ps",
            StrategyKind::Tempering => "pt",
        }
    }

    /// `de|dream|rl|ps|pt`
    pub fn allowed() -> String {
        Self::ALL
            .iter()
            .map(|k| k.name())
            .collect::<Vec<_>>()
            .join("|")
    }

    /// True for strategies that sample a posterior rather than minimize.
    pub fn is_sampler(self) -> bool {
        matches!(self, StrategyKind::Dream | StrategyKind::Tempering)
    }

    /// Construct a configured strategy.
    pub fn build(self, config: &FitConfig) -> Box<dyn Strategy> {
        match self {
            StrategyKind::De => Box::new(
                DifferentialEvolution::new(config.pop, config.steps)
                    .with_crossover_probability(config.crossover),
            ),
            StrategyKind::Dream => Box::new(Dream::new(config.pop, config.burn, config.steps)),
            StrategyKind::RandomLines => Box::new(
                RandomLines::new(config.pop, config.steps).with_crossover(config.crossover),
            ),
            StrategyKind::ParticleSwarm => Box::new(ParticleSwarm::new(config.pop, config.steps)),
            StrategyKind::Tempering => Box::new(
                ParallelTempering::new(config.n_temps, config.t_min, config.t_max)
                    .with_schedule(config.burn, config.steps)
                    .with_crossover(config.crossover),
            ),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyKind {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.name() == name)
            .ok_or_else(|| FitError::UnknownStrategy {
                name: name.to_string(),
                allowed: Self::allowed(),
            })
    }
}

/// Post-burn samples of a population sampler.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorTrace {
    /// Samples indexed by (draw, chain, parameter)
    pub points: Array3<f64>,

    /// Objective values indexed by (draw, chain)
    pub nllf: Array2<f64>,

    /// Fraction of accepted proposals over the whole run
    pub acceptance_rate: f64,
}

impl PosteriorTrace {
    pub(crate) fn new(draws: usize, chains: usize, dim: usize) -> Self {
        Self {
            points: Array3::zeros((draws, chains, dim)),
            nllf: Array2::zeros((draws, chains)),
            acceptance_rate: 0.0,
        }
    }

    pub fn draws(&self) -> usize {
        self.points.len_of(Axis(0))
    }

    pub fn chains(&self) -> usize {
        self.points.len_of(Axis(1))
    }

    pub fn dim(&self) -> usize {
        self.points.len_of(Axis(2))
    }

    /// All samples as rows, draw-major.
    pub fn flatten(&self) -> Array2<f64> {
        let rows = self.draws() * self.chains();
        self.points
            .to_shape((rows, self.dim()))
            .map(|view| view.to_owned())
            .unwrap_or_else(|_| Array2::zeros((rows, self.dim())))
    }
}

/// Run a strategy from initialization to its last planned step.
///
/// Drivers that need per-step events run the loop themselves; this is the
/// plain form used for one-off minimizations.
pub fn minimize(
    strategy: &mut dyn Strategy,
    evaluator: &mut Evaluator<'_>,
    init: InitMethod,
    covariance: Option<&Array2<f64>>,
    rng: &mut StdRng,
) -> Result<(Array1<f64>, f64)> {
    let space = evaluator.space().clone();
    let n = strategy.population_size(space.dim());
    let population = init::generate(init, n, &space.start(), &space, covariance, rng)?;
    strategy.initialize(population, evaluator, rng)?;
    for _ in 0..strategy.planned_steps() {
        strategy.step(evaluator, rng)?;
    }
    strategy
        .best()
        .ok_or_else(|| FitError::InvalidState("strategy finished without a best point".into()))
}

/// Index of the smallest value; the first one on ties.
pub(crate) fn argmin(values: &Array1<f64>) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v < values[best] {
            best = i;
        }
    }
    best
}

/// Crossover mask: each dimension is selected with probability `cr`, and at
/// least one dimension always is.
pub(crate) fn crossover_mask(dim: usize, cr: f64, rng: &mut StdRng) -> Vec<bool> {
    let mut mask: Vec<bool> = (0..dim).map(|_| rng.gen::<f64>() < cr).collect();
    if dim > 0 {
        let forced = rng.gen_range(0..dim);
        mask[forced] = true;
    }
    mask
}

/// `count` distinct indices in `0..n`, none of them in `exclude`.
pub(crate) fn pick_distinct(
    n: usize,
    count: usize,
    exclude: &[usize],
    rng: &mut StdRng,
) -> Vec<usize> {
    let mut available: Vec<usize> = (0..n).filter(|i| !exclude.contains(i)).collect();
    available.shuffle(rng);
    available.truncate(count);
    available
}

/// Track the best of a freshly evaluated batch.
pub(crate) fn update_best(
    best: &mut Option<(Array1<f64>, f64)>,
    points: &Array2<f64>,
    values: &Array1<f64>,
) -> bool {
    if values.is_empty() {
        return false;
    }
    let i = argmin(values);
    let improved = match best {
        Some((_, value)) => values[i] < *value,
        None => true,
    };
    if improved {
        *best = Some((points.row(i).to_owned(), values[i]));
    }
    improved
}
