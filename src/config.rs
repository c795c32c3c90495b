//! Fit configuration.
//!
//! [`FitConfig`] carries every optimizer option of a campaign. It is passed
//! explicitly to the driver and serialized as the options blob of a remote
//! submission; there is no process-wide default fitter.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{FitError, Result};
use crate::optimizer::{InitMethod, StrategyKind};

/// Options accepted by [`FitConfig::set`].
pub const OPTION_KEYS: &str =
    "fit|steps|pop|burn|nT|Tmin|Tmax|CR|starts|init|resynth|seed|cov";

/// Options of a fit campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Optimizer to run. Default: de
    pub strategy: StrategyKind,

    /// Generations (point optimizers) or retained draws (samplers). Default: 1000
    pub steps: usize,

    /// Population size or number of chains. Default: 10
    pub pop: usize,

    /// Burn-in steps for the samplers. Default: 0
    pub burn: usize,

    /// Number of temperature replicas for parallel tempering. Default: 25
    pub n_temps: usize,

    /// Lowest temperature. Default: 0.1
    pub t_min: f64,

    /// Highest temperature. Default: 10
    pub t_max: f64,

    /// Crossover ratio (CR). Default: 0.9
    pub crossover: f64,

    /// Independent starts. Default: 1
    pub starts: usize,

    /// Population initialization. Default: lhs
    pub init: InitMethod,

    /// Resynthesis repeats. Default: 0
    pub resynth: usize,

    /// Base seed; drawn from entropy when absent.
    pub seed: Option<u64>,

    /// Estimate the covariance matrix after the fit. Default: false
    pub compute_cov: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::De,
            steps: 1000,
            pop: 10,
            burn: 0,
            n_temps: 25,
            t_min: 0.1,
            t_max: 10.0,
            crossover: 0.9,
            starts: 1,
            init: InitMethod::Lhs,
            resynth: 0,
            seed: None,
            compute_cov: false,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str, allowed: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| FitError::invalid_option(key, value, allowed))
}

impl FitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_pop(mut self, pop: usize) -> Self {
        self.pop = pop;
        self
    }

    pub fn with_burn(mut self, burn: usize) -> Self {
        self.burn = burn;
        self
    }

    /// Set the temperature ladder for parallel tempering.
    ///
    /// # Arguments
    ///
    /// * `n_temps` - Number of replicas
    /// * `t_min` - Lowest temperature
    /// * `t_max` - Highest temperature
    pub fn with_temperatures(mut self, n_temps: usize, t_min: f64, t_max: f64) -> Self {
        self.n_temps = n_temps;
        self.t_min = t_min;
        self.t_max = t_max;
        self
    }

    pub fn with_crossover(mut self, crossover: f64) -> Self {
        self.crossover = crossover;
        self
    }

    pub fn with_starts(mut self, starts: usize) -> Self {
        self.starts = starts;
        self
    }

    pub fn with_init(mut self, init: InitMethod) -> Self {
        self.init = init;
        self
    }

    pub fn with_resynth(mut self, resynth: usize) -> Self {
        self.resynth = resynth;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_covariance(mut self, compute_cov: bool) -> Self {
        self.compute_cov = compute_cov;
        self
    }

    /// Set an option from its command-line name and textual value.
    ///
    /// Names follow the classic front end: `fit`, `steps`, `pop`, `burn`,
    /// `nT`, `Tmin`, `Tmax`, `CR`, `starts`, `init`, `resynth`, `seed` and
    /// `cov`. An empty seed clears it.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "fit" => self.strategy = value.parse()?,
            "steps" => self.steps = parse(key, value, "a non-negative integer")?,
            "pop" => self.pop = parse(key, value, "a positive integer")?,
            "burn" => self.burn = parse(key, value, "a non-negative integer")?,
            "nT" => self.n_temps = parse(key, value, "a positive integer")?,
            "Tmin" => self.t_min = parse(key, value, "a positive number")?,
            "Tmax" => self.t_max = parse(key, value, "a positive number")?,
            "CR" => self.crossover = parse(key, value, "a value in [0, 1]")?,
            "starts" => self.starts = parse(key, value, "a positive integer")?,
            "init" => self.init = value.parse()?,
            "resynth" => self.resynth = parse(key, value, "a non-negative integer")?,
            "seed" => {
                self.seed = if value.trim().is_empty() {
                    None
                } else {
                    Some(parse(key, value, "an unsigned 64-bit integer")?)
                }
            }
            "cov" => self.compute_cov = parse(key, value, "true|false")?,
            _ => return Err(FitError::invalid_option("option", key, OPTION_KEYS)),
        }
        Ok(())
    }

    /// Check every option before any evaluation starts.
    pub fn validate(&self) -> Result<()> {
        if self.pop == 0 {
            return Err(FitError::invalid_option("pop", self.pop, "a positive integer"));
        }
        if self.starts == 0 {
            return Err(FitError::invalid_option(
                "starts",
                self.starts,
                "a positive integer",
            ));
        }
        if !(0.0..=1.0).contains(&self.crossover) {
            return Err(FitError::invalid_option(
                "CR",
                self.crossover,
                "a value in [0, 1]",
            ));
        }
        if self.strategy == StrategyKind::Tempering {
            if self.n_temps == 0 {
                return Err(FitError::invalid_option(
                    "nT",
                    self.n_temps,
                    "a positive integer",
                ));
            }
            if !(self.t_min > 0.0 && self.t_min.is_finite()) {
                return Err(FitError::invalid_option(
                    "Tmin",
                    self.t_min,
                    "a positive number",
                ));
            }
            if !(self.t_max >= self.t_min && self.t_max.is_finite()) {
                return Err(FitError::invalid_option(
                    "Tmax",
                    self.t_max,
                    format!("a number no smaller than Tmin = {}", self.t_min),
                ));
            }
        }
        Ok(())
    }

    /// Base seed for the campaign, drawing one from entropy if unset.
    pub fn base_seed(&self) -> u64 {
        self.seed.unwrap_or_else(rand::random::<u64>)
    }
}

impl fmt::Display for FitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Fit configuration:")?;
        writeln!(f, "  Fitter: {}", self.strategy)?;
        writeln!(f, "  Steps: {}", self.steps)?;
        writeln!(f, "  Population: {}", self.pop)?;
        writeln!(f, "  Burn-in: {}", self.burn)?;
        if self.strategy == StrategyKind::Tempering {
            writeln!(
                f,
                "  Temperatures: {} in [{}, {}]",
                self.n_temps, self.t_min, self.t_max
            )?;
        }
        writeln!(f, "  Crossover ratio (CR): {:.4}", self.crossover)?;
        writeln!(f, "  Starts: {}", self.starts)?;
        writeln!(f, "  Init: {}", self.init)?;
        writeln!(f, "  Resynth: {}", self.resynth)?;
        match self.seed {
            Some(seed) => writeln!(f, "  Random seed: {}", seed)?,
            None => writeln!(f, "  Random seed: (entropy)")?,
        }
        Ok(())
    }
}

/// Deterministic seed for an independent random stream.
///
/// Streams are numbered per start, resynthesis repeat or worker; distinct
/// streams of one base seed are decorrelated by a splitmix64 finalizer.
pub fn derive_seed(base: u64, stream: u64) -> u64 {
    let mut z = base
        .wrapping_add(stream.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
