//! Fit campaigns.
//!
//! [`FitDriver`] runs the configured strategy for a number of independent
//! starts and keeps the best result across them. After every improvement the
//! problem's live parameters are updated and, when a [`FitStore`] is
//! attached, the best parameters are checkpointed to disk. Progress is
//! published as [`ProgressEvent`]s on channels obtained from
//! [`FitDriver::subscribe`].
//!
//! The driver also runs the resynthesis error analysis and the mesh scan.
//!
//! ```no_run
//! # use reflfit::{FitConfig, FitDriver, FitProblem, Transport};
//! # fn demo<P: FitProblem + Clone + Send + Sync + 'static>(problem: P) -> reflfit::Result<()> {
//! let config = FitConfig::new().with_steps(200).with_seed(42);
//! let mut driver = FitDriver::new(problem, config, Transport::pool(4))?;
//! let events = driver.subscribe();
//! std::thread::spawn(move || reflfit::progress::log_events(events));
//! let result = driver.fit()?;
//! println!("{}", result);
//! # Ok(())
//! # }
//! ```

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use tracing::{debug, info, warn};

use crate::config::{derive_seed, FitConfig};
use crate::error::{FitError, Result};
use crate::mapper::{Evaluator, Transport};
use crate::optimizer::{init, InitMethod, PosteriorTrace, Strategy};
use crate::parameters::{ParameterSpace, Parameters};
use crate::problem::{FitProblem, ProblemSpec};
use crate::progress::{CancelToken, MonitorHub, ProgressEvent, StepTrace};
use crate::store::FitStore;
use crate::uncertainty::{estimate_covariance, mean_std, standard_errors_from_covariance};

/// Offset of the resynthesis seed streams, keeping them apart from the
/// streams of the starts.
const RESYNTH_STREAM: u64 = 1 << 32;

/// How a campaign ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// Every start ran its full budget.
    Completed,

    /// Cancelled; the result holds the best point found before that.
    Cancelled,

    /// A batch failed after evaluations had succeeded.
    Failed {
        start: usize,
        step: usize,
        message: String,
    },
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Completed => write!(f, "completed"),
            Termination::Cancelled => write!(f, "cancelled"),
            Termination::Failed {
                start,
                step,
                message,
            } => write!(f, "failed at start {} step {}: {}", start, step, message),
        }
    }
}

/// Outcome of a fit campaign.
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Fitted parameter names, in vector order
    pub names: Vec<String>,

    /// Best optimization vector
    pub point: Array1<f64>,

    /// Objective at the best point
    pub nllf: f64,

    /// Reduced goodness of fit at the best point
    pub chisq: f64,

    /// Strategy steps completed over all starts
    pub steps: usize,

    /// Objective evaluations over all starts
    pub evaluations: usize,

    /// Starts that ran to the end of their budget
    pub starts_completed: usize,

    pub termination: Termination,

    /// Inverse Hessian at the best point, when requested
    pub covariance: Option<Array2<f64>>,

    /// Standard errors from the covariance
    pub stderr: Option<Array1<f64>>,

    /// Samples of the start that produced the best point (samplers only)
    pub posterior: Option<PosteriorTrace>,

    /// Base seed of the campaign
    pub seed: u64,
}

impl FitResult {
    /// True when the campaign ran its full budget.
    pub fn is_complete(&self) -> bool {
        self.termination == Termination::Completed
    }

    /// Value of a fitted parameter by name
    pub fn value(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.point[i])
    }
}

impl fmt::Display for FitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Fit Result:")?;
        writeln!(f, "  Termination: {}", self.termination)?;
        writeln!(f, "  nllf: {:.6e}", self.nllf)?;
        writeln!(f, "  chisq: {:.6}", self.chisq)?;
        writeln!(f, "  Steps: {}", self.steps)?;
        writeln!(f, "  Function evaluations: {}", self.evaluations)?;
        writeln!(f, "  Starts completed: {}", self.starts_completed)?;
        writeln!(f, "  Seed: {}", self.seed)?;
        writeln!(f, "  Parameters:")?;
        for (i, name) in self.names.iter().enumerate() {
            match &self.stderr {
                Some(err) => writeln!(f, "    {} = {} +/- {}", name, self.point[i], err[i])?,
                None => writeln!(f, "    {} = {}", name, self.point[i])?,
            }
        }
        Ok(())
    }
}

/// One successful resynthesis repeat.
#[derive(Debug, Clone, PartialEq)]
pub struct ResynthSample {
    pub iteration: usize,
    pub nllf: f64,
    pub point: Array1<f64>,
}

/// One failed resynthesis repeat.
#[derive(Debug, Clone, PartialEq)]
pub struct ResynthFailure {
    pub iteration: usize,
    pub message: String,
}

/// Empirical distribution of best fits over resynthesized data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResynthResult {
    pub names: Vec<String>,
    pub samples: Vec<ResynthSample>,
    pub failures: Vec<ResynthFailure>,
}

impl ResynthResult {
    /// Repeats attempted, successful or not
    pub fn attempts(&self) -> usize {
        self.samples.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts() == 0
    }

    /// Recorded vectors, one per row
    pub fn points(&self) -> Array2<f64> {
        let dim = self.names.len();
        let mut points = Array2::zeros((self.samples.len(), dim));
        for (mut row, sample) in points.rows_mut().into_iter().zip(&self.samples) {
            row.assign(&sample.point);
        }
        points
    }

    /// Mean of each parameter over the recorded vectors
    pub fn mean(&self) -> Array1<f64> {
        mean_std(&self.points()).0
    }

    /// Sample standard deviation of each parameter over the recorded vectors
    pub fn std(&self) -> Array1<f64> {
        mean_std(&self.points()).1
    }
}

/// Objective values on a grid over two fitted parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshScan {
    pub x_name: String,
    pub y_name: String,
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    /// `values[[i, j]]` is the objective at `(x[i], y[j])`
    pub values: Array2<f64>,
}

/// Per-campaign bookkeeping.
struct Campaign {
    best: Option<(Array1<f64>, f64)>,
    best_start: Option<usize>,
    steps: usize,
    posterior: Option<PosteriorTrace>,
    checkpoint: bool,
    trace: Option<StepTrace<BufWriter<File>>>,
}

/// Orchestrates fit campaigns for one problem.
pub struct FitDriver<P> {
    problem: P,
    config: FitConfig,
    transport: Transport,
    hub: MonitorHub,
    cancel: CancelToken,
    store: Option<FitStore>,
    step_trace: bool,
}

impl<P> FitDriver<P>
where
    P: FitProblem + Clone + Send + Sync + 'static,
{
    /// Create a driver, rejecting invalid options and bounds before any
    /// evaluation.
    pub fn new(problem: P, config: FitConfig, transport: Transport) -> Result<Self> {
        config.validate()?;
        transport.validate()?;
        ParameterSpace::from_parameters(problem.parameters())?;
        Ok(Self {
            problem,
            config,
            transport,
            hub: MonitorHub::new(),
            cancel: CancelToken::new(),
            store: None,
            step_trace: false,
        })
    }

    /// Attach an artifact store for checkpoints, logs and resynthesis output.
    pub fn with_store(mut self, store: FitStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Also write the `.mon` step trace to the store.
    pub fn with_step_trace(mut self, enabled: bool) -> Self {
        self.step_trace = enabled;
        self
    }

    /// Receive progress events from now on.
    pub fn subscribe(&mut self) -> crossbeam_channel::Receiver<ProgressEvent> {
        self.hub.subscribe()
    }

    /// Receive progress events from now on, keeping at most `capacity`
    /// undelivered ones.
    pub fn subscribe_bounded(
        &mut self,
        capacity: usize,
    ) -> crossbeam_channel::Receiver<ProgressEvent> {
        self.hub.subscribe_bounded(capacity)
    }

    /// Token that cancels the running campaign from another thread.
    ///
    /// Every [`FitDriver::fit`] and [`FitDriver::resynth`] clears the token
    /// when it starts, so a cancelled driver can be run again.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn problem(&self) -> &P {
        &self.problem
    }

    pub fn store(&self) -> Option<&FitStore> {
        self.store.as_ref()
    }

    pub fn into_problem(self) -> P {
        self.problem
    }

    /// Restore the parameters checkpointed in the store.
    pub fn recall_best(&mut self) -> Result<usize> {
        match &self.store {
            Some(store) => store.load_par(self.problem.parameters_mut()),
            None => Err(FitError::InvalidState("no store attached".to_string())),
        }
    }

    /// Run the configured campaign.
    ///
    /// Cancellation and failures after the first successful evaluation yield
    /// a partial result; see [`FitResult::termination`].
    pub fn fit(&mut self) -> Result<FitResult> {
        self.cancel.reset();
        let space = ParameterSpace::from_parameters(self.problem.parameters())?;
        let seed = self.config.base_seed();
        info!(
            "fitting {} parameters with {} (seed {})",
            space.dim(),
            self.config.strategy,
            seed
        );

        let mut trace = None;
        if let Some(store) = &self.store {
            store.save_model(&ProblemSpec::from_problem(&self.problem))?;
            store.append_log(&self.config.to_string())?;
            if self.step_trace {
                trace = Some(StepTrace::new(store.trace_writer()?));
            }
        }

        let mut campaign = Campaign {
            best: None,
            best_start: None,
            steps: 0,
            posterior: None,
            checkpoint: true,
            trace,
        };
        let result = self.campaign(&space, seed, &mut campaign);
        if let Some(trace) = campaign.trace.as_mut() {
            trace.flush()?;
        }
        let result = result?;

        if let Some(store) = &self.store {
            if let Termination::Failed { .. } = result.termination {
                store.append_log(&format!("fit {}", result.termination))?;
            }
            store.write_summary(&result)?;
        }
        Ok(result)
    }

    /// Multi-start campaign on the problem's current data.
    fn campaign(
        &mut self,
        space: &ParameterSpace,
        seed: u64,
        campaign: &mut Campaign,
    ) -> Result<FitResult> {
        let mut mapper = self.transport.start_mapper(&self.problem, &self.cancel)?;
        debug!(
            "started {} mapper with {} workers",
            mapper.name(),
            mapper.workers()
        );
        let mut evaluator = Evaluator::new(space, mapper.as_mut(), self.cancel.clone());
        let mut termination = Termination::Completed;
        let mut starts_completed = 0;

        if space.dim() == 0 {
            // Nothing to fit: the objective at the fixed values is the answer
            let value = evaluator.evaluate_point(&Array1::zeros(0))?;
            campaign.best = Some((Array1::zeros(0), value));
            starts_completed = self.config.starts;
        } else {
            let covariance = if self.config.init == InitMethod::Covariance {
                match estimate_covariance(&mut evaluator, &space.start()) {
                    Ok(cov) => Some(cov),
                    Err(FitError::Cancelled) => return Err(FitError::Cancelled),
                    Err(e) => {
                        warn!("cannot estimate covariance for initialization: {}", e);
                        None
                    }
                }
            } else {
                None
            };

            for start in 0..self.config.starts {
                let mut rng = StdRng::seed_from_u64(derive_seed(seed, start as u64));
                let mut strategy = self.config.strategy.build(&self.config);
                let origin = if start == 0 {
                    space.start()
                } else {
                    space.random_point(&mut rng)
                };
                let population = init::generate(
                    self.config.init,
                    strategy.population_size(space.dim()),
                    &origin,
                    space,
                    covariance.as_ref(),
                    &mut rng,
                )?;

                self.hub.emit(ProgressEvent::StartBegan {
                    start,
                    steps: strategy.planned_steps(),
                });
                let mut step = 0;
                let outcome = self.run_start(
                    start,
                    strategy.as_mut(),
                    population,
                    &mut evaluator,
                    &mut rng,
                    space,
                    campaign,
                    &mut step,
                );
                if campaign.best_start == Some(start) {
                    campaign.posterior = strategy.posterior();
                }

                let start_termination = match outcome {
                    Ok(()) => {
                        starts_completed += 1;
                        Termination::Completed
                    }
                    Err(FitError::Cancelled) => Termination::Cancelled,
                    Err(e) if e.is_configuration() || campaign.best.is_none() => return Err(e),
                    Err(e) => {
                        warn!("start {} failed at step {}: {}", start, step, e);
                        Termination::Failed {
                            start,
                            step,
                            message: e.to_string(),
                        }
                    }
                };
                self.hub.emit(ProgressEvent::StartFinished {
                    start,
                    best_nllf: strategy.best().map(|(_, v)| v),
                    termination: start_termination.clone(),
                });
                if start_termination != Termination::Completed {
                    termination = start_termination;
                    break;
                }
            }
        }

        let (point, nllf) = match campaign.best.clone() {
            Some(best) => best,
            None if termination == Termination::Cancelled => return Err(FitError::Cancelled),
            None => {
                return Err(FitError::InvalidState(
                    "campaign ended without an evaluated point".to_string(),
                ))
            }
        };

        let mut covariance = None;
        let mut stderr = None;
        if self.config.compute_cov && termination == Termination::Completed && space.dim() > 0 {
            match estimate_covariance(&mut evaluator, &point) {
                Ok(cov) => {
                    stderr = Some(standard_errors_from_covariance(&cov));
                    covariance = Some(cov);
                }
                Err(e) => warn!("covariance estimate failed: {}", e),
            }
        }

        let result = FitResult {
            names: space.names().to_vec(),
            chisq: self.problem.chisq(nllf),
            point,
            nllf,
            steps: campaign.steps,
            evaluations: evaluator.evaluations(),
            starts_completed,
            termination: termination.clone(),
            covariance,
            stderr,
            posterior: campaign.posterior.take(),
            seed,
        };
        self.hub.emit(ProgressEvent::Finished {
            best_nllf: nllf,
            termination,
        });
        info!(
            "fit {}: nllf {:.6e}, chisq {:.4} after {} evaluations",
            result.termination, result.nllf, result.chisq, result.evaluations
        );
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_start(
        &mut self,
        start: usize,
        strategy: &mut dyn Strategy,
        population: Array2<f64>,
        evaluator: &mut Evaluator<'_>,
        rng: &mut StdRng,
        space: &ParameterSpace,
        campaign: &mut Campaign,
        step: &mut usize,
    ) -> Result<()> {
        strategy.initialize(population, evaluator, rng)?;
        self.observe(start, 0, strategy, space, campaign)?;

        for i in 0..strategy.planned_steps() {
            if self.cancel.is_cancelled() {
                return Err(FitError::Cancelled);
            }
            *step = i;
            strategy.step(evaluator, rng)?;
            campaign.steps += 1;
            self.observe(start, i + 1, strategy, space, campaign)?;
        }
        *step = strategy.planned_steps();
        Ok(())
    }

    /// Publish a step and checkpoint a campaign-wide improvement.
    fn observe(
        &mut self,
        start: usize,
        step: usize,
        strategy: &dyn Strategy,
        space: &ParameterSpace,
        campaign: &mut Campaign,
    ) -> Result<()> {
        let Some((point, value)) = strategy.best() else {
            return Ok(());
        };
        if step > 0 {
            let event = ProgressEvent::Step {
                start,
                step,
                best_nllf: value,
                best_point: point.clone(),
            };
            if let Some(trace) = campaign.trace.as_mut() {
                trace.record(&event)?;
            }
            self.hub.emit(event);
        }

        let improved = match &campaign.best {
            Some((_, best)) => value < *best,
            None => true,
        };
        if improved {
            self.problem.set_point(space, &point)?;
            if campaign.checkpoint {
                if let Some(store) = &self.store {
                    store.write_par(self.problem.parameters())?;
                }
            }
            debug!("start {} step {}: new best {:.6e}", start, step, value);
            campaign.best = Some((point.clone(), value));
            campaign.best_start = Some(start);
            self.hub.emit(ProgressEvent::Improvement {
                start,
                step,
                best_nllf: value,
                best_point: point,
            });
        }
        Ok(())
    }

    /// Resynthesis error analysis.
    ///
    /// Repeats `config.resynth` times: resample the data, refit from the
    /// current parameter values, record the best objective and vector. A
    /// failed repeat is recorded and the next one runs. Data and parameters
    /// are restored afterwards. With zero repeats nothing is done.
    ///
    /// Resampled data cannot reach standing queue workers, so the queue
    /// transport is rejected before any repeat runs.
    pub fn resynth(&mut self) -> Result<ResynthResult> {
        self.cancel.reset();
        let repeats = self.config.resynth;
        let space = ParameterSpace::from_parameters(self.problem.parameters())?;
        let mut result = ResynthResult {
            names: space.names().to_vec(),
            ..ResynthResult::default()
        };
        if repeats == 0 {
            return Ok(result);
        }
        if !self.transport.follows_problem_data() {
            return Err(FitError::invalid_option(
                "transport",
                self.transport.name(),
                "serial|pool for resynthesis",
            ));
        }

        let seed = self.config.base_seed();
        let original = self.problem.parameters().clone();
        info!("resynthesis: {} repeats (seed {})", repeats, seed);

        for iteration in 0..repeats {
            if self.cancel.is_cancelled() {
                info!("resynthesis cancelled after {} repeats", iteration);
                break;
            }
            let outcome = self.resynth_once(&space, &original, seed, iteration);
            self.problem.restore_data();
            *self.problem.parameters_mut() = original.clone();

            match outcome {
                Ok(fit) if fit.is_complete() => {
                    if let Some(store) = &self.store {
                        store.append_resynth(fit.nllf, &fit.point.to_vec())?;
                    }
                    self.hub.emit(ProgressEvent::ResynthIteration {
                        iteration,
                        nllf: Some(fit.nllf),
                    });
                    result.samples.push(ResynthSample {
                        iteration,
                        nllf: fit.nllf,
                        point: fit.point,
                    });
                }
                Ok(fit) => {
                    let message = fit.termination.to_string();
                    self.record_resynth_failure(&mut result, iteration, message)?;
                    if fit.termination == Termination::Cancelled {
                        break;
                    }
                }
                Err(FitError::Cancelled) => {
                    self.record_resynth_failure(&mut result, iteration, "cancelled".into())?;
                    break;
                }
                Err(e) => self.record_resynth_failure(&mut result, iteration, e.to_string())?,
            }
        }
        Ok(result)
    }

    fn resynth_once(
        &mut self,
        space: &ParameterSpace,
        original: &Parameters,
        seed: u64,
        iteration: usize,
    ) -> Result<FitResult> {
        let stream = RESYNTH_STREAM + iteration as u64;
        let mut rng = StdRng::seed_from_u64(derive_seed(seed, stream));
        self.problem.resynthesize(&mut rng)?;
        *self.problem.parameters_mut() = original.clone();
        let mut campaign = Campaign {
            best: None,
            best_start: None,
            steps: 0,
            posterior: None,
            checkpoint: false,
            trace: None,
        };
        self.campaign(space, derive_seed(seed, stream + 1), &mut campaign)
    }

    fn record_resynth_failure(
        &mut self,
        result: &mut ResynthResult,
        iteration: usize,
        message: String,
    ) -> Result<()> {
        warn!("resynthesis repeat {} failed: {}", iteration, message);
        if let Some(store) = &self.store {
            store.append_log(&format!("resynth {} failed: {}", iteration, message))?;
        }
        self.hub.emit(ProgressEvent::ResynthIteration {
            iteration,
            nllf: None,
        });
        result.failures.push(ResynthFailure { iteration, message });
        Ok(())
    }

    /// Evaluate the objective on an `n` x `n` grid over two fitted
    /// parameters, holding the others at their current values.
    ///
    /// Infinite bounds are replaced by the current value plus or minus the
    /// parameter's spread. The whole grid is one batch.
    pub fn mesh(&mut self, x_name: &str, y_name: &str, n: usize) -> Result<MeshScan> {
        if n < 2 {
            return Err(FitError::invalid_option("n", n, "at least 2 points per axis"));
        }
        let space = ParameterSpace::from_parameters(self.problem.parameters())?;
        let index = |name: &str| {
            space
                .names()
                .iter()
                .position(|p| p == name)
                .ok_or_else(|| {
                    FitError::invalid_option("parameter", name, space.names().join("|"))
                })
        };
        let (ix, iy) = (index(x_name)?, index(y_name)?);
        if ix == iy {
            return Err(FitError::invalid_option(
                "parameter",
                y_name,
                "a parameter different from the first",
            ));
        }

        let start = space.start();
        let axis = |i: usize| {
            let (mut lo, mut hi) = (space.lower()[i], space.upper()[i]);
            if !lo.is_finite() {
                lo = start[i] - space.scale(i);
            }
            if !hi.is_finite() {
                hi = start[i] + space.scale(i);
            }
            Array1::linspace(lo, hi, n)
        };
        let (x, y) = (axis(ix), axis(iy));

        let mut grid = Array2::zeros((n * n, space.dim()));
        for (k, mut row) in grid.rows_mut().into_iter().enumerate() {
            row.assign(&start);
            row[ix] = x[k / n];
            row[iy] = y[k % n];
        }

        let mut mapper = self.transport.start_mapper(&self.problem, &self.cancel)?;
        let mut evaluator = Evaluator::new(&space, mapper.as_mut(), self.cancel.clone());
        let values = evaluator.evaluate(&grid)?;
        let values = values
            .into_shape((n, n))
            .map_err(|e| FitError::DimensionMismatch(e.to_string()))?;

        Ok(MeshScan {
            x_name: x_name.to_string(),
            y_name: y_name.to_string(),
            x,
            y,
            values,
        })
    }
}
